use std::io::{BufRead, Write, stdin, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, channel};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use crate::channel::normalize;
use crate::config::Settings;
use crate::runner::{Connector, Engine};
use crate::store::{CredentialStore, Credentials};
use crate::telegram::{ChannelApi, TelegramClient};
use crate::{Event, LOG_FILE};

/// how often the shell drains the event queue
const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tele-grabber",
    version,
    about = "Bulk media downloader for Telegram channels"
)]
pub(crate) struct CliArgs {
    /// Channel to download from: @handle or numeric id
    #[arg(help = "Channel to download from: @handle or numeric id")]
    pub(crate) channel: String,

    /// Only download media posted on or after this date (YYYY-MM-DD)
    #[arg(
        long,
        help = "Only download media posted on or after this date (YYYY-MM-DD)"
    )]
    pub(crate) from_date: Option<String>,

    /// Resolve the channel and show its preview without downloading
    #[arg(
        long,
        help = "Resolve the channel and show its preview without downloading"
    )]
    pub(crate) preview_only: bool,

    /// Telegram API id, falls back to the stored value
    #[arg(long, help = "Telegram API id, falls back to the stored value")]
    pub(crate) api_id: Option<i32>,

    /// Telegram API hash, falls back to the stored value
    #[arg(long, help = "Telegram API hash, falls back to the stored value")]
    pub(crate) api_hash: Option<String>,

    /// Phone number in international format, falls back to the stored value
    #[arg(
        long,
        help = "Phone number in international format, falls back to the stored value"
    )]
    pub(crate) phone: Option<String>,

    /// Directory holding settings, keys and the session file
    #[arg(long, help = "Directory holding settings, keys and the session file")]
    pub(crate) data_dir: Option<PathBuf>,
}

impl CliArgs {
    fn cutoff(&self) -> Result<Option<NaiveDate>> {
        self.from_date
            .as_deref()
            .map(|date| {
                NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .with_context(|| format!("invalid date: {date}"))
            })
            .transpose()
    }
}

/// stored credentials overridden by whatever was passed on the command line
fn merge_credentials(stored: Credentials, args: &CliArgs) -> Credentials {
    Credentials {
        api_id: args.api_id.unwrap_or(stored.api_id),
        api_hash: args.api_hash.clone().unwrap_or(stored.api_hash),
        phone: args.phone.clone().unwrap_or(stored.phone),
    }
}

/// prompt on the terminal for whatever the merge left empty
fn fill_missing(credentials: &mut Credentials) -> Result<()> {
    if credentials.api_id == 0 {
        credentials.api_id = ask("API id: ")?
            .parse()
            .context("the API id must be a number")?;
    }

    if credentials.api_hash.is_empty() {
        credentials.api_hash = ask("API hash: ")?;
    }

    if credentials.phone.is_empty() {
        credentials.phone = ask("Phone: ")?;
    }

    Ok(())
}

fn ask(prompt: &str) -> Result<String> {
    print!("{prompt}");
    stdout().flush()?;

    let mut line = String::new();
    stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// forward terminal lines without blocking the poll loop
fn stdin_lines() -> Receiver<String> {
    let (sender, receiver) = channel();

    thread::spawn(move || {
        for line in stdin().lock().lines() {
            let Ok(line) = line else { break };
            if sender.send(line).is_err() {
                break;
            }
        }
    });

    receiver
}

/// run a download from the terminal
///
/// this is the same engine a graphical shell would drive: it polls the
/// event queue on a fixed interval and feeds typed lines back in, either
/// as answers to login prompts or as the stop command
pub(crate) fn run(args: CliArgs) -> Result<()> {
    let cutoff = args.cutoff()?;
    let source = normalize(&args.channel);

    let data_dir = args.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&data_dir)?;

    let (mut settings, warning) = Settings::new(&data_dir);
    if let Some(warning) = warning {
        eprintln!("{warning}");
    }

    // relative paths in the settings file are anchored at the data dir
    if settings.session_file.is_relative() {
        settings.session_file = data_dir.join(&settings.session_file);
    }
    if settings.download_dir.is_relative() {
        settings.download_dir = data_dir.join(&settings.download_dir);
    }

    let store = CredentialStore::open(&data_dir)?;

    let connector: Connector = Box::new(|credentials, settings| {
        Ok(Arc::new(TelegramClient::new(
            credentials.api_id,
            &credentials.api_hash,
            settings.session_file.clone(),
        )) as Arc<dyn ChannelApi>)
    });

    let (engine, mut events) = Engine::new(settings, store, connector)?;

    let mut credentials = merge_credentials(engine.load_credentials(), &args);
    if !credentials.is_complete() {
        fill_missing(&mut credentials)?;
    }

    // everything typed from here on goes through the engine
    let lines = stdin_lines();

    let pb = ProgressBar::new(100);
    pb.set_style(ProgressStyle::with_template("{bar:40} {pos:>3}%")?.progress_chars("=>-"));

    engine.login(credentials);

    let mut awaiting_input = false;

    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                Event::Log(line) => {
                    if line.contains("cannot access channel") && args.preview_only {
                        bail!("cannot resolve channel: {}", args.channel);
                    }

                    pb.println(line);
                }
                Event::Progress(percent) => {
                    pb.set_position(percent as u64);
                }
                Event::Preview { name, photo } => {
                    match photo {
                        Some(photo) => {
                            pb.println(format!("channel: {name} ({} byte photo)", photo.len()))
                        }
                        None => pb.println(format!("channel: {name} (no photo)")),
                    }

                    if args.preview_only {
                        pb.finish_and_clear();
                        return Ok(());
                    }
                }
                Event::InputRequested(_prompt) => {
                    // the prompt text already went out as a log line
                    awaiting_input = true;
                }
                Event::LoginFinished(true) => {
                    if args.preview_only {
                        engine.preview(source.clone());
                    } else {
                        engine.start(source.clone(), cutoff);
                    }
                }
                Event::LoginFinished(false) => {
                    bail!("login failed, see {LOG_FILE} for details");
                }
                Event::RunFinished(outcome) => {
                    pb.finish_and_clear();

                    if outcome.is_success() {
                        println!("Download complete");
                        return Ok(());
                    }

                    if outcome == crate::RunOutcome::Stopped {
                        println!("Stopped");
                        return Ok(());
                    }

                    bail!("download failed, see {LOG_FILE} for details");
                }
            }
        }

        while let Ok(line) = lines.try_recv() {
            let line = line.trim();

            if awaiting_input {
                engine.submit_input(line);
                awaiting_input = false;
            } else if line.eq_ignore_ascii_case("stop") {
                engine.stop();
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}
