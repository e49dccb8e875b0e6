use std::fmt::Display;

use chrono::Local;
use clap::Parser;
use log::{LevelFilter, info};
use tokio::sync::mpsc::UnboundedSender;

use crate::cli::CliArgs;

mod channel;
mod cli;
mod config;
mod downloader;
mod input;
mod login;
mod runner;
mod store;
mod telegram;

pub(crate) const LOG_FILE: &str = "tele_grabber.log";

/// everything the engine reports back to the shell
#[derive(Debug, Clone)]
pub(crate) enum Event {
    /// timestamped activity line for the user facing log
    Log(String),
    /// per item download progress, 0 to 100
    Progress(f32),
    /// resolved channel name and profile photo, if one exists
    Preview {
        name: String,
        photo: Option<Vec<u8>>,
    },
    /// the engine needs a string from the user, answered via submit_input
    InputRequested(String),
    LoginFinished(bool),
    RunFinished(RunOutcome),
}

/// how a download run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// the whole history was scanned
    Completed,
    /// the scan hit messages older than the selected date
    CutoffReached,
    /// the user asked for a stop
    Stopped,
    Failed,
}

impl RunOutcome {
    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CutoffReached)
    }
}

/// sending half of the engine to shell event stream
#[derive(Clone)]
pub(crate) struct EventBus {
    sender: UnboundedSender<Event>,
}

impl EventBus {
    pub(crate) fn new(sender: UnboundedSender<Event>) -> Self {
        Self { sender }
    }

    /// queue a timestamped line for the shell's activity log
    pub(crate) fn log(&self, message: impl Display) {
        let line = format!("[{}] {}", Local::now().format("%H:%M:%S"), message);
        info!("{message}");
        let _ = self.sender.send(Event::Log(line));
    }

    pub(crate) fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
pub(crate) fn event_bus() -> (EventBus, tokio::sync::mpsc::UnboundedReceiver<Event>) {
    let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
    (EventBus::new(sender), receiver)
}

fn main() -> anyhow::Result<()> {
    if let Err(error) = simple_logging::log_to_file(LOG_FILE, LevelFilter::Info) {
        eprintln!("could not open {LOG_FILE}: {error}");
    }
    log_panics::init();

    cli::run(CliArgs::parse())
}
