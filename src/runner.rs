use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::error;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelRef, load_preview};
use crate::config::Settings;
use crate::downloader::download;
use crate::input::InputBroker;
use crate::login::login;
use crate::store::{CredentialStore, Credentials};
use crate::telegram::ChannelApi;
use crate::{Event, EventBus, RunOutcome};

/// builds a fresh remote client for a login attempt
pub(crate) type Connector =
    Box<dyn Fn(&Credentials, &Settings) -> Result<Arc<dyn ChannelApi>> + Send + Sync>;

/// owns the single background event loop and the state shared with it
///
/// every operation is scheduled onto the loop and reports back through the
/// event channel; nothing here ever blocks the calling thread
pub(crate) struct Engine {
    handle: Handle,
    shutdown: CancellationToken,
    loop_thread: Option<JoinHandle<()>>,
    events: EventBus,
    broker: Arc<InputBroker>,
    store: Arc<CredentialStore>,
    settings: Arc<Settings>,
    connector: Arc<Connector>,
    session: Arc<Mutex<Option<Arc<dyn ChannelApi>>>>,
    running: Arc<AtomicBool>,
}

impl Engine {
    /// spin up the background loop thread; the returned receiver carries
    /// every event the engine emits and is polled by the shell
    pub(crate) fn new(
        settings: Settings,
        store: CredentialStore,
        connector: Connector,
    ) -> Result<(Self, UnboundedReceiver<Event>)> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("could not build the background runtime")?;

        let handle = runtime.handle().clone();
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        let loop_thread = std::thread::Builder::new()
            .name("engine-loop".to_string())
            .spawn(move || runtime.block_on(token.cancelled()))
            .context("could not spawn the background loop thread")?;

        let (sender, receiver) = unbounded_channel();

        let engine = Self {
            handle,
            shutdown,
            loop_thread: Some(loop_thread),
            events: EventBus::new(sender),
            broker: Arc::new(InputBroker::new()),
            store: Arc::new(store),
            settings: Arc::new(settings),
            connector: Arc::new(connector),
            session: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
        };

        Ok((engine, receiver))
    }

    /// load stored credentials for the shell to prefill, degrading to
    /// defaults when the store cannot be decrypted
    pub(crate) fn load_credentials(&self) -> Credentials {
        match self.store.load() {
            Ok(credentials) => credentials,
            Err(error) => {
                self.events.log(format!("{error}"));
                Credentials::default()
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.session.lock().unwrap().is_some()
    }

    /// forward a user typed value to whichever prompt is waiting for it
    pub(crate) fn submit_input(&self, text: &str) {
        self.broker.submit(text);
    }

    /// schedule a login attempt on the background loop
    pub(crate) fn login(&self, credentials: Credentials) {
        let events = self.events.clone();
        let broker = self.broker.clone();
        let store = self.store.clone();
        let settings = self.settings.clone();
        let connector = self.connector.clone();
        let session = self.session.clone();

        self.handle.spawn(async move {
            events.log("logging in...");

            let attempt = async {
                let api = (*connector)(&credentials, &settings)?;
                login(api.as_ref(), &broker, &store, &credentials, &events).await?;
                Ok::<_, anyhow::Error>(api)
            };

            match attempt.await {
                Ok(api) => {
                    *session.lock().unwrap() = Some(api);
                    events.send(Event::LoginFinished(true));
                }
                Err(login_error) => {
                    events.log(format!("login failed: {login_error:#}"));
                    error!("login failed: {login_error:?}");
                    events.send(Event::LoginFinished(false));
                }
            }
        });
    }

    /// schedule the resolve / preview / download sequence as one task
    ///
    /// refused with an error event when no session exists or a run is
    /// already active
    pub(crate) fn start(&self, source: ChannelRef, cutoff: Option<NaiveDate>) {
        let api = match self.session.lock().unwrap().clone() {
            Some(api) => api,
            None => {
                self.events.log("login required before starting a download");
                return;
            }
        };

        if self.running.swap(true, Ordering::SeqCst) {
            self.events.log("a download is already running");
            return;
        }

        let events = self.events.clone();
        let settings = self.settings.clone();
        let running = self.running.clone();

        self.handle.spawn(async move {
            let outcome = match run(api.as_ref(), &source, cutoff, &running, &settings, &events).await
            {
                Ok(outcome) => outcome,
                Err(run_error) => {
                    events.log(format!("error: {run_error:#}"));
                    error!("download run failed: {run_error:?}");
                    RunOutcome::Failed
                }
            };

            // the flag resets no matter how the run ended
            running.store(false, Ordering::SeqCst);
            events.send(Event::RunFinished(outcome));
        });
    }

    /// request a cooperative stop; the scan ends at its next checkpoint
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.events.log("stop requested");
    }

    /// schedule a resolve + preview pass without downloading anything
    pub(crate) fn preview(&self, source: ChannelRef) {
        let api = match self.session.lock().unwrap().clone() {
            Some(api) => api,
            None => {
                self.events.log("login required before loading a preview");
                return;
            }
        };

        let events = self.events.clone();
        let settings = self.settings.clone();

        self.handle.spawn(async move {
            match api.resolve(&source).await {
                Ok(Some(channel)) => {
                    events.log(format!("resolved: {}", channel.title));
                    load_preview(api.as_ref(), &source, &settings.preview_file(), &events).await;
                }
                _ => events.log("cannot resolve channel"),
            }
        });
    }
}

/// the connect / verify / preview / download sequence for one run
async fn run(
    api: &dyn ChannelApi,
    source: &ChannelRef,
    cutoff: Option<NaiveDate>,
    running: &AtomicBool,
    settings: &Settings,
    events: &EventBus,
) -> Result<RunOutcome> {
    events.log("connecting...");

    let channel = match api.resolve(source).await? {
        Some(channel) => channel,
        None => {
            events.log("cannot access channel");
            return Ok(RunOutcome::Failed);
        }
    };

    load_preview(api, source, &settings.preview_file(), events).await;

    download(api, &channel, cutoff, running, settings, events).await
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();

        if let Some(thread) = self.loop_thread.take() {
            let _ = thread.join();
        }
    }
}
