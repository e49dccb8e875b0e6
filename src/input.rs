use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use kanal::{AsyncReceiver, Sender};
use log::warn;

use crate::{Event, EventBus};

/// single slot rendezvous carrying user typed strings from the shell thread
/// into the background loop
///
/// only one request may be outstanding at a time; a second concurrent
/// request is reported as an error instead of silently overwriting the slot
pub(crate) struct InputBroker {
    sender: Sender<String>,
    receiver: AsyncReceiver<String>,
    awaiting: AtomicBool,
}

// clears the awaiting flag even if the requesting task is dropped mid prompt
struct Waiting<'a>(&'a AtomicBool);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl InputBroker {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = kanal::bounded(1);

        Self {
            sender,
            receiver: receiver.to_async(),
            awaiting: AtomicBool::new(false),
        }
    }

    /// ask the user for a string and suspend until one is submitted
    ///
    /// must only be called from the background loop
    pub(crate) async fn request(&self, prompt: &str, events: &EventBus) -> Result<String> {
        if self.awaiting.swap(true, Ordering::SeqCst) {
            bail!("an input request is already outstanding");
        }

        let waiting = Waiting(&self.awaiting);

        // drain any value left over from an abandoned prompt
        while let Ok(Some(_)) = self.receiver.try_recv() {}

        events.log(prompt);
        events.send(Event::InputRequested(prompt.to_string()));

        let value = self.receiver.recv().await.context("input channel closed")?;
        drop(waiting);

        Ok(value)
    }

    /// deliver a user typed value; safe to call from any thread
    ///
    /// values submitted while no request is outstanding are discarded
    pub(crate) fn submit(&self, text: impl Into<String>) {
        if !self.awaiting.load(Ordering::SeqCst) {
            warn!("discarding submitted input, no outstanding request");
            return;
        }

        let _ = self.sender.try_send(text.into());
    }
}
