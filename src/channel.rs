use std::fmt::Display;
use std::path::Path;

use log::warn;

use crate::telegram::ChannelApi;
use crate::{Event, EventBus};

/// a normalized channel identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelRef {
    /// public handle, `@` included
    Handle(String),
    /// canonical prefixed numeric id
    Id(i64),
    /// unparseable input passed through untouched
    Raw(String),
}

impl Display for ChannelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handle(name) => write!(f, "{}", name),
            Self::Id(id) => write!(f, "{}", id),
            Self::Raw(raw) => write!(f, "{}", raw),
        }
    }
}

/// turn raw user input into its canonical addressing form
///
/// numeric input gets the broadcast/supergroup prefix applied, handles and
/// anything unparseable pass through unchanged
pub(crate) fn normalize(raw: &str) -> ChannelRef {
    let trimmed = raw.trim();

    if trimmed.starts_with('@') {
        return ChannelRef::Handle(trimmed.to_string());
    }

    match trimmed.parse::<i64>() {
        Ok(num) => ChannelRef::Id(canonical_id(num)),
        Err(_) => ChannelRef::Raw(trimmed.to_string()),
    }
}

/// apply the `-100` channel prefix to a bare numeric id
fn canonical_id(num: i64) -> i64 {
    let text = num.to_string();

    if text.starts_with("-100") {
        num
    } else if let Some(rest) = text.strip_prefix('-') {
        format!("-100{rest}").parse().unwrap_or(num)
    } else {
        format!("-100{text}").parse().unwrap_or(num)
    }
}

/// resolve the channel and push its title and profile photo to the shell
///
/// photo fetch failures degrade to the explicit no photo form and never
/// abort resolution
pub(crate) async fn load_preview(
    api: &dyn ChannelApi,
    source: &ChannelRef,
    photo_file: &Path,
    events: &EventBus,
) {
    let channel = match api.resolve(source).await {
        Ok(Some(channel)) => channel,
        _ => {
            events.log("preview load failed");
            return;
        }
    };

    if let Some(parent) = photo_file.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }

    let photo = match api.profile_photo(&channel, photo_file).await {
        Ok(Some(path)) => tokio::fs::read(path).await.ok(),
        Ok(None) => None,
        Err(error) => {
            warn!("profile photo fetch failed: {error:#}");
            None
        }
    };

    events.send(Event::Preview {
        name: channel.title.clone(),
        photo,
    });
}
