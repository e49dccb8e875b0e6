use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grammers_client::types::{Chat, Downloadable, LoginToken, Media, Message, PasswordToken};
use grammers_client::{Client, Config, InitParams, SignInError};
use grammers_session::Session;
use log::debug;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::channel::ChannelRef;

/// a resolved channel, refetched each run and never cached to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelHandle {
    pub(crate) id: i64,
    pub(crate) title: String,
}

/// what a scanned message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttachmentKind {
    Photo,
    Document,
    /// link preview pseudo media, not a downloadable file
    WebPagePreview,
}

/// one message as seen by the history scan
#[derive(Debug, Clone)]
pub(crate) struct ScanMessage {
    pub(crate) id: i32,
    pub(crate) date: DateTime<Utc>,
    pub(crate) attachment: Option<AttachmentKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignInOutcome {
    Authorized,
    /// the account has 2FA enabled, a password must follow
    PasswordNeeded,
}

pub(crate) type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// everything the engine needs from the remote messaging service
#[async_trait]
pub(crate) trait ChannelApi: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn is_authorized(&self) -> Result<bool>;

    /// ask the service to send a login code to the phone
    async fn request_login_code(&self, phone: &str) -> Result<()>;

    async fn sign_in_code(&self, code: &str) -> Result<SignInOutcome>;

    async fn sign_in_password(&self, password: &str) -> Result<()>;

    async fn save_session(&self) -> Result<()>;

    /// look up a channel; absence, not an error, on any lookup failure
    async fn resolve(&self, source: &ChannelRef) -> Result<Option<ChannelHandle>>;

    /// one batch of history, newest to oldest, starting below `offset_id`
    /// (0 means the top of the history); an empty batch ends the scan
    async fn history_page(
        &self,
        channel: &ChannelHandle,
        offset_id: i32,
        limit: usize,
    ) -> Result<Vec<ScanMessage>>;

    /// download one message's media next to `dest_stem`, the extension is
    /// chosen from the media type; progress is (bytes done, bytes total)
    async fn fetch_media(
        &self,
        channel: &ChannelHandle,
        message_id: i32,
        dest_stem: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf>;

    /// fetch the channel's profile photo, if it has one
    async fn profile_photo(&self, channel: &ChannelHandle, dest: &Path)
    -> Result<Option<PathBuf>>;
}

/// MTProto client wrapper
///
/// construction is cheap; the TCP handshake happens in `connect`
pub(crate) struct TelegramClient {
    api_id: i32,
    api_hash: String,
    session_file: PathBuf,
    client: Mutex<Option<Client>>,
    login_token: Mutex<Option<LoginToken>>,
    password_token: Mutex<Option<PasswordToken>>,
    // resolved chats and the current history page, kept so later calls can
    // reuse the full service objects behind the plain handles
    chats: Mutex<HashMap<i64, Chat>>,
    messages: Mutex<HashMap<i32, Message>>,
}

impl TelegramClient {
    pub(crate) fn new(api_id: i32, api_hash: &str, session_file: PathBuf) -> Self {
        Self {
            api_id,
            api_hash: api_hash.to_string(),
            session_file,
            client: Mutex::new(None),
            login_token: Mutex::new(None),
            password_token: Mutex::new(None),
            chats: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self) -> Result<Client> {
        self.client.lock().unwrap().clone().context("not connected")
    }

    fn chat(&self, id: i64) -> Result<Chat> {
        self.chats
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .context("channel was not resolved")
    }

    /// walk the account's dialogs looking for a canonical channel id
    async fn find_dialog(&self, client: &Client, id: i64) -> Option<Chat> {
        let bare = bare_id(id);
        let mut dialogs = client.iter_dialogs();

        while let Ok(Some(dialog)) = dialogs.next().await {
            let chat = dialog.chat();
            if chat.id() == bare || chat.id() == id {
                return Some(chat.clone());
            }
        }

        None
    }

    /// stream a downloadable into `dest`, reporting byte counts as chunks land
    async fn download_to(
        &self,
        client: &Client,
        downloadable: &Downloadable,
        dest: &Path,
        total: u64,
        progress: ProgressFn<'_>,
    ) -> Result<()> {
        let mut file = File::create(dest)
            .await
            .with_context(|| format!("creating {:?}", dest))?;

        let mut downloaded = 0u64;
        let mut chunks = client.iter_download(downloadable);

        while let Some(chunk) = chunks.next().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            progress(downloaded, total);
        }

        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelApi for TelegramClient {
    async fn connect(&self) -> Result<()> {
        let session = Session::load_file_or_create(&self.session_file)
            .context("could not load the session file")?;

        let client = Client::connect(Config {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .context("connection failed")?;

        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool> {
        Ok(self.client()?.is_authorized().await?)
    }

    async fn request_login_code(&self, phone: &str) -> Result<()> {
        let token = self
            .client()?
            .request_login_code(phone)
            .await
            .context("could not request a login code")?;

        *self.login_token.lock().unwrap() = Some(token);
        Ok(())
    }

    async fn sign_in_code(&self, code: &str) -> Result<SignInOutcome> {
        let token = self
            .login_token
            .lock()
            .unwrap()
            .take()
            .context("no login code was requested")?;

        match self.client()?.sign_in(&token, code).await {
            Ok(_user) => Ok(SignInOutcome::Authorized),
            Err(SignInError::PasswordRequired(password_token)) => {
                *self.password_token.lock().unwrap() = Some(password_token);
                Ok(SignInOutcome::PasswordNeeded)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn sign_in_password(&self, password: &str) -> Result<()> {
        let token = self
            .password_token
            .lock()
            .unwrap()
            .take()
            .context("no 2FA password was requested")?;

        self.client()?.check_password(token, password).await?;
        Ok(())
    }

    async fn save_session(&self) -> Result<()> {
        self.client()?
            .session()
            .save_to_file(&self.session_file)
            .context("could not save the session file")?;
        Ok(())
    }

    async fn resolve(&self, source: &ChannelRef) -> Result<Option<ChannelHandle>> {
        let client = match self.client() {
            Ok(client) => client,
            Err(_) => return Ok(None),
        };

        let chat = match source {
            ChannelRef::Handle(name) => client
                .resolve_username(name.trim_start_matches('@'))
                .await
                .ok()
                .flatten(),
            ChannelRef::Id(id) => self.find_dialog(&client, *id).await,
            ChannelRef::Raw(_) => None,
        };

        Ok(chat.map(|chat| {
            let handle = ChannelHandle {
                id: chat.id(),
                title: chat.name().to_string(),
            };

            debug!("resolved {} to {:?}", source, handle.title);
            self.chats.lock().unwrap().insert(chat.id(), chat);
            handle
        }))
    }

    async fn history_page(
        &self,
        channel: &ChannelHandle,
        offset_id: i32,
        limit: usize,
    ) -> Result<Vec<ScanMessage>> {
        let client = self.client()?;
        let chat = self.chat(channel.id)?;

        let mut iter = client.iter_messages(chat.pack()).limit(limit);
        if offset_id > 0 {
            iter = iter.offset_id(offset_id);
        }

        let mut page = Vec::new();
        let mut fetched = Vec::new();

        while let Some(message) = iter.next().await? {
            page.push(ScanMessage {
                id: message.id(),
                date: message.date(),
                attachment: message.media().and_then(|media| attachment_kind(&media)),
            });
            fetched.push(message);
        }

        // the page cache only needs to cover the batch being processed
        let mut cache = self.messages.lock().unwrap();
        cache.clear();
        for message in fetched {
            cache.insert(message.id(), message);
        }

        Ok(page)
    }

    async fn fetch_media(
        &self,
        _channel: &ChannelHandle,
        message_id: i32,
        dest_stem: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf> {
        let client = self.client()?;

        let message = self
            .messages
            .lock()
            .unwrap()
            .get(&message_id)
            .cloned()
            .context("message is not part of the current page")?;

        let media = message.media().context("message has no media")?;

        let mut dest = dest_stem.as_os_str().to_owned();
        dest.push(media_extension(&media));
        let dest = PathBuf::from(dest);

        let total = media_size(&media);
        self.download_to(&client, &Downloadable::Media(media), &dest, total, progress)
            .await?;

        Ok(dest)
    }

    async fn profile_photo(
        &self,
        channel: &ChannelHandle,
        dest: &Path,
    ) -> Result<Option<PathBuf>> {
        let client = self.client()?;
        let chat = self.chat(channel.id)?;

        let photo = match chat.photo_downloadable(false) {
            Some(photo) => photo,
            None => return Ok(None),
        };

        self.download_to(&client, &photo, dest, 0, &|_, _| {})
            .await?;

        Ok(Some(dest.to_path_buf()))
    }
}

/// strip the canonical `-100` prefix back to the service's bare id
fn bare_id(id: i64) -> i64 {
    let text = id.to_string();

    match text.strip_prefix("-100") {
        Some(rest) => rest.parse().unwrap_or(id),
        None => id,
    }
}

fn attachment_kind(media: &Media) -> Option<AttachmentKind> {
    match media {
        Media::Photo(_) => Some(AttachmentKind::Photo),
        Media::Document(_) => Some(AttachmentKind::Document),
        Media::Sticker(_) => Some(AttachmentKind::Document),
        Media::WebPage(_) => Some(AttachmentKind::WebPagePreview),
        // contacts, polls, locations and the like carry nothing downloadable
        _ => None,
    }
}

fn media_size(media: &Media) -> u64 {
    match media {
        Media::Document(document) => document.size().max(0) as u64,
        // photo sizes are not reported up front
        _ => 0,
    }
}

/// pick a file extension for the media type
fn media_extension(media: &Media) -> String {
    match media {
        Media::Photo(_) => ".jpg".to_string(),
        Media::Sticker(_) => ".webp".to_string(),
        Media::Document(document) => {
            // prefer the extension of the original file name
            if let Some(extension) = Path::new(document.name())
                .extension()
                .and_then(|extension| extension.to_str())
            {
                return format!(".{}", extension);
            }

            match document.mime_type() {
                Some("image/jpeg") => ".jpg",
                Some("image/png") => ".png",
                Some("image/gif") => ".gif",
                Some("image/webp") => ".webp",
                Some("video/mp4") => ".mp4",
                Some("video/webm") => ".webm",
                Some("audio/mpeg") => ".mp3",
                Some("audio/ogg") => ".ogg",
                Some("application/pdf") => ".pdf",
                _ => ".bin",
            }
            .to_string()
        }
        _ => ".bin".to_string(),
    }
}
