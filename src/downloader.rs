use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::debug;
use tokio::fs::create_dir_all;
use tokio::time::sleep;

use crate::config::Settings;
use crate::telegram::{AttachmentKind, ChannelApi, ChannelHandle};
use crate::{Event, EventBus, RunOutcome};

/// scan a channel's history newest to oldest and download every real media
/// attachment at or after the cutoff date
///
/// the running flag is checked before each candidate message, so a stop
/// request takes effect at the next item boundary rather than mid transfer
pub(crate) async fn download(
    api: &dyn ChannelApi,
    channel: &ChannelHandle,
    cutoff: Option<NaiveDate>,
    running: &AtomicBool,
    settings: &Settings,
    events: &EventBus,
) -> Result<RunOutcome> {
    create_dir_all(&settings.download_dir)
        .await
        .context("could not create the download directory")?;

    events.log(format!("downloading from {}", channel.title));

    let limit = settings.page_size_bounded();
    let mut offset_id = 0;

    loop {
        let page = api.history_page(channel, offset_id, limit).await?;
        if page.is_empty() {
            break;
        }

        for message in page {
            offset_id = message.id;

            if !running.load(Ordering::SeqCst) {
                events.log("stopped");
                return Ok(RunOutcome::Stopped);
            }

            // link previews are pseudo media; skip them before the date
            // check so their timestamps never end the scan
            let attachment = match message.attachment {
                None | Some(AttachmentKind::WebPagePreview) => continue,
                Some(attachment) => attachment,
            };

            // compare calendar dates only, in UTC
            let day = message.date.date_naive();

            if let Some(cutoff) = cutoff {
                if day < cutoff {
                    events.log("reached messages older than the selected date, stopping");
                    return Ok(RunOutcome::CutoffReached);
                }
            }

            debug!("downloading message {} ({:?}, {day})", message.id, attachment);
            events.send(Event::Progress(0.0));

            let stem = settings.download_dir.join(format!("{day}_{}", message.id));

            let progress = |done: u64, total: u64| {
                if total > 0 {
                    events.send(Event::Progress(done as f32 / total as f32 * 100.0));
                }
            };

            let path = api
                .fetch_media(channel, message.id, &stem, &progress)
                .await
                .with_context(|| format!("downloading media from message {}", message.id))?;

            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            events.log(format!("downloaded {name}"));

            sleep(settings.scrape_delay).await;
        }
    }

    events.log("done");
    Ok(RunOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::event_bus;
    use crate::telegram::fake::{FakeApi, message};

    fn channel() -> ChannelHandle {
        ChannelHandle {
            id: -1001234567890,
            title: "test channel".to_string(),
        }
    }

    fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            download_dir: dir.to_path_buf(),
            scrape_delay: Duration::from_millis(0),
            ..Settings::default()
        }
    }

    fn running() -> AtomicBool {
        AtomicBool::new(true)
    }

    #[tokio::test]
    async fn downloads_whole_history_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi::authorized_with(
            channel(),
            vec![
                message(3, (2024, 5, 10), Some(AttachmentKind::Photo)),
                message(2, (2024, 5, 8), Some(AttachmentKind::Document)),
                message(1, (2024, 5, 1), Some(AttachmentKind::Photo)),
            ],
        );

        let outcome = download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(api.downloaded(), [3, 2, 1]);
    }

    #[tokio::test]
    async fn cutoff_stops_the_scan_early_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi::authorized_with(
            channel(),
            vec![
                message(3, (2024, 5, 10), Some(AttachmentKind::Photo)),
                message(2, (2024, 5, 8), Some(AttachmentKind::Photo)),
                message(1, (2024, 5, 1), Some(AttachmentKind::Photo)),
            ],
        );

        let cutoff = NaiveDate::from_ymd_opt(2024, 5, 5).unwrap();

        let outcome = download(
            &api,
            &channel(),
            Some(cutoff),
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::CutoffReached);
        // the message behind the cutoff is never fetched
        assert_eq!(api.downloaded(), [3, 2]);
    }

    #[tokio::test]
    async fn clearing_the_flag_stops_before_the_next_candidate_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut receiver) = event_bus();

        let running = Arc::new(AtomicBool::new(true));

        let api = FakeApi {
            // the flag is cleared while message 3 downloads
            stop_after: Some((3, running.clone())),
            ..FakeApi::authorized_with(
                channel(),
                vec![
                    message(3, (2024, 5, 10), Some(AttachmentKind::Photo)),
                    message(2, (2024, 5, 8), Some(AttachmentKind::Photo)),
                    message(1, (2024, 5, 1), Some(AttachmentKind::Photo)),
                ],
            )
        };

        let outcome = download(
            &api,
            &channel(),
            None,
            &running,
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Stopped);
        assert_eq!(api.downloaded(), [3]);

        // a stop is reported, not an error
        let mut saw_stopped = false;
        while let Ok(event) = receiver.try_recv() {
            if let Event::Log(line) = event {
                assert!(!line.contains("error"));
                saw_stopped |= line.contains("stopped");
            }
        }
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn web_page_previews_are_skipped_before_the_date_check_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        // the preview's date is behind the cutoff; if the date were checked
        // first the scan would end before message 1 is ever seen
        let api = FakeApi::authorized_with(
            channel(),
            vec![
                message(3, (2024, 5, 10), Some(AttachmentKind::Photo)),
                message(2, (2024, 5, 4), Some(AttachmentKind::WebPagePreview)),
                message(1, (2024, 5, 8), Some(AttachmentKind::Photo)),
            ],
        );

        let cutoff = NaiveDate::from_ymd_opt(2024, 5, 5).unwrap();

        let outcome = download(
            &api,
            &channel(),
            Some(cutoff),
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(api.downloaded(), [3, 1]);
    }

    #[tokio::test]
    async fn messages_without_media_are_skipped_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi::authorized_with(
            channel(),
            vec![
                message(3, (2024, 5, 10), None),
                message(2, (2024, 5, 8), Some(AttachmentKind::Document)),
                message(1, (2024, 5, 1), None),
            ],
        );

        let outcome = download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(api.downloaded(), [2]);
    }

    #[tokio::test]
    async fn filenames_carry_date_and_message_id_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi::authorized_with(
            channel(),
            vec![message(77, (2024, 5, 10), Some(AttachmentKind::Photo))],
        );

        download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        assert!(dir.path().join("2024-05-10_77.bin").exists());
    }

    #[tokio::test]
    async fn item_failure_aborts_the_run_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi {
            fail_download: Some(2),
            ..FakeApi::authorized_with(
                channel(),
                vec![
                    message(3, (2024, 5, 10), Some(AttachmentKind::Photo)),
                    message(2, (2024, 5, 8), Some(AttachmentKind::Photo)),
                    message(1, (2024, 5, 1), Some(AttachmentKind::Photo)),
                ],
            )
        };

        let result = download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(api.downloaded(), [3]);
    }

    #[tokio::test]
    async fn progress_is_fractional_and_absent_when_size_unknown_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, mut receiver) = event_bus();

        let api = FakeApi {
            media_total: 1000,
            ..FakeApi::authorized_with(
                channel(),
                vec![message(1, (2024, 5, 10), Some(AttachmentKind::Document))],
            )
        };

        download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        let mut percents = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let Event::Progress(percent) = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, [0.0, 50.0, 100.0]);

        // unknown total: only the reset event is emitted
        let (events, mut receiver) = event_bus();
        let api = FakeApi::authorized_with(
            channel(),
            vec![message(1, (2024, 5, 10), Some(AttachmentKind::Document))],
        );

        download(
            &api,
            &channel(),
            None,
            &running(),
            &test_settings(dir.path()),
            &events,
        )
        .await
        .unwrap();

        let mut percents = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let Event::Progress(percent) = event {
                percents.push(percent);
            }
        }
        assert_eq!(percents, [0.0]);
    }

    #[tokio::test]
    async fn pagination_walks_the_full_history_test() {
        let dir = tempfile::tempdir().unwrap();
        let (events, _receiver) = event_bus();

        let api = FakeApi::authorized_with(
            channel(),
            vec![
                message(4, (2024, 5, 10), Some(AttachmentKind::Photo)),
                message(3, (2024, 5, 9), Some(AttachmentKind::Photo)),
                message(2, (2024, 5, 8), Some(AttachmentKind::Photo)),
                message(1, (2024, 5, 7), Some(AttachmentKind::Photo)),
            ],
        );

        let settings = Settings {
            page_size: 2,
            ..test_settings(dir.path())
        };

        let outcome = download(&api, &channel(), None, &running(), &settings, &events)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(api.downloaded(), [4, 3, 2, 1]);
        // pages were requested from the top, then below each batch
        assert_eq!(*api.page_requests.lock().unwrap(), [0, 3, 1]);
    }
}
