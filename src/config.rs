use std::fmt::Display;
use std::fs::File;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::error;
use serde::{Deserialize, Serialize};

type Result<T> = std::result::Result<T, Error>;

const SETTINGS_FILE: &str = "settings.json";

pub(crate) const MIN_PAGE_SIZE: usize = 1;
pub(crate) const MAX_PAGE_SIZE: usize = 100;
pub(crate) const MAX_SCRAPE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub(crate) enum Error {
    Io(io::Error),
    Json(serde_json::Error),
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            Self::Io(error) => write!(f, "IO error: {}", error),
            Self::Json(error) => write!(f, "JSON error: {}", error),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Settings {
    pub(crate) download_dir: PathBuf,
    pub(crate) session_file: PathBuf,
    /// pause between downloaded items, keeps the remote side from
    /// rate limiting the scan
    pub(crate) scrape_delay: Duration,
    /// messages fetched per history request
    pub(crate) page_size: usize,
}

// default options
impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            session_file: PathBuf::from("media.session"),
            scrape_delay: Duration::from_millis(600),
            page_size: 100,
        }
    }
}

impl Settings {
    /// load settings from `dir`, falling back to persisted defaults when the
    /// file is missing or unreadable; the second value is a user facing
    /// warning when the fallback was not a clean first run
    pub(crate) fn new(dir: &Path) -> (Self, Option<String>) {
        match Settings::load(dir) {
            Ok(settings) => (settings, None),
            Err(Error::Io(ref io_error)) if io_error.kind() == ErrorKind::NotFound => {
                // expected on first launch: create & persist defaults
                (save_default(dir), None)
            }
            Err(load_error) => {
                error!("Failed to load settings: {load_error}");

                let settings_path = dir.join(SETTINGS_FILE);
                if settings_path.exists() {
                    let candidate = settings_backup_path(dir);
                    if let Err(error) = std::fs::copy(&settings_path, &candidate) {
                        error!("Failed to copy settings file: {error}");
                    }
                }

                (
                    save_default(dir),
                    Some("Failed to load settings from disk, applying default options".to_string()),
                )
            }
        }
    }

    /// load settings from file if possible
    fn load(dir: &Path) -> Result<Self> {
        let file = File::open(dir.join(SETTINGS_FILE))?;
        let mut settings: Settings = serde_json::from_reader(file)?;
        settings.normalize();
        Ok(settings)
    }

    /// save settings to file
    pub(crate) fn save(&self, dir: &Path) -> Result<()> {
        let file = File::create(dir.join(SETTINGS_FILE))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub(crate) fn page_size_bounded(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }

    pub(crate) fn normalize(&mut self) {
        self.page_size = self.page_size_bounded();
        self.scrape_delay = self.scrape_delay.min(MAX_SCRAPE_DELAY);
    }

    /// fixed name temporary file the channel preview photo lands in
    pub(crate) fn preview_file(&self) -> PathBuf {
        self.download_dir.join("__preview.jpg")
    }
}

fn settings_backup_path(dir: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    dir.join(format!("{}.backup.{}", SETTINGS_FILE, timestamp))
}

fn save_default(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.normalize();
    if let Err(save_error) = settings.save(dir) {
        error!("Failed to save default settings: {save_error}");
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_normalized_test() {
        let mut settings = Settings::default();
        settings.normalize();

        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.scrape_delay, Duration::from_millis(600));
    }

    #[test]
    fn normalize_clamps_bounds_test() {
        let mut settings = Settings {
            page_size: 100_000,
            scrape_delay: Duration::from_secs(3600),
            ..Settings::default()
        };
        settings.normalize();

        assert_eq!(settings.page_size, MAX_PAGE_SIZE);
        assert_eq!(settings.scrape_delay, MAX_SCRAPE_DELAY);

        settings.page_size = 0;
        settings.normalize();
        assert_eq!(settings.page_size, MIN_PAGE_SIZE);
    }

    #[test]
    fn save_load_round_trip_test() {
        let dir = tempfile::tempdir().unwrap();

        let settings = Settings {
            download_dir: PathBuf::from("media"),
            session_file: PathBuf::from("alt.session"),
            scrape_delay: Duration::from_millis(250),
            page_size: 50,
        };
        settings.save(dir.path()).unwrap();

        let (loaded, warning) = Settings::new(dir.path());
        assert!(warning.is_none());
        assert_eq!(loaded.download_dir, settings.download_dir);
        assert_eq!(loaded.session_file, settings.session_file);
        assert_eq!(loaded.scrape_delay, settings.scrape_delay);
        assert_eq!(loaded.page_size, settings.page_size);
    }

    #[test]
    fn first_run_creates_defaults_test() {
        let dir = tempfile::tempdir().unwrap();

        let (settings, warning) = Settings::new(dir.path());
        assert!(warning.is_none());
        assert_eq!(settings.page_size, Settings::default().page_size);
        assert!(dir.path().join(SETTINGS_FILE).exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults_test() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ not json").unwrap();

        let (settings, warning) = Settings::new(dir.path());
        assert!(warning.is_some());
        assert_eq!(settings.page_size, Settings::default().page_size);
    }
}
