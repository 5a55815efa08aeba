//! Configuration file loading.
//!
//! The CLI reads an INI file (by default `~/.config/shardfetch/config.ini`):
//!
//! ```ini
//! [downloads]
//! state_dir = /var/lib/shardfetch
//! archive_dir = /var/lib/shardfetch/shards
//! sink = chunked
//! read_timeout_secs = 60
//! max_attempts = 5
//!
//! [logging]
//! filter = shardfetch=info
//! directory = /var/log/shardfetch
//! ```
//!
//! Missing keys keep their defaults. Command-line flags override the file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use shardfetch::logging::LogConfig;
use shardfetch::{DownloaderConfig, RetryPolicy, SinkKind, ValidationPolicy};

use crate::error::CliError;

const DOWNLOADS_SECTION: &str = "downloads";
const LOGGING_SECTION: &str = "logging";

/// Default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("shardfetch").join("config.ini"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shardfetch")
}

/// Settings assembled from the configuration file.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// Downloader settings.
    pub downloader: DownloaderConfig,
    /// Directory completed archives are imported into.
    pub archive_dir: PathBuf,
    /// Logging settings.
    pub logging: LogConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            downloader: DownloaderConfig::new(data_dir.join("state")),
            archive_dir: data_dir.join("shards"),
            logging: LogConfig::default(),
        }
    }
}

impl CliConfig {
    /// Loads the configuration.
    ///
    /// An explicit `path` must exist; a missing default file yields the
    /// defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let ini = Ini::load_from_file(&path).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_ini(&ini)
    }

    /// Builds the configuration from parsed INI content.
    pub fn from_ini(ini: &Ini) -> Result<Self, CliError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some(DOWNLOADS_SECTION)) {
            config.apply_downloads(section)?;
        }
        if let Some(section) = ini.section(Some(LOGGING_SECTION)) {
            if let Some(filter) = section.get("filter") {
                config.logging = config.logging.with_filter(filter);
            }
            if let Some(dir) = section.get("directory") {
                config.logging = config.logging.with_log_dir(dir);
            }
        }

        Ok(config)
    }

    fn apply_downloads(&mut self, section: &Properties) -> Result<(), CliError> {
        let mut downloader = self.downloader.clone();

        if let Some(dir) = section.get("state_dir") {
            downloader.state_dir = PathBuf::from(dir);
        }
        if let Some(dir) = section.get("chunk_dir") {
            downloader = downloader.with_chunk_dir(dir);
        }
        if let Some(dir) = section.get("archive_dir") {
            self.archive_dir = PathBuf::from(dir);
        }
        if let Some(sink) = section.get("sink") {
            let sink = SinkKind::from_str(sink).map_err(|e| CliError::Config(format!("sink: {}", e)))?;
            downloader = downloader.with_sink(sink);
        }
        if let Some(limit) = parse_key::<u32>(section, "chunk_limit")? {
            if limit == 0 {
                return Err(CliError::Config("chunk_limit must be positive".to_string()));
            }
            downloader = downloader.with_chunk_limit(limit);
        }
        if let Some(secs) = parse_key::<u64>(section, "connect_timeout_secs")? {
            downloader = downloader.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_key::<u64>(section, "read_timeout_secs")? {
            downloader = downloader.with_read_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = parse_key::<u32>(section, "max_attempts")? {
            downloader = downloader.with_retry(RetryPolicy::exponential(attempts));
        }
        if let Some(attempts) = parse_key::<u32>(section, "validation_attempts")? {
            downloader = downloader.with_validation(ValidationPolicy::new(attempts));
        }
        if let Some(allow) = parse_key::<bool>(section, "allow_plain_http")? {
            downloader = downloader.with_allow_plain_http(allow);
        }

        self.downloader = downloader;
        Ok(())
    }

    /// Applies command-line overrides.
    pub fn with_overrides(mut self, state_dir: Option<PathBuf>, archive_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = state_dir {
            self.downloader.state_dir = dir;
        }
        if let Some(dir) = archive_dir {
            self.archive_dir = dir;
        }
        self
    }
}

fn parse_key<T>(section: &Properties, key: &str) -> Result<Option<T>, CliError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match section.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| CliError::Config(format!("{} = {:?}: {}", key, raw, e))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> Result<CliConfig, CliError> {
        CliConfig::from_ini(&Ini::load_from_str(content).unwrap())
    }

    #[test]
    fn test_empty_file_keeps_defaults() {
        let config = parse("").unwrap();
        let defaults = CliConfig::default();
        assert_eq!(config.downloader.state_dir, defaults.downloader.state_dir);
        assert_eq!(config.archive_dir, defaults.archive_dir);
        assert_eq!(config.downloader.sink, SinkKind::Chunked);
    }

    #[test]
    fn test_downloads_section() {
        let config = parse(
            "[downloads]\n\
             state_dir = /tmp/sf/state\n\
             archive_dir = /tmp/sf/shards\n\
             sink = file\n\
             chunk_limit = 1024\n\
             read_timeout_secs = 5\n\
             max_attempts = 9\n\
             validation_attempts = 3\n\
             allow_plain_http = true\n",
        )
        .unwrap();

        let downloader = &config.downloader;
        assert_eq!(downloader.state_dir, PathBuf::from("/tmp/sf/state"));
        assert_eq!(config.archive_dir, PathBuf::from("/tmp/sf/shards"));
        assert_eq!(downloader.sink, SinkKind::File);
        assert_eq!(downloader.chunk_limit, 1024);
        assert_eq!(downloader.read_timeout, Duration::from_secs(5));
        assert_eq!(downloader.retry.max_attempts(), 9);
        assert_eq!(downloader.validation.max_attempts, 3);
        assert!(downloader.allow_plain_http);
    }

    #[test]
    fn test_logging_section() {
        let config = parse("[logging]\nfilter = shardfetch=trace\ndirectory = /tmp/sf/logs\n").unwrap();
        assert_eq!(config.logging.filter, "shardfetch=trace");
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/tmp/sf/logs")));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(parse("[downloads]\nmax_attempts = many\n"), Err(CliError::Config(_))));
        assert!(matches!(parse("[downloads]\nsink = tape\n"), Err(CliError::Config(_))));
        assert!(matches!(parse("[downloads]\nchunk_limit = 0\n"), Err(CliError::Config(_))));
    }

    #[test]
    fn test_overrides_win() {
        let config = parse("[downloads]\nstate_dir = /a\narchive_dir = /b\n")
            .unwrap()
            .with_overrides(Some(PathBuf::from("/c")), None);
        assert_eq!(config.downloader.state_dir, PathBuf::from("/c"));
        assert_eq!(config.archive_dir, PathBuf::from("/b"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[downloads]\nsink = file\n").unwrap();

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.downloader.sink, SinkKind::File);

        let missing = dir.path().join("missing.ini");
        assert!(matches!(CliConfig::load(Some(&missing)), Err(CliError::Config(_))));
    }
}
