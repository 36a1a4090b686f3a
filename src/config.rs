//! Engine settings and the TOML configuration file loaded by the CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::JobCreate;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serve the HTTP control plane.
    pub api_on: bool,
    /// Require HTTP Basic authentication on the control plane.
    pub api_auth: bool,
    pub api_host: String,
    pub api_port: u16,
    pub debug: bool,
    /// Log file path; stdout when unset.
    pub log_path: Option<PathBuf>,
    /// Database URI, e.g. `sqlite://homeworq.db`.
    pub db_uri: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_on: false,
            api_auth: false,
            api_host: "localhost".to_string(),
            api_port: 8000,
            debug: false,
            log_path: None,
            db_uri: "sqlite://homeworq.db".to_string(),
        }
    }
}

/// On-disk configuration: settings plus the default jobs reconciled at
/// every startup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub jobs: Vec<JobCreate>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Schedule, TimeUnit};
    use std::io::Write;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert!(!settings.api_on);
        assert!(!settings.api_auth);
        assert_eq!(settings.api_host, "localhost");
        assert_eq!(settings.api_port, 8000);
        assert_eq!(settings.db_uri, "sqlite://homeworq.db");
    }

    #[test]
    fn load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[settings]
api_on = true
api_port = 9000
db_uri = "sqlite://test.db"

[[jobs]]
task = "ping"
schedule = {{ interval = 1, unit = "hours" }}

[jobs.params]
url = "https://example.com"

[[jobs]]
task = "process_data"
schedule = "0 2 * * *"

[jobs.params]
input_path = "/data"
batch_size = 1000

[jobs.options]
timeout = 30
max_retries = 3
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(config.settings.api_on);
        assert_eq!(config.settings.api_port, 9000);
        assert_eq!(config.settings.db_uri, "sqlite://test.db");
        assert_eq!(config.jobs.len(), 2);

        assert_eq!(config.jobs[0].task, "ping");
        assert_eq!(
            config.jobs[0].schedule,
            Schedule::Interval {
                interval: 1,
                unit: TimeUnit::Hours,
                at: None
            }
        );
        assert_eq!(
            config.jobs[0].params.get("url"),
            Some(&serde_json::json!("https://example.com"))
        );

        assert_eq!(
            config.jobs[1].schedule,
            Schedule::Cron("0 2 * * *".to_string())
        );
        assert_eq!(config.jobs[1].options.timeout, Some(30));
        assert_eq!(config.jobs[1].options.max_retries, Some(3));
        assert_eq!(
            config.jobs[1].params.get("batch_size"),
            Some(&serde_json::json!(1000))
        );
    }

    #[test]
    fn load_empty_config_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(!config.settings.api_on);
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(err, Err(ConfigError::Io { .. })));
    }
}
