//! Application configuration.
//!
//! Settings are read from a TOML file. Twitch credentials may also come from the
//! environment (a `.env` file is honoured), which takes precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chanrec.toml";

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "CHANREC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub twitch: TwitchConfig,
    pub storage: StorageConfig,
    pub capture: CaptureConfig,
    pub finalize: FinalizeConfig,
    pub monitor: MonitorConfig,
    pub registry: RegistryConfig,
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchConfig {
    /// Application client id, used for the Helix API.
    pub client_id: String,
    /// Application client secret, exchanged for an app access token at startup.
    pub client_secret: String,
    /// User OAuth token for the chat feed.
    pub oauth_token: String,
    /// Chat nickname matching `oauth_token`. Anonymous when empty.
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Where raw captures and in-progress chat logs live.
    pub temp_dir: PathBuf,
    /// Root of the per-channel archive (`<channels_dir>/<name>/streams`).
    pub channels_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("temp"),
            channels_dir: PathBuf::from("channels"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub streamlink_path: String,
    pub quality: String,
    /// How long `stop` waits for streamlink to be reaped.
    pub stop_timeout_secs: u64,
    /// Extra arguments inserted before the channel URL.
    pub extra_args: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            streamlink_path: std::env::var("STREAMLINK_PATH")
                .unwrap_or_else(|_| "streamlink".to_string()),
            quality: "best".to_string(),
            stop_timeout_secs: 10,
            extra_args: Vec::new(),
        }
    }
}

impl CaptureConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub ffmpeg_path: String,
    /// Container extension of the archived video.
    pub output_format: String,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            output_format: "mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    /// Upper bound on status requests in flight during one tick.
    pub max_concurrent_checks: usize,
    pub request_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_concurrent_checks: 8,
            request_timeout_secs: 15,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// JSON file holding the registered channels. In-memory when unset.
    pub path: Option<PathBuf>,
    /// Channels registered on startup.
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Directory for daily-rolling log files. Console only when unset.
    pub dir: Option<PathBuf>,
    pub retention_days: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: crate::logging::DEFAULT_LOG_FILTER.to_string(),
            dir: None,
            retention_days: 7,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, `$CHANREC_CONFIG`, or `chanrec.toml`.
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env();
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    fn apply_env(&mut self) {
        let overrides = [
            ("TWITCH_CLIENT_ID", &mut self.twitch.client_id),
            ("TWITCH_CLIENT_SECRET", &mut self.twitch.client_secret),
            ("TWITCH_OAUTH_TOKEN", &mut self.twitch.oauth_token),
            ("TWITCH_NICKNAME", &mut self.twitch.nickname),
        ];
        for (key, slot) in overrides {
            if let Ok(value) = std::env::var(key)
                && !value.trim().is_empty()
            {
                *slot = value;
            }
        }
    }

    /// Check the settings needed to run the monitor.
    pub fn validate(&self) -> Result<()> {
        if self.twitch.client_id.trim().is_empty() {
            return Err(Error::config("twitch.client_id is required"));
        }
        if self.twitch.client_secret.trim().is_empty() {
            return Err(Error::config("twitch.client_secret is required"));
        }
        if self.monitor.poll_interval_secs == 0 {
            return Err(Error::config("monitor.poll_interval_secs must be > 0"));
        }
        if self.monitor.max_concurrent_checks == 0 {
            return Err(Error::config("monitor.max_concurrent_checks must be > 0"));
        }
        Ok(())
    }
}
