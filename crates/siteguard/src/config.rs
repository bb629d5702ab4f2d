//! Configuration management for siteguard.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name.
const CONFIG_DIR_NAME: &str = "siteguard";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SITEGUARD_`, sections split on `__`)
/// 2. TOML config file at `~/.config/siteguard/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend connection settings.
    pub server: ServerConfig,
    /// Alert presentation settings.
    pub alerts: AlertsConfig,
    /// Detection poller settings.
    pub poller: PollerConfig,
    /// Camera stream settings.
    pub camera: CameraConfig,
    /// Push channel settings.
    pub events: EventsConfig,
}

/// Backend connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the detection backend.
    pub base_url: String,
    /// Timeout for request/response calls in milliseconds.
    /// Streaming endpoints are not subject to this timeout.
    pub request_timeout_ms: u64,
}

/// Alert presentation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Delay before an alert card dismisses itself.
    pub auto_dismiss_ms: u64,
    /// Play a tone when an alert is presented.
    pub sound_enabled: bool,
}

/// Detection poller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Delay between starting a camera and the first check.
    pub settle_delay_ms: u64,
    /// Interval between checks.
    pub poll_interval_ms: u64,
    /// Minimum time between two alarm sounds.
    pub audio_cooldown_secs: u64,
    /// Minimum time between two alert emails.
    pub email_cooldown_secs: u64,
    /// Ask the backend to send alert emails on detections.
    pub email_enabled: bool,
    /// Camera used when none is selected.
    pub default_camera: u32,
}

/// Camera stream configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Delay after which a silent stream is assumed live.
    pub fallback_ready_ms: u64,
    /// JPEG quality for snapshots (1-100).
    pub snapshot_quality: u8,
    /// Largest single MJPEG part accepted, in bytes.
    pub max_frame_bytes: usize,
}

/// Push channel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Reconnect delay used until the server sends its own `retry:` value.
    pub reconnect_delay_ms: u64,
    /// Largest single event (line or accumulated data) accepted, in bytes.
    pub max_event_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            auto_dismiss_ms: 4_200,
            sound_enabled: true,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 3_000,
            poll_interval_ms: 2_000,
            audio_cooldown_secs: 30,
            email_cooldown_secs: 60,
            email_enabled: true,
            default_camera: 0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fallback_ready_ms: 1_000,
            snapshot_quality: 80,
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3_000,
            max_event_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("SITEGUARD_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;

        let intervals = [
            ("poller.poll_interval_ms", self.poller.poll_interval_ms),
            ("alerts.auto_dismiss_ms", self.alerts.auto_dismiss_ms),
            ("server.request_timeout_ms", self.server.request_timeout_ms),
            ("events.reconnect_delay_ms", self.events.reconnect_delay_ms),
        ];
        let limits = [
            ("camera.max_frame_bytes", self.camera.max_frame_bytes),
            ("events.max_event_bytes", self.events.max_event_bytes),
        ];
        let zero = intervals
            .iter()
            .find(|(_, value)| *value == 0)
            .map(|(name, _)| *name)
            .or_else(|| limits.iter().find(|(_, value)| *value == 0).map(|(name, _)| *name));
        if let Some(name) = zero {
            return Err(Error::ConfigValidation {
                message: format!("{name} must be greater than 0"),
            });
        }

        if !(1..=100).contains(&self.camera.snapshot_quality) {
            return Err(Error::ConfigValidation {
                message: format!(
                    "camera.snapshot_quality must be between 1 and 100, got {}",
                    self.camera.snapshot_quality
                ),
            });
        }

        Ok(())
    }

    /// Parse the configured backend base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `server.base_url` is not an absolute http(s) URL.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.server.base_url).map_err(|e| Error::ConfigValidation {
            message: format!("server.base_url '{}': {e}", self.server.base_url),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::ConfigValidation {
                message: format!("server.base_url must use http or https, got '{}'", url.scheme()),
            });
        }
        Ok(url)
    }

    /// Get the request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    /// How long shutdown waits for tasks. A poller tick in flight may still
    /// be waiting on a check and an email request.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        self.request_timeout().saturating_mul(2) + Duration::from_secs(1)
    }

    /// Get the auto-dismiss delay as a Duration.
    #[must_use]
    pub fn auto_dismiss(&self) -> Duration {
        Duration::from_millis(self.alerts.auto_dismiss_ms)
    }

    /// Get the camera settle delay as a Duration.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.poller.settle_delay_ms)
    }

    /// Get the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poller.poll_interval_ms)
    }

    /// Get the audio cooldown as a Duration.
    #[must_use]
    pub fn audio_cooldown(&self) -> Duration {
        Duration::from_secs(self.poller.audio_cooldown_secs)
    }

    /// Get the email cooldown as a Duration.
    #[must_use]
    pub fn email_cooldown(&self) -> Duration {
        Duration::from_secs(self.poller.email_cooldown_secs)
    }

    /// Get the camera fallback-ready delay as a Duration.
    #[must_use]
    pub fn fallback_ready(&self) -> Duration {
        Duration::from_millis(self.camera.fallback_ready_ms)
    }

    /// Get the push channel reconnect delay as a Duration.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.events.reconnect_delay_ms)
    }
}
