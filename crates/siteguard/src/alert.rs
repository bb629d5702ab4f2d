//! Core alert types for siteguard.
//!
//! An [`Alert`] is the unit handed to the presenter, whether it came from a
//! local detection poller or from the backend's push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How loudly an alert should be shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; also the styling used for unrecognized levels.
    #[default]
    Info,
    /// Needs attention.
    Warning,
    /// Needs immediate action.
    Critical,
}

impl Severity {
    /// Parse a severity label, falling back to [`Severity::Info`] for
    /// anything outside `info`, `warning` and `critical`.
    #[must_use]
    pub fn parse_lenient(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }

    /// The style class used by alert layers.
    #[must_use]
    pub fn css_class(self) -> &'static str {
        match self {
            Self::Info => "alert-info",
            Self::Warning => "alert-warning",
            Self::Critical => "alert-critical",
        }
    }

    /// Whether this severity uses the high-pitched tone.
    #[must_use]
    pub fn is_critical(self) -> bool {
        self == Self::Critical
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Where an alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Raised by this client (poller or manual trigger).
    Local,
    /// Delivered by the backend's push channel.
    Remote,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A notification to present to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// Short domain tag such as `unauthorized` or `ppe`. Display only.
    pub kind: String,
    /// Card heading.
    pub title: String,
    /// Card body.
    pub message: String,
    /// Visual and audible weight.
    pub severity: Severity,
    /// Local or remote.
    pub origin: Origin,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    /// Create an alert stamped with the current time.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        origin: Origin,
    ) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            severity,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Replace the timestamp, e.g. with the one carried by a push message.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
