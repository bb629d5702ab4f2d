//! Push-channel listener.
//!
//! The backend broadcasts alerts on `GET /events` as server-sent events whose
//! `data` is a JSON [`EventEnvelope`]. [`EventListener`] keeps that
//! connection open for as long as it runs, reconnecting after every loss,
//! and hands each envelope to the presenter as a remote alert.

pub mod sse;

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use serde::Deserialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::alert::{Alert, Origin, Severity};
use crate::client::BackendClient;
use crate::error::{Error, Result};
use crate::presenter::{AlertId, AlertPresenter};

pub use sse::{SseDecoder, SseEvent};

/// A message broadcast on the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventEnvelope {
    /// Event type, e.g. `ppe` or `evacuation`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Who raised it.
    #[serde(default)]
    pub source: String,
    /// Text to show instead of the type's default.
    #[serde(default)]
    pub message: Option<String>,
    /// `info`, `warning` or `critical`.
    #[serde(default)]
    pub level: Option<String>,
    /// ISO-8601 time the event was raised.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Name of the demo that raised it.
    #[serde(default)]
    pub demo: Option<String>,
}

struct Profile {
    title: &'static str,
    message: &'static str,
    severity: Severity,
}

fn profile(kind: &str) -> Option<Profile> {
    let profile = match kind {
        "evacuation" => Profile {
            title: "Evacuation Alert",
            message: "Evacuate the area and proceed to the nearest assembly point.",
            severity: Severity::Critical,
        },
        "unauthorized" => Profile {
            title: "Unauthorized Person Detected",
            message: "Unknown person detected in a controlled area.",
            severity: Severity::Critical,
        },
        "restricted" => Profile {
            title: "Restricted Area Breach",
            message: "Movement detected inside a restricted safety zone.",
            severity: Severity::Critical,
        },
        "ppe" => Profile {
            title: "PPE Violation",
            message: "Missing hardhat detected.",
            severity: Severity::Warning,
        },
        "smoking" => Profile {
            title: "Smoking Detected",
            message: "Smoking activity detected in a non-smoking zone.",
            severity: Severity::Critical,
        },
        _ => return None,
    };
    Some(profile)
}

impl EventEnvelope {
    /// Parse a `data` payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object of this shape.
    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// Map the envelope to a remote alert.
    ///
    /// Known types get their own title and default message; anything else
    /// becomes a generic alert. An explicit `level` overrides the type's
    /// severity.
    #[must_use]
    pub fn to_alert(&self) -> Alert {
        let explicit = self.message.as_deref().filter(|m| !m.trim().is_empty());
        let (kind, title, message, severity) = match profile(&self.kind) {
            Some(p) => (
                self.kind.clone(),
                p.title.to_string(),
                explicit.unwrap_or(p.message).to_string(),
                p.severity,
            ),
            None => (
                if self.kind.is_empty() {
                    "alert".to_string()
                } else {
                    self.kind.clone()
                },
                self.demo
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| "Alert".to_string()),
                explicit.unwrap_or("New alert received.").to_string(),
                Severity::Info,
            ),
        };
        let severity = self
            .level
            .as_deref()
            .map_or(severity, Severity::parse_lenient);

        let alert = Alert::new(kind, title, message, severity, Origin::Remote);
        match self.timestamp.as_deref().and_then(parse_timestamp) {
            Some(ts) => alert.at(ts),
            None => alert,
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// State of the push connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Receiving events.
    Connected,
    /// Lost; waiting to retry or retrying.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Keeps the push channel open and presents what arrives on it.
#[derive(Debug)]
pub struct EventListener {
    client: BackendClient,
    presenter: AlertPresenter,
    reconnect_delay: Duration,
    max_event_bytes: usize,
    state: watch::Sender<ConnectionState>,
}

impl EventListener {
    /// Create a listener. `reconnect_delay` applies until the server sends
    /// its own `retry:` value.
    #[must_use]
    pub fn new(client: BackendClient, presenter: AlertPresenter, reconnect_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            presenter,
            reconnect_delay,
            max_event_bytes: sse::DEFAULT_MAX_EVENT_BYTES,
            state,
        }
    }

    /// Drop the connection when a single event grows past `bytes`.
    #[must_use]
    pub fn with_max_event_bytes(mut self, bytes: usize) -> Self {
        self.max_event_bytes = bytes;
        self
    }

    /// Watch the connection state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Present one decoded event. Returns the alert id when one was shown.
    pub fn handle_event(&self, event: &SseEvent) -> Option<AlertId> {
        if event.event != "message" {
            trace!(event = %event.event, "Ignoring named event");
            return None;
        }
        match EventEnvelope::parse(&event.data) {
            Ok(envelope) => {
                debug!(kind = %envelope.kind, source = %envelope.source, "Push event");
                self.presenter.present(envelope.to_alert())
            }
            Err(e) => {
                warn!(error = %e, data = %event.data, "Skipping malformed push event");
                None
            }
        }
    }

    /// Listen until `cancel` fires. Never gives up on its own.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut decoder = SseDecoder::with_limit(self.max_event_bytes);
        self.set_state(ConnectionState::Connecting);

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.stream_once(&mut decoder) => outcome,
            };
            match outcome {
                Ok(()) => info!("Event stream closed by the server"),
                Err(e) => warn!(error = %e, "Event stream lost"),
            }

            decoder.reset();
            self.set_state(ConnectionState::Reconnecting);
            let delay = decoder.retry().unwrap_or(self.reconnect_delay);
            debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Reconnecting");
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Event listener stopped");
    }

    async fn stream_once(&self, decoder: &mut SseDecoder) -> Result<()> {
        let url = self.client.events_url()?;
        let mut request = self
            .client
            .http()
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        if let Some(id) = decoder.last_event_id() {
            request = request.header("Last-Event-ID", id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        self.set_state(ConnectionState::Connected);

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for event in decoder.push(&chunk?)? {
                self.handle_event(&event);
            }
        }
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            info!(state = %next, "Push channel");
        }
    }
}
