//! Transient alert cards.
//!
//! The presenter inserts a card per alert into an [`AlertLayer`], plays a
//! cue, and removes the card again after the auto-dismiss delay. Nothing in
//! here returns an error to the caller: a broken layer or audio device must
//! never stop a poller.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use crate::alert::Alert;
use crate::tone::ToneCue;

/// Identifier of a presented card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertId(u64);

impl std::fmt::Display for AlertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "alert-{}", self.0)
    }
}

/// Errors raised by alert layers.
#[derive(Debug, Error)]
pub enum LayerError {
    /// The container the cards live in does not exist.
    #[error("alert layer is missing")]
    Missing,

    /// The layer refused the card.
    #[error("alert layer rejected card: {0}")]
    Rejected(String),
}

/// What a layer receives for each alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCard {
    /// Card identifier.
    pub id: AlertId,
    /// The alert being shown.
    pub alert: Alert,
    /// Style class derived from the severity.
    pub class: &'static str,
}

/// Where cards are rendered.
pub trait AlertLayer: Send + Sync + std::fmt::Debug {
    /// Add a card.
    ///
    /// # Errors
    ///
    /// Returns an error if the card could not be shown.
    fn insert(&self, card: &AlertCard) -> Result<(), LayerError>;

    /// Put the card into its leaving state.
    fn mark_leaving(&self, _id: AlertId) {}

    /// Whether leaving cards animate out. When true, removal waits for
    /// [`AlertPresenter::animation_ended`] or the auto-dismiss timer.
    fn animates(&self) -> bool {
        false
    }

    /// Remove the card. Called exactly once per inserted card.
    fn remove(&self, id: AlertId);
}

/// Prints cards to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleLayer;

impl AlertLayer for ConsoleLayer {
    fn insert(&self, card: &AlertCard) -> Result<(), LayerError> {
        let alert = &card.alert;
        let mut out = std::io::stdout().lock();
        writeln!(
            out,
            "[{}] {} | {} ({}, {}, {})",
            alert.severity.to_string().to_uppercase(),
            alert.title,
            alert.message,
            alert.kind,
            alert.origin,
            alert.timestamp.format("%H:%M:%S"),
        )
        .map_err(|e| LayerError::Rejected(e.to_string()))
    }

    fn remove(&self, id: AlertId) {
        trace!(%id, "Card removed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    Visible,
    Leaving,
}

#[derive(Debug)]
struct Inner {
    layer: Arc<dyn AlertLayer>,
    cue: Option<ToneCue>,
    auto_dismiss: Duration,
    cards: Mutex<HashMap<AlertId, CardState>>,
    next_id: AtomicU64,
}

/// Presents alerts as dismissible cards.
///
/// Cheap to clone; clones share the same cards.
#[derive(Debug, Clone)]
pub struct AlertPresenter {
    inner: Arc<Inner>,
}

impl AlertPresenter {
    /// Create a presenter. `cue` is `None` when sound is disabled.
    #[must_use]
    pub fn new(layer: Arc<dyn AlertLayer>, cue: Option<ToneCue>, auto_dismiss: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                layer,
                cue,
                auto_dismiss,
                cards: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Show `alert`.
    ///
    /// Returns the card id, or `None` if the layer could not show it.
    /// Auto-dismissal is scheduled when called inside a tokio runtime.
    pub fn present(&self, alert: Alert) -> Option<AlertId> {
        let id = AlertId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let severity = alert.severity;
        let card = AlertCard {
            id,
            class: severity.css_class(),
            alert,
        };

        if let Err(e) = self.inner.layer.insert(&card) {
            debug!(%id, error = %e, "Alert not shown");
            return None;
        }
        if let Ok(mut cards) = self.inner.cards.lock() {
            cards.insert(id, CardState::Visible);
        }
        debug!(%id, kind = %card.alert.kind, %severity, "Alert presented");

        if let Some(cue) = &self.inner.cue {
            cue.beep(severity);
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let presenter = self.clone();
            let delay = self.inner.auto_dismiss;
            runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                presenter.dismiss(id);
                presenter.finish(id);
            });
        }

        Some(id)
    }

    /// Start dismissing a card.
    ///
    /// Returns `false` if the card is unknown or already leaving.
    pub fn dismiss(&self, id: AlertId) -> bool {
        {
            let Ok(mut cards) = self.inner.cards.lock() else {
                return false;
            };
            match cards.get_mut(&id) {
                Some(state) if *state == CardState::Visible => *state = CardState::Leaving,
                _ => return false,
            }
        }

        self.inner.layer.mark_leaving(id);
        if !self.inner.layer.animates() {
            self.finish(id);
        }
        true
    }

    /// Called by animating layers when a leaving card finished animating.
    pub fn animation_ended(&self, id: AlertId) {
        self.finish(id);
    }

    /// Number of cards currently shown, leaving ones included.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.cards.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether the card is in its leaving state.
    #[must_use]
    pub fn is_leaving(&self, id: AlertId) -> bool {
        self.inner
            .cards
            .lock()
            .map(|c| c.get(&id) == Some(&CardState::Leaving))
            .unwrap_or(false)
    }

    /// Play the repeated alarm cue, if sound is enabled.
    pub fn sound_alarm(&self) {
        if let Some(cue) = &self.inner.cue {
            cue.alarm();
        }
    }

    fn finish(&self, id: AlertId) {
        {
            let Ok(mut cards) = self.inner.cards.lock() else {
                return;
            };
            if cards.get(&id) != Some(&CardState::Leaving) {
                return;
            }
            cards.remove(&id);
        }
        self.inner.layer.remove(id);
        trace!(%id, "Alert removed");
    }
}
