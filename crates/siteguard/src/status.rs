//! Operator-facing status lines.

use std::sync::{Arc, Mutex};

use tracing::info;

/// A named line of status text, shared between the component that writes
/// it and whoever displays it.
///
/// Changes are logged; repeated identical text is not.
#[derive(Debug, Clone)]
pub struct StatusLine {
    label: Arc<str>,
    text: Arc<Mutex<String>>,
}

impl StatusLine {
    /// Create an empty status line.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        let label: String = label.into();
        Self {
            label: Arc::from(label),
            text: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Replace the text.
    pub fn set(&self, text: impl Into<String>) {
        let text = text.into();
        let Ok(mut current) = self.text.lock() else {
            return;
        };
        if *current != text {
            info!(status = %self.label, "{text}");
            *current = text;
        }
    }

    /// Current text.
    #[must_use]
    pub fn get(&self) -> String {
        self.text.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// The label this line was created with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}
