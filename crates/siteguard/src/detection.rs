//! Detection domains and the interpretation of check responses.
//!
//! Each domain's `/check` endpoint answers with a small JSON vocabulary.
//! [`interpret`] turns a response body into a [`Verdict`]: status text for
//! the operator and, for positive detections, the alert and email payload.

use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::alert::{Alert, Origin, Severity};
use crate::error::Error;

/// A detection domain served by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    /// Unknown faces.
    Unauthorized,
    /// People inside restricted zones.
    Restricted,
    /// Missing hardhats.
    Ppe,
    /// Smoke and fire.
    Smoking,
}

impl Domain {
    /// All domains, in display order.
    pub const ALL: [Domain; 4] = [
        Domain::Unauthorized,
        Domain::Restricted,
        Domain::Ppe,
        Domain::Smoking,
    ];

    /// Path segment used by the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Restricted => "restricted",
            Self::Ppe => "ppe",
            Self::Smoking => "smoking",
        }
    }

    /// Human-readable name.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized Person",
            Self::Restricted => "Restricted Area",
            Self::Ppe => "PPE (Hardhat)",
            Self::Smoking => "Smoking Detection",
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownDomain(s.to_string()))
    }
}

/// A non-detection failure reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftError {
    /// The camera has not produced a frame yet.
    CameraNotAvailable,
    /// The detection model failed to load.
    ModelNotLoaded,
    /// Any other `error` value.
    Other(String),
}

impl SoftError {
    fn from_code(code: &str) -> Self {
        match code {
            "camera_not_available" => Self::CameraNotAvailable,
            "model_not_loaded" => Self::ModelNotLoaded,
            other => Self::Other(other.to_string()),
        }
    }

    fn status(&self) -> String {
        match self {
            Self::CameraNotAvailable => "Camera not available yet, waiting for frames".to_string(),
            Self::ModelNotLoaded => "Detection model not loaded".to_string(),
            Self::Other(code) => format!("Backend error: {code}"),
        }
    }
}

/// A positive detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// The alert to present.
    pub alert: Alert,
    /// Domain-specific fields of the alert email request.
    /// The poller adds `camera_index`.
    pub email: Map<String, Value>,
}

/// The outcome of one check.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The backend could not check; shown as status only.
    SoftError {
        /// What went wrong.
        error: SoftError,
        /// Status text.
        status: String,
    },
    /// Nothing to alert on.
    Clear {
        /// Status text.
        status: String,
    },
    /// Something was detected.
    Detected {
        /// Status text.
        status: String,
        /// Alert and email payload.
        detection: Box<Detection>,
    },
}

impl Verdict {
    /// Status text for the operator.
    #[must_use]
    pub fn status(&self) -> &str {
        match self {
            Self::SoftError { status, .. } | Self::Clear { status } | Self::Detected { status, .. } => {
                status
            }
        }
    }

    /// Whether this verdict carries a detection.
    #[must_use]
    pub fn is_detection(&self) -> bool {
        matches!(self, Self::Detected { .. })
    }

    fn clear(status: impl Into<String>) -> Self {
        Self::Clear {
            status: status.into(),
        }
    }

    fn detected(status: impl Into<String>, alert: Alert, email: Value) -> Self {
        let email = match email {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::Detected {
            status: status.into(),
            detection: Box::new(Detection { alert, email }),
        }
    }
}

/// Interpret a check response body for `domain`.
#[must_use]
pub fn interpret(domain: Domain, body: &Value) -> Verdict {
    if let Some(code) = body.get("error") {
        let error = SoftError::from_code(code.as_str().unwrap_or("unknown"));
        let status = error.status();
        return Verdict::SoftError { error, status };
    }
    if body.get("ok").and_then(Value::as_bool) == Some(false) {
        let error = SoftError::Other("request rejected".to_string());
        let status = error.status();
        return Verdict::SoftError { error, status };
    }

    match domain {
        Domain::Unauthorized => interpret_unauthorized(body),
        Domain::Restricted => interpret_restricted(body),
        Domain::Ppe => interpret_ppe(body),
        Domain::Smoking => interpret_smoking(body),
    }
}

fn flag(body: &Value, key: &str) -> Option<bool> {
    body.get(key).and_then(Value::as_bool)
}

fn confidence(body: &Value, key: &str) -> Option<f64> {
    body.get(key).and_then(Value::as_f64)
}

fn percent(value: f64) -> String {
    format!("{:.0}%", (value * 100.0).clamp(0.0, 100.0))
}

fn local_alert(domain: Domain, title: &str, message: String, severity: Severity) -> Alert {
    Alert::new(domain.as_str(), title, message, severity, Origin::Local)
}

fn interpret_unauthorized(body: &Value) -> Verdict {
    match flag(body, "unauthorized") {
        Some(true) => {
            let reason = body.get("reason").and_then(Value::as_str).unwrap_or("unknown");
            if reason == "no_face" {
                return Verdict::clear("Scanning: no face detected");
            }
            let message = if reason == "no_known_faces" {
                "Person detected but no enrolled faces are loaded.".to_string()
            } else {
                "Unknown person detected in a controlled area.".to_string()
            };
            Verdict::detected(
                format!("ALERT: unauthorized person ({reason})"),
                local_alert(
                    Domain::Unauthorized,
                    "Unauthorized Person Detected",
                    message,
                    Severity::Critical,
                ),
                json!({ "person_info": format!("Unknown person ({reason})") }),
            )
        }
        Some(false) => {
            let name = body
                .get("person_name")
                .and_then(Value::as_str)
                .unwrap_or("known person");
            match confidence(body, "confidence") {
                Some(c) => Verdict::clear(format!("Authorized: {name} ({})", percent(c))),
                None => Verdict::clear(format!("Authorized: {name}")),
            }
        }
        None => Verdict::clear("No result in response"),
    }
}

fn interpret_restricted(body: &Value) -> Verdict {
    match flag(body, "intruder") {
        Some(true) => Verdict::detected(
            "ALERT: person in restricted area",
            local_alert(
                Domain::Restricted,
                "Restricted Area Breach",
                "Person detected inside a restricted zone.".to_string(),
                Severity::Critical,
            ),
            json!({}),
        ),
        Some(false) => Verdict::clear("Restricted area clear"),
        None => Verdict::clear("No result in response"),
    }
}

fn interpret_ppe(body: &Value) -> Verdict {
    let conf = confidence(body, "confidence");
    match flag(body, "violation") {
        Some(true) => {
            let message = match conf {
                Some(c) if c > 0.0 => {
                    format!("Missing hardhat detected (hardhat confidence {}).", percent(c))
                }
                _ => "Missing hardhat detected.".to_string(),
            };
            Verdict::detected(
                "WARNING: no hardhat detected",
                local_alert(Domain::Ppe, "PPE Violation", message, Severity::Warning),
                json!({}),
            )
        }
        Some(false) => match conf {
            Some(c) => Verdict::clear(format!("Hardhat detected ({})", percent(c))),
            None => Verdict::clear("Hardhat detected"),
        },
        None => Verdict::clear("No result in response"),
    }
}

fn interpret_smoking(body: &Value) -> Verdict {
    let smoke = flag(body, "smoke_detected");
    let fire = flag(body, "fire_detected");
    if smoke.is_none() && fire.is_none() {
        return Verdict::clear("No result in response");
    }

    match (fire.unwrap_or(false), smoke.unwrap_or(false)) {
        (true, true) => Verdict::detected(
            "CRITICAL: fire and smoke detected",
            local_alert(
                Domain::Smoking,
                "Fire and Smoke Detected",
                "Fire and smoke detected. Evacuate and alert emergency services.".to_string(),
                Severity::Critical,
            ),
            json!({ "detection_type": "fire_and_smoke" }),
        ),
        (true, false) => {
            let status = match confidence(body, "fire_confidence") {
                Some(c) => format!("CRITICAL: fire detected ({})", percent(c)),
                None => "CRITICAL: fire detected".to_string(),
            };
            Verdict::detected(
                status,
                local_alert(
                    Domain::Smoking,
                    "Fire Detected",
                    "Fire detected in the monitored area.".to_string(),
                    Severity::Critical,
                ),
                json!({ "detection_type": "fire" }),
            )
        }
        (false, true) => {
            let status = match confidence(body, "smoke_confidence") {
                Some(c) => format!("WARNING: smoke detected ({})", percent(c)),
                None => "WARNING: smoke detected".to_string(),
            };
            Verdict::detected(
                status,
                local_alert(
                    Domain::Smoking,
                    "Smoke Detected",
                    "Smoking activity detected in a non-smoking zone.".to_string(),
                    Severity::Warning,
                ),
                json!({ "detection_type": "smoke" }),
            )
        }
        (false, false) => Verdict::clear("No smoke or fire detected"),
    }
}
