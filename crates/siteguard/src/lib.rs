//! `siteguard` - A headless client for a site safety detection backend
//!
//! This library polls the backend's detection endpoints, follows its live
//! alert stream, attaches camera streams to display slots and presents
//! alerts with throttled sound and email side effects.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod alert;
pub mod camera;
pub mod catalog;
pub mod cli;
pub mod client;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod logging;
pub mod poller;
pub mod presenter;
pub mod status;
pub mod supervisor;
pub mod throttle;
pub mod tone;

pub use alert::{Alert, Origin, Severity};
pub use catalog::{CameraCatalog, CameraInfo};
pub use client::{BackendClient, DetectionBackend, EmailReceipt};
pub use config::Config;
pub use detection::{Domain, Verdict};
pub use error::{Error, Result};
pub use events::{ConnectionState, EventEnvelope, EventListener};
pub use logging::init_logging;
pub use poller::{DetectionPoller, PollerSettings, PollerState};
pub use presenter::{AlertPresenter, ConsoleLayer};
pub use status::StatusLine;
pub use throttle::ThrottleGate;
