//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::detection::Domain;

/// Watch command arguments.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Detection domains to poll
    #[arg(value_enum, required = true, num_args = 1..)]
    pub domains: Vec<DomainArg>,

    /// Camera to check (defaults to the configured camera)
    #[arg(long, value_name = "INDEX")]
    pub camera: Option<u32>,

    /// Do not ask the backend to send alert emails
    #[arg(long)]
    pub no_email: bool,

    /// Also open each camera's MJPEG stream
    #[arg(long)]
    pub preview: bool,
}

/// Cameras command arguments.
#[derive(Debug, Args)]
pub struct CamerasCommand {
    /// List the cameras assigned to a detection model instead of all
    /// RTSP cameras
    #[arg(short, long)]
    pub model: Option<String>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Trigger command arguments.
#[derive(Debug, Args)]
pub struct TriggerCommand {
    /// Domain to trigger
    #[arg(value_enum)]
    pub domain: DomainArg,
}

/// Snapshot command arguments.
#[derive(Debug, Args)]
pub struct SnapshotCommand {
    /// Camera index
    pub camera: u32,

    /// Output file
    #[arg(short, long, default_value = "snapshot.jpg")]
    pub output: PathBuf,

    /// How long to wait for a frame
    #[arg(long, default_value = "10000", value_name = "MS")]
    pub timeout_ms: u64,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Detection domain argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DomainArg {
    /// Unknown faces
    Unauthorized,
    /// People inside restricted zones
    Restricted,
    /// Missing hardhats
    Ppe,
    /// Fire and smoke
    Smoking,
}

impl From<DomainArg> for Domain {
    fn from(arg: DomainArg) -> Self {
        match arg {
            DomainArg::Unauthorized => Self::Unauthorized,
            DomainArg::Restricted => Self::Restricted,
            DomainArg::Ppe => Self::Ppe,
            DomainArg::Smoking => Self::Smoking,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_arg_conversion() {
        assert_eq!(Domain::from(DomainArg::Unauthorized), Domain::Unauthorized);
        assert_eq!(Domain::from(DomainArg::Restricted), Domain::Restricted);
        assert_eq!(Domain::from(DomainArg::Ppe), Domain::Ppe);
        assert_eq!(Domain::from(DomainArg::Smoking), Domain::Smoking);
    }

    #[test]
    fn test_config_command_debug() {
        let cmd = ConfigCommand::Show { json: false };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Show"));
    }

    #[test]
    fn test_watch_command_debug() {
        let cmd = WatchCommand {
            domains: vec![DomainArg::Ppe],
            camera: Some(2),
            no_email: true,
            preview: false,
        };
        let debug_str = format!("{cmd:?}");
        assert!(debug_str.contains("Ppe"));
        assert!(debug_str.contains("no_email"));
    }
}
