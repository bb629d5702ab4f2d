//! Command-line interface for siteguard.
//!
//! This module provides the CLI structure for the `siteguard` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    CamerasCommand, ConfigCommand, DomainArg, SnapshotCommand, TriggerCommand, WatchCommand,
};

use crate::detection::Domain;
use crate::logging::Verbosity;

/// siteguard - Headless client for the site safety detection backend
///
/// Polls detection endpoints, follows the backend's live alert stream and
/// shows alerts in the terminal.
#[derive(Debug, Parser)]
#[command(name = "siteguard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Poll detection domains until interrupted
    Watch(WatchCommand),

    /// Follow the backend's live alert stream
    Listen,

    /// List cameras known to the backend
    Cameras(CamerasCommand),

    /// Ask the backend to broadcast a test alert
    Trigger(TriggerCommand),

    /// Save one frame of a camera stream as JPEG
    Snapshot(SnapshotCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

/// Parse an interactive `camera <domain> <index|none>` line.
///
/// Returns `None` for anything else.
#[must_use]
pub fn parse_camera_command(line: &str) -> Option<(Domain, Option<u32>)> {
    let mut words = line.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("camera") {
        return None;
    }
    let domain = words.next()?.parse().ok()?;
    let camera = match words.next()? {
        "none" | "-1" => None,
        index => Some(index.parse().ok()?),
    };
    if words.next().is_some() {
        return None;
    }
    Some((domain, camera))
}
