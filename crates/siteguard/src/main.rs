//! `siteguard` - CLI for the site safety detection backend
//!
//! This binary runs detection pollers and the live alert listener, and
//! offers a few one-shot commands against the backend.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use siteguard::camera::{CameraAttacher, DisplaySlot, PlaceholderSink, StreamState};
use siteguard::cli::{
    parse_camera_command, CamerasCommand, Cli, Command, ConfigCommand, SnapshotCommand,
    TriggerCommand, WatchCommand,
};
use siteguard::poller::{CameraSelector, DetectionPoller, PollerSettings};
use siteguard::presenter::{AlertLayer, AlertPresenter, ConsoleLayer};
use siteguard::supervisor::{Supervisor, TaskKind};
use siteguard::tone::ToneCue;
use siteguard::{init_logging, BackendClient, Config, DetectionBackend, Domain, EventListener, StatusLine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // `config validate` reports bad files itself
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        handle_validate(file.clone().or_else(|| cli.config.clone()));
        return Ok(());
    }

    let config = Config::load_from(cli.config.clone()).context("failed to load configuration")?;

    match cli.command {
        Command::Watch(cmd) => handle_watch(&config, &cmd).await,
        Command::Listen => handle_listen(&config).await,
        Command::Cameras(cmd) => handle_cameras(&config, &cmd).await,
        Command::Trigger(cmd) => handle_trigger(&config, &cmd).await,
        Command::Snapshot(cmd) => handle_snapshot(&config, &cmd).await,
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

fn presenter(config: &Config) -> AlertPresenter {
    let cue = config.alerts.sound_enabled.then(ToneCue::terminal);
    AlertPresenter::new(
        Arc::new(ConsoleLayer) as Arc<dyn AlertLayer>,
        cue,
        config.auto_dismiss(),
    )
}

async fn handle_watch(config: &Config, cmd: &WatchCommand) -> anyhow::Result<()> {
    let client = BackendClient::from_config(config)?;
    let backend: Arc<dyn DetectionBackend> = Arc::new(client.clone());
    let presenter = presenter(config);
    let attacher = CameraAttacher::new(client.clone(), config.fallback_ready());

    let mut settings = PollerSettings::from_config(config);
    if cmd.no_email {
        settings.email_enabled = false;
    }

    let mut supervisor = Supervisor::new();
    let mut selectors: HashMap<Domain, CameraSelector> = HashMap::new();
    for domain in cmd.domains.iter().copied().map(Domain::from) {
        if selectors.contains_key(&domain) {
            continue;
        }
        let camera = match cmd.camera {
            Some(camera) => Some(camera),
            None => default_camera(&client, domain, config.poller.default_camera).await,
        };
        let mut poller = DetectionPoller::new(
            domain,
            Arc::clone(&backend),
            presenter.clone(),
            settings.clone(),
        )
        .with_camera(camera);
        if cmd.preview {
            let sink = PlaceholderSink::new(client.http().clone(), config.camera.max_frame_bytes);
            let slot = DisplaySlot::new(
                domain.as_str(),
                Box::new(sink),
                StatusLine::new(format!("{domain} camera")),
            );
            poller = poller.with_view(slot, attacher.clone());
        }
        selectors.insert(domain, poller.selector());
        supervisor.spawn(TaskKind::Poller(domain), move |cancel| async move {
            poller.run(cancel).await;
        });
    }
    info!(pollers = supervisor.count(), "Watching; type 'camera <domain> <index>' to switch");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => apply_camera_command(&line, &selectors),
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "Stopped reading stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!("Shutting down");
    supervisor.shutdown(config.shutdown_grace()).await?;
    Ok(())
}

/// The camera a domain starts on: its flagged or first enabled camera from
/// the model catalog, or `fallback` when the catalog is unavailable.
async fn default_camera(client: &BackendClient, domain: Domain, fallback: u32) -> Option<u32> {
    match client.model_cameras(domain.as_str()).await {
        Ok(catalog) if !catalog.is_empty() => {
            let camera = catalog.default_for(domain);
            if camera.is_none() {
                warn!(%domain, "No enabled camera assigned to this model");
            }
            camera
        }
        Ok(_) => Some(fallback),
        Err(e) => {
            warn!(%domain, error = %e, "Could not fetch model cameras, using default camera");
            Some(fallback)
        }
    }
}

fn apply_camera_command(line: &str, selectors: &HashMap<Domain, CameraSelector>) {
    if line.trim().is_empty() {
        return;
    }
    let Some((domain, camera)) = parse_camera_command(line) else {
        warn!(input = line.trim(), "Expected 'camera <domain> <index|none>'");
        return;
    };
    match selectors.get(&domain) {
        Some(selector) => {
            info!(%domain, camera = ?camera, "Camera selected");
            selector.select(camera);
        }
        None => warn!(%domain, "Domain is not being watched"),
    }
}

async fn handle_listen(config: &Config) -> anyhow::Result<()> {
    let client = BackendClient::from_config(config)?;
    let listener = EventListener::new(client, presenter(config), config.reconnect_delay())
        .with_max_event_bytes(config.events.max_event_bytes);

    let mut supervisor = Supervisor::new();
    supervisor.spawn(TaskKind::Listener, move |cancel| async move {
        listener.run(cancel).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    supervisor.shutdown(config.shutdown_grace()).await?;
    Ok(())
}

async fn handle_cameras(config: &Config, cmd: &CamerasCommand) -> anyhow::Result<()> {
    let client = BackendClient::from_config(config)?;
    let catalog = match &cmd.model {
        Some(model) => client.model_cameras(model).await,
        None => client.rtsp_cameras().await,
    }
    .context("failed to fetch cameras")?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }
    if catalog.is_empty() {
        println!("No cameras configured.");
        return Ok(());
    }
    println!("{:>5}  {:<8}  {:<30}  FLAGS", "INDEX", "ENABLED", "NAME");
    for (id, info) in catalog.iter() {
        let mut flags = Vec::new();
        if info.is_restricted {
            flags.push("restricted");
        }
        if info.is_smoking_zone {
            flags.push("smoking-zone");
        }
        println!(
            "{id:>5}  {:<8}  {:<30}  {}",
            if info.enabled { "yes" } else { "no" },
            info.name,
            flags.join(",")
        );
    }
    Ok(())
}

async fn handle_trigger(config: &Config, cmd: &TriggerCommand) -> anyhow::Result<()> {
    let client = BackendClient::from_config(config)?;
    let domain = Domain::from(cmd.domain);
    client
        .trigger(domain)
        .await
        .with_context(|| format!("failed to trigger {domain}"))?;
    println!("Triggered {domain}; the alert is delivered on the live stream.");
    Ok(())
}

async fn handle_snapshot(config: &Config, cmd: &SnapshotCommand) -> anyhow::Result<()> {
    let client = BackendClient::from_config(config)?;
    let attacher = CameraAttacher::new(client.clone(), config.fallback_ready());
    let sink = PlaceholderSink::new(client.http().clone(), config.camera.max_frame_bytes);
    let mut slot = DisplaySlot::new("snapshot", Box::new(sink), StatusLine::new("snapshot"));
    attacher.attach_one(&mut slot, Some(cmd.camera));

    let wait = async {
        loop {
            if let Some(snapshot) = slot.capture(config.camera.snapshot_quality) {
                return Ok(snapshot);
            }
            if slot.state() == StreamState::Error {
                bail!("{}", slot.status().get());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    };
    let result = tokio::time::timeout(Duration::from_millis(cmd.timeout_ms), wait).await;
    slot.detach();
    let snapshot = match result {
        Ok(snapshot) => snapshot?,
        Err(_) => bail!("no frame from camera {} within {} ms", cmd.camera, cmd.timeout_ms),
    };

    snapshot
        .save(&cmd.output)
        .await
        .with_context(|| format!("failed to write {}", cmd.output.display()))?;
    println!(
        "Saved {}x{} snapshot of camera {} to {}",
        snapshot.width,
        snapshot.height,
        cmd.camera,
        cmd.output.display()
    );
    Ok(())
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Server]");
                println!("  Base URL:           {}", config.server.base_url);
                println!("  Request timeout:    {} ms", config.server.request_timeout_ms);
                println!();
                println!("[Alerts]");
                println!("  Auto-dismiss:       {} ms", config.alerts.auto_dismiss_ms);
                println!("  Sound:              {}", config.alerts.sound_enabled);
                println!();
                println!("[Poller]");
                println!("  Settle delay:       {} ms", config.poller.settle_delay_ms);
                println!("  Poll interval:      {} ms", config.poller.poll_interval_ms);
                println!("  Audio cooldown:     {} s", config.poller.audio_cooldown_secs);
                println!("  Email cooldown:     {} s", config.poller.email_cooldown_secs);
                println!("  Email alerts:       {}", config.poller.email_enabled);
                println!("  Default camera:     {}", config.poller.default_camera);
                println!();
                println!("[Camera]");
                println!("  Fallback ready:     {} ms", config.camera.fallback_ready_ms);
                println!("  Snapshot quality:   {}", config.camera.snapshot_quality);
                println!("  Max frame size:     {} bytes", config.camera.max_frame_bytes);
                println!();
                println!("[Events]");
                println!("  Reconnect delay:    {} ms", config.events.reconnect_delay_ms);
                println!("  Max event size:     {} bytes", config.events.max_event_bytes);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => handle_validate(file),
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => println!("Configuration is valid."),
        Err(e) => println!("Configuration error: {e}"),
    }
}
