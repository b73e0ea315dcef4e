//! # chorus
//!
//! Server binary: loads settings, installs telemetry and runs the process
//! lifecycle until SIGINT/SIGTERM. Exits 0 after a clean drain and 1 on any
//! startup or shutdown failure.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chorus_server::{init_telemetry, Lifecycle};
use chorus_settings::{ChorusSettings, DeliveryMode};
use clap::Parser;

/// Clustered WebSocket fan-out server.
#[derive(Parser, Debug)]
#[command(name = "chorus", version, about = "Clustered WebSocket fan-out server")]
struct Cli {
    /// JSON settings file.
    #[arg(long, env = "CHORUS_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Delivery mode: `pubsub` or `log` (overrides settings).
    #[arg(long)]
    mode: Option<DeliveryMode>,
}

impl Cli {
    fn settings(&self) -> Result<ChorusSettings> {
        let mut settings =
            chorus_settings::load_settings(self.config.as_deref()).context("failed to load settings")?;
        self.apply(&mut settings);
        settings.validate().context("invalid settings")?;
        Ok(settings)
    }

    fn apply(&self, settings: &mut ChorusSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(mode) = self.mode {
            settings.delivery.mode = mode;
        }
    }
}

async fn run(settings: ChorusSettings) -> Result<()> {
    let lifecycle = Arc::new(Lifecycle::new(settings));
    lifecycle.run().await.map_err(|e| {
        tracing::error!(error = %e, error_kind = e.error_kind(), "lifecycle failed");
        e
    })?;
    tracing::info!("chorus stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("chorus: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_telemetry(&settings.telemetry);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
