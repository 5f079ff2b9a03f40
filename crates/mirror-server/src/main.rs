//! mobilemirror: desktop terminal, files, mouse and screen for a phone.
//!
//! Serves the HTTP API and the WebSocket terminal, gated by a shared-secret
//! token, and optionally starts the `x11vnc` screen streamer.

mod auth;
mod config;
mod files;
mod input;
mod logging;
mod network;
mod qr;
mod screen;
mod server;
mod session;
mod tools;
mod transport;

use anyhow::Context;
use clap::Parser;
use config::{Overrides, ServerConfig};
use mirror_core::messages::ScreenStartRequest;
use server::AppState;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{info, warn};

/// mobilemirror — remote desktop access for mobile clients
#[derive(Parser, Debug)]
#[command(name = "mobilemirror", version, about = "Remote desktop access for mobile clients")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    /// Shell for terminal sessions (default: $SHELL, then /bin/bash)
    #[arg(long)]
    shell: Option<String>,

    /// Maximum concurrent terminal sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Do not start the screen streamer at startup
    #[arg(long)]
    no_screen: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind,
        shell: cli.shell.clone(),
        max_sessions: cli.max_sessions,
        no_screen: cli.no_screen,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config =
        ServerConfig::load(Some(&config_path), &overrides).context("failed to load config")?;

    let _log_guard = logging::init(&cli.log_level, server_config.log_dir.as_deref(), server_config.log_json)
        .context("failed to initialise logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server_config.bind,
        port = server_config.port,
        max_sessions = server_config.max_sessions,
        "starting mobilemirror"
    );
    if server_config.generated_token {
        // Printed once so the operator can pair a phone.
        warn!(token = %server_config.tokens[0], "no access token configured, generated one for this run");
    }

    let autostart = server_config.screen_autostart;
    let state = AppState::new(server_config);

    if autostart {
        let screen = state.screen().clone();
        tokio::spawn(async move {
            match screen.start(&ScreenStartRequest::default()).await {
                Ok(status) => info!(status = %status.status, port = status.port, "screen stream started"),
                Err(e) => warn!(error = %e, "screen stream not started"),
            }
        });
    }

    server::serve(state, shutdown_signal())
        .await
        .context("server error")?;

    info!("mobilemirror stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
