//! # copalink-relay
//!
//! CopaLink relay binary. Loads settings, wires membership into the server
//! and serves until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use copalink_core::{LogFormat, init_subscriber};
use copalink_server::config::ServerConfig;
use copalink_server::membership;
use copalink_server::server::RelayServer;
use copalink_settings::{RelaySettings, load_settings_from_path, settings_path};

/// CopaLink presence and message relay.
#[derive(Parser, Debug)]
#[command(name = "copalink-relay", about = "CopaLink presence and message relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind; 0 auto-assigns (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.copalink/settings.json`).
    #[arg(long, env = "COPALINK_SETTINGS")]
    settings: Option<PathBuf>,

    /// Log filter such as `info` or `copalink_server=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum concurrent connections (overrides settings).
    #[arg(long)]
    max_connections: Option<usize>,
}

impl Cli {
    /// Layer command-line flags over loaded settings.
    fn apply(&self, mut settings: RelaySettings) -> RelaySettings {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(max) = self.max_connections {
            settings.server.max_connections = max;
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let path = cli.settings.clone().unwrap_or_else(settings_path);
    let settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    let settings = cli.apply(settings);

    let format = settings.logging.format.parse().unwrap_or_else(|e: String| {
        eprintln!("{e}; falling back to compact logs");
        LogFormat::Compact
    });
    init_subscriber(&settings.logging.level, format);

    let metrics = copalink_server::metrics::install_recorder();
    let membership = membership::from_settings(&settings.membership)
        .context("Failed to configure group membership")?;

    let server = RelayServer::new(ServerConfig::from(&settings.server), membership, metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(settings = %path.display(), "CopaLink relay listening on http://{addr}");

    shutdown_signal().await?;

    tracing::info!("Shutting down...");
    server.shutdown().graceful_shutdown(vec![handle], None).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_without_flags_keeps_settings() {
        let cli = Cli::parse_from(["copalink-relay"]);
        let settings = cli.apply(RelaySettings::default());
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "copalink-relay",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--log-level",
            "debug",
            "--max-connections",
            "10",
        ]);
        let settings = cli.apply(RelaySettings::default());
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.server.max_connections, 10);
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["copalink-relay", "--settings", "/etc/copalink.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/etc/copalink.json")));
    }

    #[test]
    fn settings_file_feeds_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"maxMessageSize": 2048, "closeSuperseded": false}}"#).unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        let config = ServerConfig::from(&settings.server);
        assert_eq!(config.max_message_size, 2048);
        assert!(!config.close_superseded);
    }
}
