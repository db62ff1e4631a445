// SPDX-License-Identifier: GPL-3.0-only

//! Storage service - keeps the block volumes of this machine in their
//! configured state.
//!
//! Locates, provisions, encrypts, formats and mounts volumes from the machine
//! configuration, and closes them again on SIGINT or SIGTERM.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

mod config;
mod service;

use config::ServiceConfig;

const DEFAULT_CONFIG: &str = "/etc/storage-service/config.toml";
const DEFAULT_FILTER: &str = "storage_service=info,storage_volumes=info,warn";

#[derive(Debug, Parser)]
#[command(name = "storage-service", version)]
#[command(about = "Block volume lifecycle daemon")]
struct Cli {
    /// Configuration file [default: /etc/storage-service/config.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset, e.g. `debug`
    #[arg(long)]
    log_level: Option<String>,

    /// How long to wait for volumes to close on shutdown
    #[arg(long, default_value_t = 60)]
    shutdown_timeout_secs: u64,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level.unwrap_or(DEFAULT_FILTER))
            .with_context(|| format!("invalid log level {:?}", level.unwrap_or_default()))?,
    };

    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    let config = match path {
        Some(path) => ServiceConfig::load(path),
        None => ServiceConfig::load_or_default(Path::new(DEFAULT_CONFIG)),
    };
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG));
    config.with_context(|| format!("failed to load {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    tracing::info!("Starting storage service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref())?;
    if cli.check {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    if !nix::unistd::geteuid().is_root() {
        tracing::error!("Storage service must run as root");
        anyhow::bail!("Service must run with root privileges");
    }

    service::run(config, Duration::from_secs(cli.shutdown_timeout_secs))?;

    tracing::info!("Storage service shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["storage-service"]).unwrap();
        assert!(cli.config.is_none());
        assert_eq!(cli.shutdown_timeout_secs, 60);
        assert!(!cli.check);
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::try_parse_from([
            "storage-service",
            "--config",
            "/tmp/config.toml",
            "--log-level",
            "debug",
            "--check",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/config.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.check);
    }

    #[test]
    fn explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));
    }
}
