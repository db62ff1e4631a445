// SPDX-License-Identifier: GPL-3.0-only

//! Storage installer - prepares the system disk for the volume engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use storage_installer::meta_values::{self, META_ENV};
use storage_installer::{Arch, InstallOptions, Installer, LegacyManifest, Manifest};
use storage_sys::{SystemFilesystemMaker, SystemRunner};
use storage_types::partition_types::type_name;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "storage_installer=info,warn";

#[derive(Debug, Parser)]
#[command(name = "storage-installer", version)]
#[command(about = "Install to or upgrade the system disk")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Partition the disk from scratch
    Install(InstallArgs),
    /// Mark an installed disk for upgrade
    Upgrade(InstallArgs),
}

#[derive(Debug, Args)]
struct InstallArgs {
    /// Target disk, e.g. /dev/sda
    #[arg(long)]
    disk: String,

    #[arg(long, default_value = "metal")]
    platform: String,

    #[arg(long, value_enum, default_value_t = Arch::host())]
    arch: Arch,

    #[arg(long = "extra-kernel-arg", value_name = "ARG")]
    extra_kernel_args: Vec<String>,

    /// Overwrite a disk that is not empty
    #[arg(long)]
    force: bool,

    /// Zero the whole disk before partitioning (requires --force)
    #[arg(long)]
    zero: bool,

    /// META value to seed, e.g. 0x0a=value
    #[arg(long = "meta", value_name = "TAG=VALUE")]
    meta: Vec<String>,

    /// Lay out the disk from a legacy JSON manifest instead
    #[arg(long)]
    legacy_manifest: Option<PathBuf>,
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

fn installer(args: InstallArgs) -> Result<Installer> {
    let env = std::env::var(META_ENV).ok();
    let meta = meta_values::collect(&args.meta, env.as_deref())?;

    let mut options = InstallOptions {
        disk: args.disk,
        platform: args.platform,
        arch: args.arch,
        extra_kernel_args: args.extra_kernel_args,
        force: args.force,
        zero: args.zero,
        meta,
    };

    let manifest = match &args.legacy_manifest {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let plan = LegacyManifest::from_json(&text)?.into_plan(&options.disk)?;
            options.force |= plan.force;
            options.zero |= plan.zero;
            plan.manifest
        }
        None => Manifest::install_plan(options.arch),
    };

    let formatter = Arc::new(SystemFilesystemMaker::new(Arc::new(SystemRunner::new())));
    Ok(Installer::new(options, manifest, formatter))
}

fn run(cli: Cli) -> Result<()> {
    init_logging(cli.log_level.as_deref())?;

    match cli.command {
        Command::Install(args) => {
            let disk = args.disk.clone();
            let placed = installer(args)?
                .install()
                .with_context(|| format!("install to {} failed", disk))?;
            for target in placed {
                tracing::info!(
                    "{} {} {} ({})",
                    target.number,
                    target.label,
                    target.dev_path,
                    type_name(&target.partition_type)
                );
            }
        }
        Command::Upgrade(args) => {
            let disk = args.disk.clone();
            installer(args)?
                .upgrade()
                .with_context(|| format!("upgrade of {} failed", disk))?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
