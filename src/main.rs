use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use fuser::MountOption;
use log::{error, info};

use liveraid::config::Config;
use liveraid::journal::{REPAIR_REQUESTED, SCRUB_REQUESTED};
use liveraid::rebuild;
use liveraid::{Engine, LiveRaidFs};

/// Merge data drives into one filesystem with live erasure-coded parity.
///
/// Send SIGUSR1 to a mounted process to verify parity, SIGUSR2 to verify
/// and repair it; results go to the log.
#[derive(Debug, Parser)]
#[command(name = "liveraid", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Mount the array (runs in the foreground).
    Mount {
        /// Path to liveraid.conf
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Mountpoint override (defaults to the config's mountpoint)
        mountpoint: Option<PathBuf>,
        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },
    /// Reconstruct a drive's files from parity (live when mounted,
    /// offline otherwise).
    Rebuild {
        /// Path to liveraid.conf
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        /// Name of the drive to rebuild
        #[arg(short = 'd', long = "drive")]
        drive: String,
    },
    /// Verify parity; with --repair rewrite any mismatched blocks.
    Scrub {
        /// Path to liveraid.conf
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
        #[arg(long)]
        repair: bool,
    },
}

extern "C" fn on_sigusr1(_sig: libc::c_int) {
    SCRUB_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_sigusr2(_sig: libc::c_int) {
    REPAIR_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGUSR1, on_sigusr1 as usize);
        libc::signal(libc::SIGUSR2, on_sigusr2 as usize);
    }
}

fn mount(config: PathBuf, mountpoint: Option<PathBuf>, allow_other: bool) -> ExitCode {
    let cfg = match Config::load(&config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load config '{}': {e}", config.display());
            return ExitCode::FAILURE;
        }
    };
    cfg.dump();

    let mountpoint = mountpoint.unwrap_or_else(|| cfg.mountpoint.clone());
    let engine = match Engine::start(cfg) {
        Ok(engine) => engine,
        Err(e) => {
            error!("engine start failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    install_signal_handlers();

    let mut options = vec![MountOption::FSName("liveraid".to_string())];
    if allow_other {
        options.push(MountOption::AllowOther);
    }

    info!("mounting at {}", mountpoint.display());
    // The engine shuts down in the destroy callback on unmount; the Drop
    // impl covers mount failures.
    match fuser::mount2(LiveRaidFs::new(engine), &mountpoint, &options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    match Cli::parse().command {
        Command::Mount {
            config,
            mountpoint,
            allow_other,
        } => mount(config, mountpoint, allow_other),
        Command::Rebuild { config, drive } => match rebuild::cmd_rebuild(&config, &drive) {
            0 => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        },
        Command::Scrub { config, repair } => match rebuild::cmd_scrub(&config, repair) {
            0 => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        },
    }
}
