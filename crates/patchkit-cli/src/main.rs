mod completion;
mod dispatch;
mod render;

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use patchkit_installer::{ELEVATED_INSTALL_FLAG, ELEVATED_UNINSTALL_FLAG};
use tracing_subscriber::EnvFilter;

use crate::completion::CliCompletionShell;

const ELEVATED_INSTALL_COMMAND: &str = "elevated-install";
const ELEVATED_UNINSTALL_COMMAND: &str = "elevated-uninstall";

#[derive(Parser, Debug)]
#[command(name = "patchkit")]
#[command(about = "Transactional game patch installer", long_about = None)]
#[command(version)]
struct Cli {
    /// Log verbosity on stderr; RUST_LOG takes precedence when set.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
    /// Disable status badges and progress bars.
    #[arg(long, global = true)]
    plain: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the staged patch files into a game directory.
    Install {
        /// Game install directory.
        #[arg(long, conflicts_with = "game_exe", required_unless_present = "game_exe")]
        target: Option<PathBuf>,
        /// Game executable; its directory becomes the install root.
        #[arg(long)]
        game_exe: Option<PathBuf>,
        /// Directory holding the staged files. Defaults to the installer's own directory.
        #[arg(long)]
        staging_root: Option<PathBuf>,
        /// Print the planned changes without touching the game directory.
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove an installed patch and restore the original files.
    Uninstall {
        /// Defaults to the installer's own directory.
        #[arg(long)]
        install_root: Option<PathBuf>,
    },
    /// Show what the installed patch owns.
    Status {
        #[arg(long)]
        install_root: Option<PathBuf>,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    #[command(name = ELEVATED_INSTALL_COMMAND, hide = true)]
    ElevatedInstall {
        install_root: PathBuf,
        /// Absent when launched through the bare legacy `-install <path>` form.
        #[arg(long)]
        staging_root: Option<PathBuf>,
    },
    #[command(name = ELEVATED_UNINSTALL_COMMAND, hide = true)]
    ElevatedUninstall {
        parent_pid: u32,
        #[arg(long)]
        install_root: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_filter_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Map the legacy elevated re-entry flags onto their hidden subcommands.
fn normalize_legacy_args(mut args: Vec<OsString>) -> Vec<OsString> {
    if let Some(first) = args.get_mut(1) {
        if first.as_os_str() == ELEVATED_INSTALL_FLAG {
            *first = OsString::from(ELEVATED_INSTALL_COMMAND);
        } else if first.as_os_str() == ELEVATED_UNINSTALL_FLAG {
            *first = OsString::from(ELEVATED_UNINSTALL_COMMAND);
        }
    }
    args
}

fn initialize_tracing(log_level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(normalize_legacy_args(std::env::args_os().collect()));
    initialize_tracing(cli.log_level);

    match dispatch::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
