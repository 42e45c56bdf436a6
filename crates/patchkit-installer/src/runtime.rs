use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use patchkit_core::RuntimeConfig;
use tracing::debug;

/// Installs the shared runtime the patch depends on. Runs on a background
/// thread next to the file pass, so implementations must be `Sync`.
pub trait RuntimeInstaller: Sync {
    fn is_installed(&self) -> bool;
    fn install(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRuntimeInstaller {
    program: PathBuf,
    args: Vec<String>,
    installed_marker: Option<PathBuf>,
}

impl CommandRuntimeInstaller {
    /// A relative `program` is resolved against the staging root.
    pub fn from_config(runtime: &RuntimeConfig, staging_root: &Path) -> Self {
        let program = PathBuf::from(&runtime.program);
        let program = if program.is_absolute() {
            program
        } else {
            staging_root.join(program)
        };
        Self {
            program,
            args: runtime.args.clone(),
            installed_marker: runtime.installed_marker.as_ref().map(PathBuf::from),
        }
    }

    pub(crate) fn build_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

impl RuntimeInstaller for CommandRuntimeInstaller {
    fn is_installed(&self) -> bool {
        self.installed_marker
            .as_deref()
            .is_some_and(|marker| marker.exists())
    }

    fn install(&self) -> Result<()> {
        debug!(program = %self.program.display(), "installing runtime dependency");
        run_command(
            &mut self.build_command(),
            "failed to install runtime dependency",
        )
    }
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
