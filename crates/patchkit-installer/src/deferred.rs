use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use patchkit_core::PatchError;
use tracing::info;

use crate::DeferredAction;

/// Finishes uninstall work that failed while the installer was running,
/// after the installer process has gone away.
pub trait DeferredCleanup {
    /// Returns the path of the scheduled cleanup artifact.
    fn schedule_deferred_cleanup(
        &self,
        actions: &[DeferredAction],
        wait_for_pids: &[u32],
    ) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFlavor {
    Batch,
    Shell,
}

impl ScriptFlavor {
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Batch
        } else {
            Self::Shell
        }
    }
}

/// Writes a self-deleting script next to the install and launches it
/// detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCleanupScheduler {
    script_path: PathBuf,
    flavor: ScriptFlavor,
}

impl ScriptCleanupScheduler {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            flavor: ScriptFlavor::host(),
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    fn spawn(&self) -> Result<()> {
        let mut command = match self.flavor {
            ScriptFlavor::Batch => {
                let mut command = Command::new("cmd");
                command.arg("/C").arg(&self.script_path);
                command
            }
            ScriptFlavor::Shell => {
                let mut command = Command::new("sh");
                command.arg(&self.script_path);
                command
            }
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        command.spawn().with_context(|| {
            format!(
                "failed to launch deferred cleanup script: {}",
                self.script_path.display()
            )
        })?;
        Ok(())
    }
}

impl DeferredCleanup for ScriptCleanupScheduler {
    fn schedule_deferred_cleanup(
        &self,
        actions: &[DeferredAction],
        wait_for_pids: &[u32],
    ) -> Result<PathBuf> {
        let script = render_cleanup_script(self.flavor, actions, wait_for_pids);
        fs::write(&self.script_path, script).map_err(|err| {
            PatchError::file_operation("write cleanup script", &self.script_path, err)
        })?;
        self.spawn()?;
        info!(
            script = %self.script_path.display(),
            actions = actions.len(),
            "scheduled deferred cleanup"
        );
        Ok(self.script_path.clone())
    }
}

/// Script body: wait, stop the listed processes, replay `actions`, then
/// delete the script itself.
pub fn render_cleanup_script(
    flavor: ScriptFlavor,
    actions: &[DeferredAction],
    wait_for_pids: &[u32],
) -> String {
    match flavor {
        ScriptFlavor::Batch => render_batch(actions, wait_for_pids),
        ScriptFlavor::Shell => render_shell(actions, wait_for_pids),
    }
}

fn render_batch(actions: &[DeferredAction], wait_for_pids: &[u32]) -> String {
    let mut lines = vec![
        "@echo off".to_string(),
        "timeout /T 1 /NOBREAK >nul".to_string(),
    ];
    for pid in wait_for_pids {
        lines.push(format!("taskkill /F /PID {pid} >nul 2>&1"));
    }
    lines.push("timeout /T 1 /NOBREAK >nul".to_string());
    for action in actions {
        match action {
            DeferredAction::DeleteFile(path) => {
                lines.push(format!("del /F /Q {} >nul 2>&1", batch_quote(path)));
            }
            DeferredAction::RestoreBackup {
                backup,
                destination,
            } => {
                if let Some(parent) = destination.parent() {
                    let parent = batch_quote(parent);
                    lines.push(format!("if not exist {parent} mkdir {parent}"));
                }
                lines.push(format!(
                    "move /Y {} {} >nul 2>&1",
                    batch_quote(backup),
                    batch_quote(destination)
                ));
            }
        }
    }
    lines.push("(goto) 2>nul & del \"%~f0\"".to_string());
    let mut script = lines.join("\r\n");
    script.push_str("\r\n");
    script
}

fn render_shell(actions: &[DeferredAction], wait_for_pids: &[u32]) -> String {
    let mut lines = vec!["#!/bin/sh".to_string(), "sleep 1".to_string()];
    for pid in wait_for_pids {
        lines.push(format!("kill {pid} 2>/dev/null"));
    }
    lines.push("sleep 1".to_string());
    for action in actions {
        match action {
            DeferredAction::DeleteFile(path) => {
                lines.push(format!("rm -f -- {}", shell_quote(path)));
            }
            DeferredAction::RestoreBackup {
                backup,
                destination,
            } => {
                if let Some(parent) = destination.parent() {
                    lines.push(format!("mkdir -p -- {}", shell_quote(parent)));
                }
                lines.push(format!(
                    "mv -f -- {} {} 2>/dev/null",
                    shell_quote(backup),
                    shell_quote(destination)
                ));
            }
        }
    }
    lines.push("rm -f -- \"$0\"".to_string());
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

fn batch_quote(path: &Path) -> String {
    format!("\"{}\"", path.to_string_lossy().replace('%', "%%"))
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}
