use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use patchkit_core::PatchError;
use tracing::info;

pub const ELEVATED_INSTALL_FLAG: &str = "-install";
pub const ELEVATED_UNINSTALL_FLAG: &str = "-uninstall";
pub const ELEVATED_STAGING_ROOT_FLAG: &str = "--staging-root";
pub const ELEVATED_INSTALL_ROOT_FLAG: &str = "--install-root";

/// What an elevated re-entry of the installer should do.
///
/// The elevated child starts in an unrelated working directory, so both
/// roots travel with the invocation and should be absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevatedInvocation {
    Install {
        install_root: PathBuf,
        staging_root: PathBuf,
    },
    Uninstall {
        install_root: PathBuf,
        parent_pid: u32,
    },
}

impl ElevatedInvocation {
    /// Legacy `-install <path>` / `-uninstall <pid>` prefix followed by the
    /// root the legacy form leaves implicit.
    pub fn args(&self) -> Vec<OsString> {
        match self {
            Self::Install {
                install_root,
                staging_root,
            } => vec![
                OsString::from(ELEVATED_INSTALL_FLAG),
                install_root.as_os_str().to_os_string(),
                OsString::from(ELEVATED_STAGING_ROOT_FLAG),
                staging_root.as_os_str().to_os_string(),
            ],
            Self::Uninstall {
                install_root,
                parent_pid,
            } => vec![
                OsString::from(ELEVATED_UNINSTALL_FLAG),
                OsString::from(parent_pid.to_string()),
                OsString::from(ELEVATED_INSTALL_ROOT_FLAG),
                install_root.as_os_str().to_os_string(),
            ],
        }
    }
}

/// Runs the installer again with administrator rights and blocks until the
/// elevated process exits. Returns its exit code, `None` if it was killed.
pub trait Elevator {
    fn run_elevated(&self, invocation: &ElevatedInvocation) -> Result<Option<i32>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandElevator {
    executable: PathBuf,
}

impl CommandElevator {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn current() -> Result<Self> {
        let executable =
            std::env::current_exe().context("failed to resolve the installer executable path")?;
        Ok(Self::new(executable))
    }
}

impl Elevator for CommandElevator {
    fn run_elevated(&self, invocation: &ElevatedInvocation) -> Result<Option<i32>> {
        let mut command = build_elevation_command(&self.executable, invocation);
        let status = command.status().with_context(|| {
            format!(
                "failed to start elevated installer: {}",
                self.executable.display()
            )
        })?;
        Ok(status.code())
    }
}

pub(crate) fn build_elevation_command(executable: &Path, invocation: &ElevatedInvocation) -> Command {
    if cfg!(windows) {
        let argument_list = invocation
            .args()
            .iter()
            .map(|arg| {
                let quoted = quote_windows_arg(&arg.to_string_lossy());
                format!("'{}'", escape_ps_single_quote(&quoted))
            })
            .collect::<Vec<_>>()
            .join(",");
        let mut command = Command::new("powershell");
        command.arg("-NoProfile").arg("-Command").arg(format!(
            "$p = Start-Process -FilePath '{}' -ArgumentList @({}) -Verb RunAs -WindowStyle Hidden -Wait -PassThru; exit $p.ExitCode",
            escape_ps_single_quote(&executable.to_string_lossy()),
            argument_list
        ));
        return command;
    }

    let mut command = Command::new("pkexec");
    command.arg(executable).args(invocation.args());
    command
}

/// Hand the pass to an elevated instance; only a zero exit code counts.
pub(crate) fn delegate_to_elevator(
    elevator: &dyn Elevator,
    invocation: &ElevatedInvocation,
) -> Result<()> {
    info!(?invocation, "insufficient access; delegating to elevated installer");
    let code = elevator.run_elevated(invocation)?;
    if code == Some(0) {
        return Ok(());
    }
    Err(PatchError::ElevatedProcessFailed { code }.into())
}

fn escape_ps_single_quote(value: &str) -> String {
    value.replace('\'', "''")
}

/// `Start-Process -ArgumentList` joins its items with spaces, so each item
/// must already be quoted the way the child's argv parser expects.
pub(crate) fn quote_windows_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::from('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => {
                backslashes += 1;
                continue;
            }
            '"' => quoted.push_str(&"\\".repeat(backslashes * 2 + 1)),
            _ => quoted.push_str(&"\\".repeat(backslashes)),
        }
        backslashes = 0;
        quoted.push(ch);
    }
    quoted.push_str(&"\\".repeat(backslashes * 2));
    quoted.push('"');
    quoted
}
