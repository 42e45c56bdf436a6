use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use patchkit_core::{Ledger, PatchConfig, PatchError};
use tracing::{info, warn};

use crate::access::AccessChecker;
use crate::deferred::DeferredCleanup;
use crate::elevation::{delegate_to_elevator, ElevatedInvocation, Elevator};
use crate::fs_utils::{move_file, prune_empty_dirs, remove_file_if_exists};
use crate::ledger_store::{read_ledger, remove_ledger_file};
use crate::{
    AccessStatus, DeferredAction, InstallLayout, UninstallEvent, UninstallOutcome,
    UninstallPhase, UninstallStatus,
};

#[derive(Debug, Clone, Copy)]
pub struct UninstallRequest<'a> {
    pub install_root: &'a Path,
    pub config: &'a PatchConfig,
    pub elevated: bool,
    /// Process that launched this elevated instance; the deferred cleanup
    /// waits for it too.
    pub parent_pid: Option<u32>,
    /// Installer binary living inside the install root, removed last.
    pub self_binary: Option<&'a Path>,
}

#[derive(Clone, Copy)]
pub struct UninstallCollaborators<'a> {
    pub access: &'a dyn AccessChecker,
    pub elevator: &'a dyn Elevator,
    pub cleanup: &'a dyn DeferredCleanup,
}

enum FileRemoval {
    Removed { restored_backup: bool },
    Deferred {
        actions: Vec<DeferredAction>,
        reason: String,
    },
}

/// Remove every ledger-tracked file, restore backups, and delete the ledger.
///
/// Files that cannot be removed now are handed to the deferred cleanup
/// instead of failing the uninstall.
pub fn uninstall_patch<F>(
    request: &UninstallRequest<'_>,
    collaborators: &UninstallCollaborators<'_>,
    on_event: F,
) -> Result<UninstallOutcome>
where
    F: FnMut(UninstallEvent),
{
    uninstall_patch_with_io(
        request,
        collaborators,
        on_event,
        read_ledger,
        remove_file_if_exists,
    )
}

pub(crate) fn uninstall_patch_with_io<F, L, R>(
    request: &UninstallRequest<'_>,
    collaborators: &UninstallCollaborators<'_>,
    mut on_event: F,
    load_ledger: L,
    mut remove_file: R,
) -> Result<UninstallOutcome>
where
    F: FnMut(UninstallEvent),
    L: FnOnce(&InstallLayout) -> Result<Option<Ledger>>,
    R: FnMut(&Path) -> io::Result<()>,
{
    on_event(UninstallEvent::Phase(UninstallPhase::CheckingAccess));
    let layout = InstallLayout::for_config(request.install_root, request.config);
    let mut ledger = match load_ledger(&layout) {
        Ok(Some(ledger)) => ledger,
        Ok(None) => {
            info!(install_root = %layout.install_root().display(), "nothing installed");
            on_event(UninstallEvent::Phase(UninstallPhase::Done));
            return Ok(UninstallOutcome::with_status(UninstallStatus::NotInstalled));
        }
        Err(err) if PatchError::chain_is_access_denied(&err) => {
            return hand_off_uninstall(request, collaborators.elevator, err);
        }
        Err(err) => return Err(err),
    };

    if collaborators.access.check_write_access(request.install_root)? == AccessStatus::Denied {
        let denied = PatchError::AccessDenied {
            path: request.install_root.to_path_buf(),
        };
        return hand_off_uninstall(request, collaborators.elevator, denied.into());
    }

    on_event(UninstallEvent::Phase(UninstallPhase::Removing));
    let mut outcome = UninstallOutcome::with_status(UninstallStatus::Uninstalled);
    let entries = ledger.entries().cloned().collect::<Vec<_>>();
    let total = entries.len();

    for (index, entry) in entries.iter().enumerate() {
        let destination = layout.installed_path(&entry.relative_path);
        let backup = ledger.backup_root().join(&entry.relative_path);
        match remove_tracked_file(&destination, &backup, entry.had_backup, &mut remove_file) {
            FileRemoval::Removed { restored_backup } => {
                if restored_backup {
                    outcome.restored.push(entry.relative_path.clone());
                }
                outcome.removed.push(entry.relative_path.clone());
                on_event(UninstallEvent::FileRemoved {
                    relative_path: entry.relative_path.clone(),
                    restored_backup,
                    current: index + 1,
                    total,
                });
            }
            FileRemoval::Deferred { actions, reason } => {
                warn!(
                    relative_path = %entry.relative_path.display(),
                    reason = %reason,
                    "deferring removal until the installer exits"
                );
                outcome.deferred.extend(actions);
                on_event(UninstallEvent::FileDeferred {
                    relative_path: entry.relative_path.clone(),
                    reason,
                });
            }
        }
        ledger.remove_entry(&entry.relative_path);
    }

    on_event(UninstallEvent::Phase(UninstallPhase::Cleanup));
    if let Err(err) = remove_ledger_file(&layout) {
        warn!(error = %format!("{err:#}"), "deferring install ledger removal");
        outcome
            .deferred
            .push(DeferredAction::DeleteFile(layout.ledger_path()));
    }

    // only directories the patch created; pre-existing ones stay even if empty
    for dir in ledger.created_dirs_deepest_first() {
        let _ = fs::remove_dir(layout.installed_path(&dir));
    }
    prune_empty_dirs(&layout.state_dir());

    if let Some(binary) = request.self_binary {
        if binary.exists() {
            outcome
                .deferred
                .push(DeferredAction::DeleteFile(binary.to_path_buf()));
        }
    }

    if !outcome.deferred.is_empty() {
        let mut wait_for_pids = vec![std::process::id()];
        wait_for_pids.extend(request.parent_pid);
        match collaborators
            .cleanup
            .schedule_deferred_cleanup(&outcome.deferred, &wait_for_pids)
        {
            Ok(script) => outcome.cleanup_script = Some(script),
            Err(err) => warn!(
                error = %format!("{err:#}"),
                "failed to schedule deferred cleanup"
            ),
        }
    }

    on_event(UninstallEvent::Phase(UninstallPhase::Done));
    info!(
        removed = outcome.removed.len(),
        restored = outcome.restored.len(),
        deferred = outcome.deferred.len(),
        "uninstall complete"
    );
    Ok(outcome)
}

fn hand_off_uninstall(
    request: &UninstallRequest<'_>,
    elevator: &dyn Elevator,
    cause: anyhow::Error,
) -> Result<UninstallOutcome> {
    if request.elevated {
        return Err(cause);
    }
    delegate_to_elevator(
        elevator,
        &ElevatedInvocation::Uninstall {
            install_root: request.install_root.to_path_buf(),
            parent_pid: std::process::id(),
        },
    )?;
    Ok(UninstallOutcome::with_status(UninstallStatus::Elevated))
}

fn remove_tracked_file<R>(
    destination: &Path,
    backup: &Path,
    had_backup: bool,
    remove_file: &mut R,
) -> FileRemoval
where
    R: FnMut(&Path) -> io::Result<()>,
{
    let restore = had_backup && backup.exists();

    if let Err(err) = remove_file(destination) {
        let mut actions = vec![DeferredAction::DeleteFile(destination.to_path_buf())];
        if restore {
            actions.push(restore_action(backup, destination));
        }
        return FileRemoval::Deferred {
            actions,
            reason: err.to_string(),
        };
    }

    if had_backup && !restore {
        warn!(
            backup = %backup.display(),
            "backup recorded in ledger is missing; nothing to restore"
        );
    }
    if !restore {
        return FileRemoval::Removed {
            restored_backup: false,
        };
    }

    if let Some(parent) = destination.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match move_file(backup, destination) {
        Ok(()) => FileRemoval::Removed {
            restored_backup: true,
        },
        Err(err) => FileRemoval::Deferred {
            actions: vec![restore_action(backup, destination)],
            reason: err.to_string(),
        },
    }
}

fn restore_action(backup: &Path, destination: &Path) -> DeferredAction {
    DeferredAction::RestoreBackup {
        backup: PathBuf::from(backup),
        destination: PathBuf::from(destination),
    }
}
