use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, Scope, ScopedJoinHandle};

use anyhow::{anyhow, Result};
use patchkit_core::{ledger_key, PatchConfig, PatchError};
use tracing::{info, warn};

use crate::access::AccessChecker;
use crate::elevation::{delegate_to_elevator, ElevatedInvocation, Elevator};
use crate::file_installer::{install_file, InstallPass};
use crate::fs_utils::move_file;
use crate::ledger_store::{load_ledger, persist_ledger, remove_ledger_file};
use crate::runtime::RuntimeInstaller;
use crate::staging::{collect_staged_files, StagedFile};
use crate::{
    AccessStatus, InstallEvent, InstallLayout, InstallOutcome, InstallPhase, InstallPlan,
    InstallReport, PlannedChange, PlannedChangeKind, RuntimeStatus,
};

#[derive(Debug, Clone, Copy)]
pub struct InstallRequest<'a> {
    pub staging_root: &'a Path,
    pub install_root: &'a Path,
    pub config: &'a PatchConfig,
    /// Set when this process is already the elevated re-entry.
    pub elevated: bool,
}

#[derive(Clone, Copy)]
pub struct InstallCollaborators<'a> {
    pub access: &'a dyn AccessChecker,
    pub elevator: &'a dyn Elevator,
    pub runtime: Option<&'a dyn RuntimeInstaller>,
}

/// Points inside a pass where a test can inject a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassCheckpoint<'p> {
    InstallingFile(&'p Path),
    InstalledFile(&'p Path),
    TidyingFile(&'p Path),
    Persisting,
    Persisted,
}

/// Install the staged file set into `request.install_root` as one pass.
///
/// On failure every change of the pass is reverted and the error returned.
/// Insufficient access hands the whole pass to an elevated instance unless
/// `request.elevated` is already set.
pub fn install_patch<F>(
    request: &InstallRequest<'_>,
    collaborators: &InstallCollaborators<'_>,
    on_event: F,
) -> Result<InstallOutcome>
where
    F: FnMut(InstallEvent),
{
    install_patch_with_hooks(request, collaborators, on_event, |_| Ok(()))
}

pub(crate) fn install_patch_with_hooks<F, H>(
    request: &InstallRequest<'_>,
    collaborators: &InstallCollaborators<'_>,
    mut on_event: F,
    mut checkpoint: H,
) -> Result<InstallOutcome>
where
    F: FnMut(InstallEvent),
    H: FnMut(PassCheckpoint<'_>) -> Result<()>,
{
    on_event(InstallEvent::Phase(InstallPhase::CheckingAccess));
    validate_roots(request.staging_root, request.install_root)?;

    if collaborators.access.check_write_access(request.install_root)? == AccessStatus::Denied {
        let denied = PatchError::AccessDenied {
            path: request.install_root.to_path_buf(),
        };
        return hand_off_install(request, collaborators.elevator, denied.into());
    }

    let layout = InstallLayout::for_config(request.install_root, request.config);
    let staged = collect_staged_files(request.staging_root, &layout, request.config)?;

    let result = thread::scope(|scope| {
        let mut runtime_job = Some(start_runtime_install(scope, collaborators.runtime));
        let mut await_runtime = || {
            runtime_job
                .take()
                .map(RuntimeJob::wait)
                .unwrap_or(RuntimeStatus::NotConfigured)
        };
        let result = run_install_pass(
            &layout,
            request.staging_root,
            &staged,
            &mut await_runtime,
            &mut on_event,
            &mut checkpoint,
        );
        if let Some(job) = runtime_job.take() {
            job.wait();
        }
        result
    });

    match result {
        Ok(report) => {
            on_event(InstallEvent::Phase(InstallPhase::Done));
            info!(
                installed = report.installed.len(),
                backed_up = report.backed_up.len(),
                tidied = report.tidied.len(),
                "install complete"
            );
            Ok(InstallOutcome::Installed(report))
        }
        Err(err) if !request.elevated && PatchError::chain_is_access_denied(&err) => {
            hand_off_install(request, collaborators.elevator, err)
        }
        Err(err) => Err(err),
    }
}

/// Dry run: what a pass would do to `install_root` right now.
pub fn plan_install(
    staging_root: &Path,
    install_root: &Path,
    config: &PatchConfig,
) -> Result<InstallPlan> {
    validate_roots(staging_root, install_root)?;
    let layout = InstallLayout::for_config(install_root, config);
    let ledger = load_ledger(&layout)?;
    let staged = collect_staged_files(staging_root, &layout, config)?;

    let mut unused = ledger
        .entries()
        .map(|entry| (ledger_key(&entry.relative_path), entry))
        .collect::<BTreeMap<_, _>>();
    let mut changes = Vec::new();

    for file in &staged {
        let kind = if ledger.contains(&file.relative_path) {
            PlannedChangeKind::Replace
        } else if layout.installed_path(&file.relative_path).exists() {
            PlannedChangeKind::AddWithBackup
        } else {
            PlannedChangeKind::Add
        };
        unused.remove(&ledger_key(&file.relative_path));
        changes.push(PlannedChange {
            relative_path: file.relative_path.clone(),
            kind,
        });
    }

    for entry in unused.into_values() {
        let restores = entry.had_backup && ledger.backup_root().join(&entry.relative_path).exists();
        changes.push(PlannedChange {
            relative_path: entry.relative_path.clone(),
            kind: if restores {
                PlannedChangeKind::RemoveAndRestore
            } else {
                PlannedChangeKind::Remove
            },
        });
    }

    Ok(InstallPlan {
        install_root: install_root.to_path_buf(),
        changes,
    })
}

fn validate_roots(staging_root: &Path, install_root: &Path) -> Result<()> {
    for (label, root) in [("staging root", staging_root), ("install root", install_root)] {
        if !root.is_dir() {
            return Err(anyhow!("{label} is not a directory: {}", root.display()));
        }
    }
    let same = match (fs::canonicalize(staging_root), fs::canonicalize(install_root)) {
        (Ok(staging), Ok(install)) => staging == install,
        _ => staging_root == install_root,
    };
    if same {
        return Err(anyhow!(
            "staging root and install root must differ: {}",
            install_root.display()
        ));
    }
    Ok(())
}

fn hand_off_install(
    request: &InstallRequest<'_>,
    elevator: &dyn Elevator,
    cause: anyhow::Error,
) -> Result<InstallOutcome> {
    if request.elevated {
        return Err(cause);
    }
    delegate_to_elevator(
        elevator,
        &ElevatedInvocation::Install {
            install_root: request.install_root.to_path_buf(),
            staging_root: request.staging_root.to_path_buf(),
        },
    )?;
    Ok(InstallOutcome::Elevated)
}

enum RuntimeJob<'scope> {
    Finished(RuntimeStatus),
    Running(ScopedJoinHandle<'scope, RuntimeStatus>),
}

impl RuntimeJob<'_> {
    fn wait(self) -> RuntimeStatus {
        let status = match self {
            Self::Finished(status) => status,
            Self::Running(handle) => handle.join().unwrap_or_else(|_| {
                RuntimeStatus::Failed("runtime installer panicked".to_string())
            }),
        };
        if let RuntimeStatus::Failed(reason) = &status {
            warn!(reason = %reason, "runtime dependency install failed");
        }
        status
    }
}

fn start_runtime_install<'scope, 'env>(
    scope: &'scope Scope<'scope, 'env>,
    runtime: Option<&'env dyn RuntimeInstaller>,
) -> RuntimeJob<'scope> {
    let Some(runtime) = runtime else {
        return RuntimeJob::Finished(RuntimeStatus::NotConfigured);
    };
    if runtime.is_installed() {
        return RuntimeJob::Finished(RuntimeStatus::AlreadyInstalled);
    }
    RuntimeJob::Running(scope.spawn(move || match runtime.install() {
        Ok(()) => RuntimeStatus::Installed,
        Err(err) => RuntimeStatus::Failed(format!("{err:#}")),
    }))
}

fn run_install_pass<W, F, H>(
    layout: &InstallLayout,
    staging_root: &Path,
    staged: &[StagedFile],
    await_runtime: &mut W,
    on_event: &mut F,
    checkpoint: &mut H,
) -> Result<InstallReport>
where
    W: FnMut() -> RuntimeStatus,
    F: FnMut(InstallEvent),
    H: FnMut(PassCheckpoint<'_>) -> Result<()>,
{
    on_event(InstallEvent::Phase(InstallPhase::InstallingFiles));
    let previous_ledger = fs::read(layout.ledger_path()).ok();
    let ledger = load_ledger(layout)?;
    let previously_installed = ledger.len();
    let mut pass = InstallPass::begin(layout, ledger);
    info!(
        pass_id = pass.journal.pass_id(),
        staged = staged.len(),
        previously_installed,
        "starting install pass"
    );

    let mut persisted = false;
    match apply_install_pass(
        &mut pass,
        staging_root,
        staged,
        await_runtime,
        on_event,
        checkpoint,
        &mut persisted,
    ) {
        Ok(report) => {
            pass.journal.finish();
            Ok(report)
        }
        Err(err) => {
            on_event(InstallEvent::Phase(InstallPhase::RevertingAndFailed));
            warn!(error = %format!("{err:#}"), "install pass failed; reverting");
            let unreverted = revert_install_pass(pass, previous_ledger.as_deref(), persisted);
            if !unreverted.is_empty() {
                on_event(InstallEvent::RevertIncomplete { paths: unreverted });
            }
            Err(err)
        }
    }
}

fn apply_install_pass<W, F, H>(
    pass: &mut InstallPass<'_>,
    staging_root: &Path,
    staged: &[StagedFile],
    await_runtime: &mut W,
    on_event: &mut F,
    checkpoint: &mut H,
    persisted: &mut bool,
) -> Result<InstallReport>
where
    W: FnMut() -> RuntimeStatus,
    F: FnMut(InstallEvent),
    H: FnMut(PassCheckpoint<'_>) -> Result<()>,
{
    let mut installed = Vec::with_capacity(staged.len());
    let mut backed_up = Vec::new();
    let total = staged.len();

    for (index, file) in staged.iter().enumerate() {
        checkpoint(PassCheckpoint::InstallingFile(&file.relative_path))?;
        let outcome = install_file(pass, staging_root, &file.source)?;
        checkpoint(PassCheckpoint::InstalledFile(&outcome.relative_path))?;

        on_event(InstallEvent::FileInstalled {
            relative_path: outcome.relative_path.clone(),
            backed_up: outcome.backed_up_now,
            current: index + 1,
            total,
        });
        if outcome.backed_up_now {
            backed_up.push(outcome.relative_path.clone());
        }
        installed.push(outcome.relative_path);
    }

    on_event(InstallEvent::Phase(InstallPhase::Tidying));
    let mut tidied = Vec::new();
    for relative in std::mem::take(&mut pass.unused_old_files).into_values() {
        checkpoint(PassCheckpoint::TidyingFile(&relative))?;
        let restored_backup = tidy_file(pass, &relative)?;
        on_event(InstallEvent::FileTidied {
            relative_path: relative.clone(),
            restored_backup,
        });
        tidied.push(relative);
    }

    on_event(InstallEvent::Phase(InstallPhase::Persisting));
    let runtime = await_runtime();
    on_event(InstallEvent::RuntimeFinished(runtime.clone()));

    checkpoint(PassCheckpoint::Persisting)?;
    let layout = pass.layout;
    pass.journal.ensure_dir(&layout.state_dir())?;
    let ledger_path = persist_ledger(layout, &pass.ledger)?;
    *persisted = true;
    checkpoint(PassCheckpoint::Persisted)?;

    Ok(InstallReport {
        installed,
        backed_up,
        tidied,
        runtime,
        ledger_path,
    })
}

/// Remove a file the previous install owned but this pass no longer ships,
/// putting the original back when one was backed up.
fn tidy_file(pass: &mut InstallPass<'_>, relative: &Path) -> Result<bool> {
    let Some(entry) = pass.ledger.entry(relative).cloned() else {
        return Ok(false);
    };
    let destination = pass.layout.installed_path(relative);
    pass.journal.displace(&destination)?;

    let mut restored = false;
    if entry.had_backup {
        let backup = pass.ledger.backup_root().join(relative);
        if backup.exists() {
            if let Some(parent) = destination.parent() {
                pass.journal.ensure_dir(parent)?;
            }
            move_file(&backup, &destination)
                .map_err(|err| PatchError::file_operation("restore backup to", &destination, err))?;
            pass.journal.record_restored_backup(&backup, &destination);
            restored = true;
        } else {
            warn!(
                relative_path = %relative.display(),
                "backup recorded in ledger is missing; nothing to restore"
            );
        }
    }

    pass.ledger.remove_entry(relative);
    Ok(restored)
}

/// Put the tree and the ledger file back to their pre-pass state.
fn revert_install_pass(
    pass: InstallPass<'_>,
    previous_ledger: Option<&[u8]>,
    persisted: bool,
) -> Vec<PathBuf> {
    let layout = pass.layout;
    let mut unreverted = Vec::new();

    if persisted {
        let restored: Result<()> = match previous_ledger {
            Some(bytes) => fs::write(layout.ledger_path(), bytes).map_err(|err| {
                PatchError::file_operation("restore install ledger", layout.ledger_path(), err)
                    .into()
            }),
            None => remove_ledger_file(layout),
        };
        if let Err(err) = restored {
            warn!(error = %format!("{err:#}"), "failed to restore install ledger");
            unreverted.push(layout.ledger_path());
        }
    }

    unreverted.extend(pass.journal.revert());
    unreverted
}
