use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use patchkit_core::{ledger_key, relative_to_staging_root, Ledger, PatchError};
use tracing::{debug, warn};

use crate::fs_utils::remove_file_if_exists;
use crate::journal::PassJournal;
use crate::InstallLayout;

/// Mutable state of one install pass, owned by the orchestrator and lent to
/// [`install_file`] one call at a time.
#[derive(Debug)]
pub(crate) struct InstallPass<'a> {
    pub(crate) layout: &'a InstallLayout,
    pub(crate) ledger: Ledger,
    /// Paths the previous install owned that this pass has not provided yet,
    /// keyed by ledger key.
    pub(crate) unused_old_files: BTreeMap<String, PathBuf>,
    pub(crate) journal: PassJournal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstalledFile {
    pub(crate) relative_path: PathBuf,
    /// A foreign file was backed up by this call.
    pub(crate) backed_up_now: bool,
}

impl<'a> InstallPass<'a> {
    pub(crate) fn begin(layout: &'a InstallLayout, ledger: Ledger) -> Self {
        let unused_old_files = ledger
            .relative_paths()
            .into_iter()
            .map(|relative| (ledger_key(&relative), relative))
            .collect();
        Self {
            layout,
            ledger,
            unused_old_files,
            journal: PassJournal::begin(layout),
        }
    }
}

/// Copy one staged file into the install tree, backing up a foreign file it
/// would overwrite the first time the patch claims that path.
pub(crate) fn install_file(
    pass: &mut InstallPass<'_>,
    staging_root: &Path,
    source: &Path,
) -> Result<InstalledFile> {
    let relative = relative_to_staging_root(source, staging_root)?;
    let destination = pass.layout.installed_path(&relative);
    let destination_exists = destination.exists();
    let preexisting = pass.ledger.entry(&relative).map(|entry| entry.had_backup);

    if let Some(parent) = destination.parent() {
        for created in pass.journal.ensure_dir(parent)? {
            if let Ok(relative_dir) = created.strip_prefix(pass.layout.install_root()) {
                pass.ledger.record_created_dir(relative_dir);
            }
        }
    }

    let (had_backup, backed_up_now) = match preexisting {
        Some(had_backup) => {
            pass.journal.displace(&destination)?;
            (had_backup, false)
        }
        None if destination_exists => {
            let backup = pass.ledger.backup_root().join(&relative);
            back_up_foreign_file(pass, &relative, &destination, &backup)?;
            (true, true)
        }
        None => {
            pass.journal.record_added_entry(&destination, None);
            pass.ledger.record_installed(&relative, false);
            (false, false)
        }
    };

    fs::copy(source, &destination)
        .map_err(|err| PatchError::file_operation("copy staged file to", &destination, err))?;
    pass.ledger.record_installed(&relative, had_backup);
    pass.unused_old_files.remove(&ledger_key(&relative));

    debug!(
        relative_path = %relative.display(),
        had_backup,
        backed_up_now,
        "installed staged file"
    );
    Ok(InstalledFile {
        relative_path: relative,
        backed_up_now,
    })
}

/// Copy the foreign file into the backup tree, then journal and record the
/// entry as one step so a revert always knows the backup exists.
fn back_up_foreign_file(
    pass: &mut InstallPass<'_>,
    relative: &Path,
    destination: &Path,
    backup: &Path,
) -> Result<()> {
    if let Some(parent) = backup.parent() {
        pass.journal.ensure_dir(parent)?;
    }
    if backup.exists() {
        warn!(
            backup = %backup.display(),
            "replacing orphaned backup that no ledger entry owns"
        );
        pass.journal.displace(backup)?;
    }

    if let Err(err) = fs::copy(destination, backup) {
        let _ = remove_file_if_exists(backup);
        return Err(PatchError::file_operation("back up", destination, err).into());
    }

    pass.journal.record_added_entry(destination, Some(backup));
    pass.ledger.record_installed(relative, true);
    debug!(
        relative_path = %relative.display(),
        backup = %backup.display(),
        "backed up pre-existing file"
    );
    Ok(())
}
