use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use patchkit_core::{Ledger, PatchError};
use tracing::{debug, warn};

use crate::fs_utils::remove_file_if_exists;
use crate::InstallLayout;

/// Read the persisted ledger of `layout`, if one exists.
pub fn read_ledger(layout: &InstallLayout) -> Result<Option<Ledger>> {
    let path = layout.ledger_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(PatchError::LedgerCorrupt {
                path,
                reason: err.to_string(),
            }
            .into());
        }
        Err(err) => return Err(PatchError::file_operation("read install ledger", path, err).into()),
    };

    let mut ledger =
        Ledger::from_json_str(&raw).map_err(|reason| PatchError::LedgerCorrupt {
            path: path.clone(),
            reason,
        })?;

    if ledger.install_root() != layout.install_root() {
        warn!(
            recorded = %ledger.install_root().display(),
            actual = %layout.install_root().display(),
            "install ledger was written for a different location; rebasing"
        );
        ledger.rebase(layout.install_root(), &layout.backup_dir());
    }

    debug!(path = %path.display(), entries = ledger.len(), "loaded install ledger");
    Ok(Some(ledger))
}

/// Existing ledger, or a fresh one rooted at `layout` when none was persisted.
pub fn load_ledger(layout: &InstallLayout) -> Result<Ledger> {
    Ok(read_ledger(layout)?
        .unwrap_or_else(|| Ledger::new(layout.install_root(), layout.backup_dir())))
}

/// Write the ledger to its reserved location via a temp file and rename, so
/// readers only ever see the previous or the new content.
pub fn persist_ledger(layout: &InstallLayout, ledger: &Ledger) -> Result<PathBuf> {
    let path = layout.ledger_path();
    let tmp_path = layout.ledger_tmp_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| PatchError::file_operation("create ledger directory", parent, err))?;
    }

    let payload = ledger
        .to_json_string()
        .context("failed to serialize install ledger")?;

    let write_result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()
    })();
    if let Err(err) = write_result {
        let _ = remove_file_if_exists(&tmp_path);
        return Err(PatchError::file_operation("write install ledger", &tmp_path, err).into());
    }

    if let Err(err) = fs::rename(&tmp_path, &path) {
        let _ = remove_file_if_exists(&tmp_path);
        return Err(PatchError::file_operation("replace install ledger", &path, err).into());
    }

    debug!(path = %path.display(), entries = ledger.len(), "persisted install ledger");
    Ok(path)
}

pub fn remove_ledger_file(layout: &InstallLayout) -> Result<()> {
    let path = layout.ledger_path();
    remove_file_if_exists(&path)
        .map_err(|err| PatchError::file_operation("remove install ledger", &path, err))?;
    Ok(())
}
