use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Result};
use patchkit_core::PatchError;
use walkdir::WalkDir;

use crate::AccessStatus;

/// Decides whether the current user may modify an install tree.
pub trait AccessChecker {
    fn check_write_access(&self, root: &Path) -> Result<AccessStatus>;
}

/// Probes the real filesystem with [`probe_write_access`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FsAccessChecker;

impl AccessChecker for FsAccessChecker {
    fn check_write_access(&self, root: &Path) -> Result<AccessStatus> {
        probe_write_access(root)
    }
}

/// Create and remove a probe file in `root`, then require every directory
/// beneath it to be writable.
pub fn probe_write_access(root: &Path) -> Result<AccessStatus> {
    let metadata = fs::metadata(root)
        .map_err(|err| PatchError::file_operation("inspect install root", root, err))?;
    if !metadata.is_dir() {
        return Err(anyhow!(
            "install root is not a directory: {}",
            root.display()
        ));
    }

    let probe = root.join(format!(".patchkit-access-probe-{}", std::process::id()));
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
    {
        Ok(file) => {
            drop(file);
            let _ = fs::remove_file(&probe);
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            return Ok(AccessStatus::Denied);
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&probe);
        }
        Err(err) => {
            return Err(PatchError::file_operation("probe write access in", root, err).into());
        }
    }

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::PermissionDenied) {
                    return Ok(AccessStatus::Denied);
                }
                return Err(anyhow!(
                    "failed to inspect install tree {}: {err}",
                    root.display()
                ));
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let readonly = entry
            .metadata()
            .map(|metadata| metadata.permissions().readonly())
            .unwrap_or(false);
        if readonly {
            return Ok(AccessStatus::Denied);
        }
    }

    Ok(AccessStatus::Granted)
}
