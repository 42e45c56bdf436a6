use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use patchkit_core::{ledger_key, relative_to_staging_root, PatchConfig};
use walkdir::WalkDir;

use crate::InstallLayout;

/// One file shipped alongside the installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub source: PathBuf,
    pub relative_path: PathBuf,
}

/// Enumerate the staged file set under `staging_root`, sorted by relative
/// path. Layout bookkeeping files and configured exclusions are skipped.
pub fn collect_staged_files(
    staging_root: &Path,
    layout: &InstallLayout,
    config: &PatchConfig,
) -> Result<Vec<StagedFile>> {
    let excluded_keys = layout
        .reserved_relative_paths()
        .into_iter()
        .chain(config.excluded_paths())
        .map(|path| ledger_key(&path))
        .collect::<Vec<_>>();

    let mut staged = Vec::new();
    for entry in WalkDir::new(staging_root).follow_links(false) {
        let entry = entry.with_context(|| {
            format!(
                "failed to enumerate staged files under {}",
                staging_root.display()
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative_path = relative_to_staging_root(entry.path(), staging_root)?;
        let key = ledger_key(&relative_path);
        if excluded_keys
            .iter()
            .any(|excluded| key == *excluded || key.starts_with(&format!("{excluded}/")))
        {
            continue;
        }

        staged.push(StagedFile {
            source: entry.path().to_path_buf(),
            relative_path,
        });
    }

    staged.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(staged)
}
