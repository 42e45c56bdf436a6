use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use patchkit_core::PatchError;
use tracing::{debug, warn};

use crate::fs_utils::{move_file, remove_file_if_exists};
use crate::InstallLayout;

static PASS_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
enum JournalAction {
    CreatedDir(PathBuf),
    AddedEntry {
        destination: PathBuf,
        backup: Option<PathBuf>,
    },
    Displaced {
        path: PathBuf,
        stash: Option<PathBuf>,
    },
    RestoredBackup {
        backup: PathBuf,
        destination: PathBuf,
    },
}

/// Undo log of one install pass. Every tree mutation is recorded here before
/// the ledger reflects it, so a failed pass can be replayed backwards.
#[derive(Debug)]
pub(crate) struct PassJournal {
    pass_id: String,
    stash_dir: PathBuf,
    stash_seq: u64,
    actions: Vec<JournalAction>,
}

impl PassJournal {
    pub(crate) fn begin(layout: &InstallLayout) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let sequence = PASS_COUNTER.fetch_add(1, Ordering::Relaxed);
        let pass_id = format!("pass-{nanos}-{}-{sequence}", std::process::id());
        let stash_dir = layout.pass_stash_dir(&pass_id);
        Self {
            pass_id,
            stash_dir,
            stash_seq: 0,
            actions: Vec::new(),
        }
    }

    pub(crate) fn pass_id(&self) -> &str {
        &self.pass_id
    }

    /// Create `dir` and any missing ancestors, remembering each one created.
    /// Returns the directories this call created, outermost first.
    pub(crate) fn ensure_dir(&mut self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut missing = Vec::new();
        let mut cursor = Some(dir);
        while let Some(candidate) = cursor {
            if candidate.as_os_str().is_empty() || candidate.exists() {
                break;
            }
            missing.push(candidate.to_path_buf());
            cursor = candidate.parent();
        }

        let mut created_now = Vec::new();
        for created in missing.into_iter().rev() {
            match fs::create_dir(&created) {
                Ok(()) => {
                    self.actions.push(JournalAction::CreatedDir(created.clone()));
                    created_now.push(created);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && created.is_dir() => {}
                Err(err) => {
                    return Err(PatchError::file_operation("create directory", created, err).into())
                }
            }
        }
        Ok(created_now)
    }

    /// Move `path` out of the way into this pass's stash and record it.
    /// A missing `path` is recorded too, so revert deletes whatever appears.
    pub(crate) fn displace(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.actions.push(JournalAction::Displaced {
                path: path.to_path_buf(),
                stash: None,
            });
            return Ok(());
        }

        let stash_dir = self.stash_dir.clone();
        self.ensure_dir(&stash_dir)?;
        self.stash_seq += 1;
        let stash = stash_dir.join(format!("{:06}", self.stash_seq));

        if let Err(err) = move_file(path, &stash) {
            let _ = remove_file_if_exists(&stash);
            return Err(PatchError::file_operation("set aside", path, err).into());
        }

        debug!(path = %path.display(), stash = %stash.display(), "set aside file for revert");
        self.actions.push(JournalAction::Displaced {
            path: path.to_path_buf(),
            stash: Some(stash),
        });
        Ok(())
    }

    pub(crate) fn record_added_entry(&mut self, destination: &Path, backup: Option<&Path>) {
        self.actions.push(JournalAction::AddedEntry {
            destination: destination.to_path_buf(),
            backup: backup.map(Path::to_path_buf),
        });
    }

    pub(crate) fn record_restored_backup(&mut self, backup: &Path, destination: &Path) {
        self.actions.push(JournalAction::RestoredBackup {
            backup: backup.to_path_buf(),
            destination: destination.to_path_buf(),
        });
    }

    /// Replay the journal backwards. Never fails; returns the paths that
    /// could not be put back.
    pub(crate) fn revert(mut self) -> Vec<PathBuf> {
        let mut unreverted = Vec::new();

        while let Some(action) = self.actions.pop() {
            match action {
                JournalAction::CreatedDir(dir) => {
                    if fs::remove_dir(&dir).is_err() && dir.exists() {
                        unreverted.push(dir);
                    }
                }
                JournalAction::AddedEntry {
                    destination,
                    backup,
                } => {
                    if remove_file_if_exists(&destination).is_err() {
                        unreverted.push(destination);
                        continue;
                    }
                    if let Some(backup) = backup {
                        if move_file(&backup, &destination).is_err() {
                            unreverted.push(destination);
                        }
                    }
                }
                JournalAction::Displaced { path, stash } => {
                    if remove_file_if_exists(&path).is_err() {
                        unreverted.push(path);
                        continue;
                    }
                    if let Some(stash) = stash {
                        if move_file(&stash, &path).is_err() {
                            unreverted.push(path);
                        }
                    }
                }
                JournalAction::RestoredBackup {
                    backup,
                    destination,
                } => {
                    if let Some(parent) = backup.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    if move_file(&destination, &backup).is_err() {
                        unreverted.push(destination);
                    }
                }
            }
        }

        if unreverted.is_empty() {
            self.discard_stash();
        } else {
            // the stash may hold the only copy of a displaced file
            for path in &unreverted {
                warn!(
                    path = %path.display(),
                    stash = %self.stash_dir.display(),
                    "could not revert path after failed install"
                );
            }
        }
        unreverted
    }

    /// Drop the stash after a committed pass.
    pub(crate) fn finish(self) {
        self.discard_stash();
    }

    fn discard_stash(&self) {
        if self.stash_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&self.stash_dir) {
                warn!(
                    stash = %self.stash_dir.display(),
                    error = %err,
                    "failed to remove install pass stash"
                );
            }
        }
        if let Some(pass_dir) = self.stash_dir.parent() {
            let _ = fs::remove_dir(pass_dir);
        }
    }
}
