use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::paths::{ledger_key, relative_path_string, validated_relative_path};

pub const LEDGER_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub relative_path: PathBuf,
    pub had_backup: bool,
}

/// Record of every file the patch owns under an install root.
///
/// Entries are keyed by [`ledger_key`], so two spellings of the same path on
/// a case-insensitive host refer to one entry. The first spelling recorded is
/// the one persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    install_root: PathBuf,
    backup_root: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
    /// Directories the patch created inside the install root, keyed like
    /// entries. Only these are removed again on uninstall.
    created_dirs: BTreeMap<String, PathBuf>,
}

/// On-disk shape of a [`Ledger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    #[serde(default = "default_format_version")]
    pub version: u32,
    pub install_path: String,
    pub backup_path: String,
    #[serde(default)]
    pub installed_files: BTreeMap<String, bool>,
    #[serde(default)]
    pub created_dirs: Vec<String>,
}

fn default_format_version() -> u32 {
    LEDGER_FORMAT_VERSION
}

impl Ledger {
    pub fn new(install_root: impl Into<PathBuf>, backup_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            backup_root: backup_root.into(),
            entries: BTreeMap::new(),
            created_dirs: BTreeMap::new(),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, relative: &Path) -> Option<&LedgerEntry> {
        self.entries.get(&ledger_key(relative))
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.entries.contains_key(&ledger_key(relative))
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn relative_paths(&self) -> Vec<PathBuf> {
        self.entries
            .values()
            .map(|entry| entry.relative_path.clone())
            .collect()
    }

    /// Upsert one entry. An existing entry keeps its recorded spelling.
    pub fn record_installed(&mut self, relative: &Path, had_backup: bool) {
        self.entries
            .entry(ledger_key(relative))
            .and_modify(|entry| entry.had_backup = had_backup)
            .or_insert_with(|| LedgerEntry {
                relative_path: relative.to_path_buf(),
                had_backup,
            });
    }

    pub fn record_created_dir(&mut self, relative: &Path) {
        self.created_dirs
            .entry(ledger_key(relative))
            .or_insert_with(|| relative.to_path_buf());
    }

    /// Created directories ordered so every directory comes before its
    /// parent.
    pub fn created_dirs_deepest_first(&self) -> Vec<PathBuf> {
        let mut dirs = self.created_dirs.values().cloned().collect::<Vec<_>>();
        dirs.sort_by(|left, right| {
            right
                .components()
                .count()
                .cmp(&left.components().count())
                .then_with(|| left.cmp(right))
        });
        dirs
    }

    pub fn remove_entry(&mut self, relative: &Path) -> Option<LedgerEntry> {
        self.entries.remove(&ledger_key(relative))
    }

    /// Point the ledger at a new install root. A backup root that lived under
    /// the old install root moves with it.
    pub fn rebase(&mut self, install_root: &Path, fallback_backup_root: &Path) {
        let backup_root = match self.backup_root.strip_prefix(&self.install_root) {
            Ok(relative) => install_root.join(relative),
            Err(_) => fallback_backup_root.to_path_buf(),
        };
        self.install_root = install_root.to_path_buf();
        self.backup_root = backup_root;
    }

    pub fn to_document(&self) -> LedgerDocument {
        LedgerDocument {
            version: LEDGER_FORMAT_VERSION,
            install_path: self.install_root.to_string_lossy().into_owned(),
            backup_path: self.backup_root.to_string_lossy().into_owned(),
            installed_files: self
                .entries
                .values()
                .map(|entry| (relative_path_string(&entry.relative_path), entry.had_backup))
                .collect(),
            created_dirs: self
                .created_dirs
                .values()
                .map(|dir| relative_path_string(dir))
                .collect(),
        }
    }

    pub fn from_document(document: LedgerDocument) -> Result<Self, String> {
        if document.version > LEDGER_FORMAT_VERSION {
            return Err(format!(
                "unsupported ledger version {} (newest supported is {})",
                document.version, LEDGER_FORMAT_VERSION
            ));
        }
        if document.install_path.trim().is_empty() {
            return Err("installPath must not be empty".to_string());
        }
        if document.backup_path.trim().is_empty() {
            return Err("backupPath must not be empty".to_string());
        }

        let mut ledger = Self::new(&document.install_path, &document.backup_path);
        for (raw_path, had_backup) in document.installed_files {
            let relative = validated_relative_path(&raw_path)
                .ok_or_else(|| format!("invalid installed file path: '{raw_path}'"))?;
            ledger.record_installed(&relative, had_backup);
        }
        for raw_dir in document.created_dirs {
            let relative = validated_relative_path(&raw_dir)
                .ok_or_else(|| format!("invalid created directory path: '{raw_dir}'"))?;
            ledger.record_created_dir(&relative);
        }
        Ok(ledger)
    }

    pub fn to_json_string(&self) -> serde_json::Result<String> {
        let mut rendered = serde_json::to_string_pretty(&self.to_document())?;
        rendered.push('\n');
        Ok(rendered)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, String> {
        let document: LedgerDocument =
            serde_json::from_str(raw).map_err(|err| format!("invalid ledger JSON: {err}"))?;
        Self::from_document(document)
    }
}
