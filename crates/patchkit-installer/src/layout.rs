use std::path::{Path, PathBuf};

use patchkit_core::PatchConfig;

const LEDGER_FILE_NAME: &str = "install_ledger.json";
const BACKUP_DIR_NAME: &str = "backup";
const PASS_DIR_NAME: &str = "pass";
const CLEANUP_SCRIPT_STEM: &str = "~patchkit-finish-uninstall";

/// Reserved paths of one install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    install_root: PathBuf,
    state_dir: PathBuf,
}

impl InstallLayout {
    /// `state_dir` is relative to `install_root`.
    pub fn new(install_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn for_config(install_root: impl Into<PathBuf>, config: &PatchConfig) -> Self {
        Self::new(install_root, config.state_dir())
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.install_root.join(&self.state_dir)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join(LEDGER_FILE_NAME)
    }

    pub fn ledger_tmp_path(&self) -> PathBuf {
        self.state_dir().join(format!("{LEDGER_FILE_NAME}.tmp"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir().join(BACKUP_DIR_NAME)
    }

    pub fn pass_dir(&self) -> PathBuf {
        self.state_dir().join(PASS_DIR_NAME)
    }

    pub fn pass_stash_dir(&self, pass_id: &str) -> PathBuf {
        self.pass_dir().join(pass_id)
    }

    pub fn installed_path(&self, relative: &Path) -> PathBuf {
        self.install_root.join(relative)
    }

    pub fn cleanup_script_path(&self) -> PathBuf {
        let extension = if cfg!(windows) { "bat" } else { "sh" };
        self.install_root
            .join(format!("{CLEANUP_SCRIPT_STEM}.{extension}"))
    }

    /// Relative paths under a staging root that belong to this layout's
    /// bookkeeping and are never part of the staged file set.
    pub fn reserved_relative_paths(&self) -> Vec<PathBuf> {
        let mut reserved = vec![
            self.state_dir.join(LEDGER_FILE_NAME),
            self.state_dir.join(format!("{LEDGER_FILE_NAME}.tmp")),
            self.state_dir.join(BACKUP_DIR_NAME),
            self.state_dir.join(PASS_DIR_NAME),
        ];
        for extension in ["bat", "sh"] {
            reserved.push(PathBuf::from(format!("{CLEANUP_SCRIPT_STEM}.{extension}")));
        }
        reserved
    }
}
