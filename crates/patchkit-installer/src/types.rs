use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPhase {
    CheckingAccess,
    InstallingFiles,
    Tidying,
    Persisting,
    Done,
    RevertingAndFailed,
}

impl InstallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckingAccess => "checking_access",
            Self::InstallingFiles => "installing_files",
            Self::Tidying => "tidying",
            Self::Persisting => "persisting",
            Self::Done => "done",
            Self::RevertingAndFailed => "reverting_and_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallPhase {
    CheckingAccess,
    Removing,
    Cleanup,
    Done,
}

impl UninstallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckingAccess => "checking_access",
            Self::Removing => "removing",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallEvent {
    Phase(InstallPhase),
    FileInstalled {
        relative_path: PathBuf,
        backed_up: bool,
        current: usize,
        total: usize,
    },
    FileTidied {
        relative_path: PathBuf,
        restored_backup: bool,
    },
    RuntimeFinished(RuntimeStatus),
    RevertIncomplete {
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallEvent {
    Phase(UninstallPhase),
    FileRemoved {
        relative_path: PathBuf,
        restored_backup: bool,
        current: usize,
        total: usize,
    },
    FileDeferred {
        relative_path: PathBuf,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    NotConfigured,
    AlreadyInstalled,
    Installed,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<PathBuf>,
    pub backed_up: Vec<PathBuf>,
    pub tidied: Vec<PathBuf>,
    pub runtime: RuntimeStatus,
    pub ledger_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(InstallReport),
    /// An elevated instance performed the install and exited successfully.
    Elevated,
}

/// Work the uninstaller could not finish while running; replayed by the
/// deferred cleanup after this process exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredAction {
    DeleteFile(PathBuf),
    RestoreBackup {
        backup: PathBuf,
        destination: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UninstallStatus {
    NotInstalled,
    Uninstalled,
    Elevated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallOutcome {
    pub status: UninstallStatus,
    pub removed: Vec<PathBuf>,
    pub restored: Vec<PathBuf>,
    pub deferred: Vec<DeferredAction>,
    pub cleanup_script: Option<PathBuf>,
}

impl UninstallOutcome {
    pub(crate) fn with_status(status: UninstallStatus) -> Self {
        Self {
            status,
            removed: Vec::new(),
            restored: Vec::new(),
            deferred: Vec::new(),
            cleanup_script: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedChangeKind {
    Add,
    AddWithBackup,
    Replace,
    Remove,
    RemoveAndRestore,
}

impl PlannedChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::AddWithBackup => "add+backup",
            Self::Replace => "replace",
            Self::Remove => "remove",
            Self::RemoveAndRestore => "remove+restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub relative_path: PathBuf,
    pub kind: PlannedChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub install_root: PathBuf,
    pub changes: Vec<PlannedChange>,
}
