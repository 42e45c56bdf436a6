mod access;
mod deferred;
mod elevation;
mod file_installer;
mod fs_utils;
mod install;
mod journal;
mod layout;
mod ledger_store;
mod runtime;
mod staging;
mod types;
mod uninstall;

pub use access::{probe_write_access, AccessChecker, FsAccessChecker};
pub use deferred::{render_cleanup_script, DeferredCleanup, ScriptCleanupScheduler, ScriptFlavor};
pub use elevation::{
    CommandElevator, ElevatedInvocation, Elevator, ELEVATED_INSTALL_FLAG, ELEVATED_INSTALL_ROOT_FLAG,
    ELEVATED_STAGING_ROOT_FLAG, ELEVATED_UNINSTALL_FLAG,
};
pub use install::{install_patch, plan_install, InstallCollaborators, InstallRequest};
pub use layout::InstallLayout;
pub use ledger_store::{load_ledger, persist_ledger, read_ledger, remove_ledger_file};
pub use runtime::{CommandRuntimeInstaller, RuntimeInstaller};
pub use staging::{collect_staged_files, StagedFile};
pub use types::{
    AccessStatus, DeferredAction, InstallEvent, InstallOutcome, InstallPhase, InstallPlan,
    InstallReport, PlannedChange, PlannedChangeKind, RuntimeStatus, UninstallEvent,
    UninstallOutcome, UninstallPhase, UninstallStatus,
};
pub use uninstall::{uninstall_patch, UninstallCollaborators, UninstallRequest};

#[cfg(test)]
mod tests;
