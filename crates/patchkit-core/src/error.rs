use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("access denied to install tree: {}", path.display())]
    AccessDenied { path: PathBuf },

    #[error(
        "staged file {} is not under staging root {}",
        file.display(),
        root.display()
    )]
    PathResolution { file: PathBuf, root: PathBuf },

    #[error(
        "staged file {} has a name that is not valid unicode and cannot be recorded in the install ledger",
        path.display()
    )]
    NonUnicodePath { path: PathBuf },

    #[error("install ledger is corrupt ({}): {reason}", path.display())]
    LedgerCorrupt { path: PathBuf, reason: String },

    #[error("failed to {operation} {}: {source}", path.display())]
    FileOperation {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("elevated process failed (exit_code={})", display_exit_code(*code))]
    ElevatedProcessFailed { code: Option<i32> },

    #[error("invalid patch configuration ({}): {reason}", path.display())]
    Config { path: PathBuf, reason: String },
}

pub type PatchResult<T> = std::result::Result<T, PatchError>;

impl PatchError {
    pub fn file_operation(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileOperation {
            operation,
            path: path.into(),
            source,
        }
    }

    /// True when the failure should be handed to the elevation collaborator
    /// rather than treated as final.
    pub fn is_access_denied(&self) -> bool {
        match self {
            Self::AccessDenied { .. } => true,
            Self::FileOperation { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Search an `anyhow` chain for an access-denied patch error.
    pub fn chain_is_access_denied(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            if let Some(patch_err) = cause.downcast_ref::<PatchError>() {
                return patch_err.is_access_denied();
            }
            cause
                .downcast_ref::<io::Error>()
                .is_some_and(|io_err| io_err.kind() == io::ErrorKind::PermissionDenied)
        })
    }
}

fn display_exit_code(code: Option<i32>) -> String {
    code.map(|value| value.to_string())
        .unwrap_or_else(|| "terminated".to_string())
}
