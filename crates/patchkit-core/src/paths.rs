use std::path::{Component, Path, PathBuf};

use crate::{PatchError, PatchResult};

/// Resolve a staged file to its path relative to the staging root.
///
/// The result uses host separators and never starts with a separator.
pub fn relative_to_staging_root(file: &Path, staging_root: &Path) -> PatchResult<PathBuf> {
    let resolution_error = || PatchError::PathResolution {
        file: file.to_path_buf(),
        root: staging_root.to_path_buf(),
    };

    let stripped = file
        .strip_prefix(staging_root)
        .map_err(|_| resolution_error())?;

    let mut relative = PathBuf::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(resolution_error()),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(resolution_error());
    }
    if relative.to_str().is_none() {
        return Err(PatchError::NonUnicodePath {
            path: file.to_path_buf(),
        });
    }

    Ok(relative)
}

/// Parse a persisted or configured relative path, rejecting anything that
/// could escape the root it is joined onto.
pub fn validated_relative_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let normalized = trimmed.replace(['/', '\\'], std::path::MAIN_SEPARATOR_STR);
    let path = Path::new(&normalized);
    if path.is_absolute() {
        return None;
    }

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Host-separator string form of a relative path, as stored in the ledger.
pub fn relative_path_string(relative: &Path) -> String {
    relative.to_string_lossy().into_owned()
}

/// Identity of a relative path on the host filesystem. Windows and macOS
/// filesystems compare names case-insensitively, so keys fold case there.
pub fn ledger_key(relative: &Path) -> String {
    let joined = relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");

    if cfg!(any(windows, target_os = "macos")) {
        joined.to_lowercase()
    } else {
        joined
    }
}

/// Install root for a game executable picked by discovery or a file dialog.
pub fn install_root_from_executable(
    executable: &Path,
    expected_name: Option<&str>,
) -> anyhow::Result<PathBuf> {
    let file_name = executable
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("not an executable path: {}", executable.display()))?;

    if let Some(expected) = expected_name {
        if !file_name.eq_ignore_ascii_case(expected) {
            return Err(anyhow::anyhow!(
                "expected game executable '{expected}', got '{file_name}'"
            ));
        }
    }

    let parent = executable
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "game executable has no parent directory: {}",
                executable.display()
            )
        })?;
    Ok(parent.to_path_buf())
}
