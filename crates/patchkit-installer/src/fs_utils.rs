use std::fs;
use std::io;
use std::path::Path;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Rename `src` onto `dst`, replacing it. Falls back to copy + delete when
/// the rename crosses filesystems.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !src.is_file() {
                return Err(rename_err);
            }
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

/// Remove every empty directory beneath and including `root`, deepest first.
pub fn prune_empty_dirs(root: &Path) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            prune_empty_dirs(&entry.path());
        }
    }
    let _ = fs::remove_dir(root);
}
