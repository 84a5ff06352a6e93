use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const PRIVATE_DIR_MODE: u32 = 0o700;
pub const EXPORT_FILE_MODE: u32 = 0o640;

#[cfg(unix)]
pub fn apply_umask() {
    // Exports and engine spill files are never world-readable.
    unsafe {
        libc::umask(0o027);
    }
}

#[cfg(not(unix))]
pub fn apply_umask() {}

/// Creates `path` (and parents) and restricts it to the owner. Returns the
/// canonical location so the engine is handed an absolute path.
pub fn prepare_private_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))?;
    set_mode(path, PRIVATE_DIR_MODE)?;
    path.canonicalize()
        .with_context(|| format!("failed to canonicalize {}", path.display()))
}

/// Applies [`EXPORT_FILE_MODE`] to a written export; a missing file is ignored.
pub fn restrict_export_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    set_mode(path, EXPORT_FILE_MODE)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to chmod {} to {:o}", path.display(), mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn engine_temp_dir_is_owner_only() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = prepare_private_dir(&temp.path().join("engine/spill"))?;
        assert!(dir.is_absolute());
        let mode = fs::metadata(&dir)?.permissions().mode() & 0o777;
        assert_eq!(mode, PRIVATE_DIR_MODE);
        Ok(())
    }

    #[test]
    fn missing_export_file_is_not_an_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        restrict_export_file(&temp.path().join("absent.csv"))?;
        Ok(())
    }
}
