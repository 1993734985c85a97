use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{CatalogError, Result};

/// `<target>.tmp`, next to the target so the rename stays on one filesystem.
pub(crate) fn temp_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `contents` to a sibling temp file, then rename it over `target`.
/// The temp file is removed if either step fails.
pub(crate) fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
    }
    let tmp = temp_path(target);
    let outcome = fs::write(&tmp, contents)
        .map_err(|e| CatalogError::io(&tmp, e))
        .and_then(|()| fs::rename(&tmp, target).map_err(|e| CatalogError::io(target, e)));
    if outcome.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_target_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("database.xml");
        fs::write(&target, "old").unwrap();
        write_atomic(&target, b"new").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn failed_rename_cleans_up_temp() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way makes the rename fail.
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();
        assert!(write_atomic(&target, b"data").is_err());
        assert!(!temp_path(&target).exists());
        assert!(target.is_dir());
    }
}
