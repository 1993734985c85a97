//! Timestamped copies of the catalog file, taken before anything destructive.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::atomic::write_atomic;
use crate::error::{CatalogError, Result};

pub const DEFAULT_KEEP: usize = 10;
const PRE_RESTORE_LABEL: &str = "pre-restore";

/// Data-dir fallback used when no backup directory is configured.
pub fn default_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vdj-catalog")
        .join("backups")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Local>,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(CatalogError::ValidationFailed(format!(
            "backup label '{label}' may only contain letters, digits and '-'"
        )));
    }
    Ok(())
}

/// `<stem>_<label>_<YYYYmmdd>_<HHMMSS>_<ms>[_n].xml` -> label.
fn label_from_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".xml")?;
    let mut parts: Vec<&str> = stem.rsplit('_').collect();
    // A trailing collision counter is one field longer than the millis.
    if parts.len() > 4 && parts[0].len() < 3 && parts[1].len() == 3 {
        parts.remove(0);
    }
    let [_ms, time, date, label, ..] = parts.as_slice() else {
        return None;
    };
    let stamped = date.len() == 8 && time.len() == 6;
    (stamped && parts.len() >= 5).then(|| label.to_string())
}

fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| CatalogError::from_io(path, e))
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy `db_path` into the backup directory. The copy's mtime is the
    /// copy time, nudged forward so it is strictly newer than every
    /// existing backup.
    pub fn create(&self, db_path: &Path, label: &str) -> Result<PathBuf> {
        validate_label(label)?;
        if !db_path.is_file() {
            return Err(CatalogError::NotFound(db_path.display().to_string()));
        }
        let stem = db_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database".to_string());
        let timestamp = Local::now().format("%Y%m%d_%H%M%S_%3f");
        let base = format!("{stem}_{label}_{timestamp}");
        let mut target = self.dir.join(format!("{base}.xml"));
        let mut counter = 1;
        while target.exists() {
            target = self.dir.join(format!("{base}_{counter}.xml"));
            counter += 1;
        }

        let latest = self
            .list()?
            .first()
            .map(|info| SystemTime::from(info.modified));
        fs::copy(db_path, &target).map_err(|e| CatalogError::io(&target, e))?;

        let now = SystemTime::now();
        let stamp = match latest {
            Some(previous) if previous >= now => previous + Duration::from_millis(1),
            _ => now,
        };
        fs::File::options()
            .write(true)
            .open(&target)
            .and_then(|file| file.set_modified(stamp))
            .map_err(|e| CatalogError::io(&target, e))?;

        tracing::info!(source = %db_path.display(), backup = %target.display(), "backup created");
        Ok(target)
    }

    /// Backups in the directory, newest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CatalogError::from_io(&self.dir, e))?;
        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !name.ends_with(".xml") {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let Ok(mtime) = meta.modified() else {
                continue;
            };
            backups.push(BackupInfo {
                label: label_from_name(&name),
                size: meta.len(),
                modified: DateTime::<Local>::from(mtime),
                path,
            });
        }
        backups.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    pub fn latest(&self) -> Result<Option<BackupInfo>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Copy `backup` over `target`, first backing up whatever `target` holds.
    pub fn restore(&self, backup: &Path, target: &Path) -> Result<()> {
        let contents = fs::read(backup).map_err(|e| CatalogError::from_io(backup, e))?;
        if target.exists() {
            self.create(target, PRE_RESTORE_LABEL)?;
        }
        write_atomic(target, &contents)?;
        tracing::info!(backup = %backup.display(), target = %target.display(), "backup restored");
        Ok(())
    }

    /// Delete all but the newest `keep` backups. Returns how many went.
    pub fn cleanup(&self, keep: usize) -> Result<usize> {
        let mut removed = 0;
        for info in self.list()?.into_iter().skip(keep) {
            fs::remove_file(&info.path).map_err(|e| CatalogError::io(&info.path, e))?;
            removed += 1;
        }
        if removed > 0 {
            tracing::info!(removed, keep, "old backups removed");
        }
        Ok(removed)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|info| info.size).sum())
    }

    /// Back up `db_path`, then run `op`. If the backup fails, `op` never runs.
    pub fn guard<T>(&self, db_path: &Path, label: &str, op: impl FnOnce(&Path) -> Result<T>) -> Result<T> {
        let backup = self.create(db_path, label).inspect_err(|e| {
            tracing::error!(path = %db_path.display(), error = %e, "backup failed, operation aborted");
        })?;
        op(&backup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups")).unwrap();
        let db = dir.path().join("database.xml");
        fs::write(&db, "<VirtualDJ_Database Version=\"8\" />\n").unwrap();
        (dir, manager, db)
    }

    #[test]
    fn test_create_names_and_orders_backups() {
        let (_dir, manager, db) = setup();
        let first = manager.create(&db, "manual").unwrap();
        let second = manager.create(&db, "manual").unwrap();
        let third = manager.create(&db, "pre-merge").unwrap();
        assert_ne!(first, second);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("database_manual_"), "{name}");
        assert!(name.ends_with(".xml"));

        let t1 = modified(&first).unwrap();
        let t2 = modified(&second).unwrap();
        let t3 = modified(&third).unwrap();
        assert!(t1 < t2 && t2 < t3);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].path, third);
        assert_eq!(listed[0].label.as_deref(), Some("pre-merge"));
        assert_eq!(listed[2].label.as_deref(), Some("manual"));
        assert_eq!(manager.latest().unwrap().map(|b| b.path), Some(third));
    }

    #[test]
    fn test_rejects_bad_label_and_missing_source() {
        let (dir, manager, db) = setup();
        assert!(matches!(
            manager.create(&db, "with space"),
            Err(CatalogError::ValidationFailed(_))
        ));
        assert!(matches!(
            manager.create(&dir.path().join("nope.xml"), "manual"),
            Err(CatalogError::NotFound(_))
        ));
    }

    #[test]
    fn test_restore_keeps_safety_copy() {
        let (_dir, manager, db) = setup();
        let backup = manager.create(&db, "manual").unwrap();
        fs::write(&db, "changed").unwrap();
        manager.restore(&backup, &db).unwrap();
        assert_eq!(fs::read_to_string(&db).unwrap(), "<VirtualDJ_Database Version=\"8\" />\n");

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].label.as_deref(), Some(PRE_RESTORE_LABEL));
        assert_eq!(fs::read_to_string(&listed[0].path).unwrap(), "changed");
    }

    #[test]
    fn test_cleanup_keeps_newest() {
        let (_dir, manager, db) = setup();
        let made: Vec<PathBuf> = (0..4).map(|_| manager.create(&db, "auto").unwrap()).collect();
        assert_eq!(manager.cleanup(2).unwrap(), 2);
        let left: Vec<PathBuf> = manager.list().unwrap().into_iter().map(|b| b.path).collect();
        assert_eq!(left, vec![made[3].clone(), made[2].clone()]);
        assert_eq!(manager.cleanup(5).unwrap(), 0);
    }

    #[test]
    fn test_guard_skips_op_when_backup_fails() {
        let (dir, manager, db) = setup();
        let mut ran = false;
        let result = manager.guard(&dir.path().join("missing.xml"), "pre-op", |_| {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);

        let backup = manager.guard(&db, "pre-op", |backup| Ok(backup.to_path_buf())).unwrap();
        assert!(backup.exists());
    }

    #[test]
    fn label_parsing() {
        assert_eq!(
            label_from_name("my_db_manual_20260101_120000_123.xml").as_deref(),
            Some("manual")
        );
        assert_eq!(
            label_from_name("database_auto_20260101_120000_123_2.xml").as_deref(),
            Some("auto")
        );
        assert_eq!(label_from_name("notes.xml"), None);
    }
}
