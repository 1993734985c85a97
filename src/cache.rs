use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::UNIX_EPOCH;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;

use crate::error::{CatalogError, Result};

pub fn default_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vdj-catalog")
        .join("results.sqlite3")
}

/// Content fingerprint of a file: modification time in nanoseconds and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Fingerprint {
    pub mtime_ns: i64,
    pub size: i64,
}

impl Fingerprint {
    /// `None` when the file is gone or unreadable.
    pub fn of_path(path: impl AsRef<Path>) -> Option<Self> {
        let meta = std::fs::metadata(path).ok()?;
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Some(Self {
            mtime_ns,
            size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub by_namespace: BTreeMap<String, usize>,
    pub db_size_bytes: u64,
}

/// Namespaced memo of per-file computation results.
///
/// Entries are keyed by (record key, namespace). The record key is the
/// file path, and every read re-checks the live file's fingerprint, so a
/// changed or deleted file never yields a stale payload.
pub struct ResultCache {
    conn: Connection,
    path: PathBuf,
    queries: Cell<u64>,
}

impl ResultCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        rusqlite::vtab::array::load_module(&conn)?;
        migrate(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            queries: Cell::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of read queries issued so far.
    pub fn query_count(&self) -> u64 {
        self.queries.get()
    }

    fn count_query(&self) {
        self.queries.set(self.queries.get() + 1);
    }

    /// Cached value for `key`, if present and the file is unchanged.
    pub fn get(&self, key: &str, namespace: &str) -> Result<Option<Value>> {
        self.count_query();
        let row = self
            .conn
            .query_row(
                "SELECT fingerprint_mtime, fingerprint_size, payload
                 FROM results
                 WHERE key = ?1 AND namespace = ?2",
                params![key, namespace],
                |row| {
                    Ok((
                        Fingerprint {
                            mtime_ns: row.get(0)?,
                            size: row.get(1)?,
                        },
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.and_then(|(stored, payload)| fresh_payload(key, stored, &payload)))
    }

    /// Fresh cached values for many keys, fetched with a single query.
    pub fn get_batch(&self, keys: &[&str], namespace: &str) -> Result<HashMap<String, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let members: Rc<Vec<SqlValue>> = Rc::new(
            keys.iter()
                .map(|k| SqlValue::Text((*k).to_string()))
                .collect(),
        );
        self.count_query();
        let mut stmt = self.conn.prepare_cached(
            "SELECT key, fingerprint_mtime, fingerprint_size, payload
             FROM results
             WHERE namespace = ?1 AND key IN rarray(?2)",
        )?;
        let rows = stmt.query_map(params![namespace, members], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Fingerprint {
                    mtime_ns: row.get(1)?,
                    size: row.get(2)?,
                },
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut found = HashMap::new();
        for row in rows {
            let (key, stored, payload) = row?;
            if let Some(value) = fresh_payload(&key, stored, &payload) {
                found.insert(key, value);
            }
        }
        Ok(found)
    }

    /// Insert or replace the value for (key, namespace).
    pub fn put(&self, key: &str, namespace: &str, fingerprint: Fingerprint, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO results (key, namespace, fingerprint_mtime, fingerprint_size, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'))
             ON CONFLICT(key, namespace)
             DO UPDATE SET fingerprint_mtime = ?3, fingerprint_size = ?4, payload = ?5, updated_at = datetime('now')",
            params![key, namespace, fingerprint.mtime_ns, fingerprint.size, payload],
        )?;
        Ok(())
    }

    /// `put` with the live fingerprint of `key`. Returns false if the file is gone.
    pub fn put_for_path(&self, key: &str, namespace: &str, value: &Value) -> Result<bool> {
        match Fingerprint::of_path(key) {
            Some(fingerprint) => {
                self.put(key, namespace, fingerprint, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop every namespace's entry for one key.
    pub fn invalidate(&self, key: &str) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM results WHERE key = ?1", params![key])?)
    }

    /// Delete entries whose file is missing or has changed since it was cached.
    pub fn invalidate_stale(&self) -> Result<usize> {
        let entries: Vec<(String, String, Fingerprint)> = {
            let mut stmt = self.conn.prepare(
                "SELECT key, namespace, fingerprint_mtime, fingerprint_size FROM results",
            )?;
            stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    Fingerprint {
                        mtime_ns: row.get(2)?,
                        size: row.get(3)?,
                    },
                ))
            })?
            .collect::<std::result::Result<_, _>>()?
        };
        let tx = self.conn.unchecked_transaction()?;
        let mut removed = 0;
        {
            let mut delete = tx.prepare("DELETE FROM results WHERE key = ?1 AND namespace = ?2")?;
            let mut live: HashMap<&str, Option<Fingerprint>> = HashMap::new();
            for (key, namespace, stored) in &entries {
                let current = *live
                    .entry(key.as_str())
                    .or_insert_with(|| Fingerprint::of_path(key));
                if current != Some(*stored) {
                    removed += delete.execute(params![key, namespace])?;
                }
            }
        }
        tx.commit()?;
        if removed > 0 {
            tracing::info!(removed, "invalidated stale cache entries");
        }
        Ok(removed)
    }

    /// Remove all entries, or only those in `namespace`.
    pub fn clear(&self, namespace: Option<&str>) -> Result<usize> {
        let removed = match namespace {
            Some(ns) => self
                .conn
                .execute("DELETE FROM results WHERE namespace = ?1", params![ns])?,
            None => self.conn.execute("DELETE FROM results", [])?,
        };
        Ok(removed)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT namespace, COUNT(*) FROM results GROUP BY namespace ORDER BY namespace")?;
        let by_namespace: BTreeMap<String, usize> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(CacheStats {
            entries: by_namespace.values().sum(),
            by_namespace,
            db_size_bytes: std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS results (
            key TEXT NOT NULL,
            namespace TEXT NOT NULL,
            fingerprint_mtime INTEGER NOT NULL,
            fingerprint_size INTEGER NOT NULL,
            payload TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (key, namespace)
        );
        CREATE INDEX IF NOT EXISTS idx_results_namespace ON results(namespace);
        PRAGMA user_version = 1;",
    )
}

fn fresh_payload(key: &str, stored: Fingerprint, payload: &str) -> Option<Value> {
    if Fingerprint::of_path(key) != Some(stored) {
        return None;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, error = %e, "unreadable cache payload treated as a miss");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp_cache() -> (tempfile::TempDir, ResultCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path().join("cache").join("results.sqlite3")).unwrap();
        (dir, cache)
    }

    fn audio_file(dir: &Path, name: &str, bytes: &[u8]) -> String {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_open_creates_schema_and_wal() {
        let (_dir, cache) = open_temp_cache();
        let version: i32 = cache
            .conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
        let mode: String = cache
            .conn
            .pragma_query_value(None, "journal_mode", |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_round_trip_and_upsert() {
        let (dir, cache) = open_temp_cache();
        let key = audio_file(dir.path(), "a.mp3", b"abc");
        let fp = Fingerprint::of_path(&key).unwrap();
        cache.put(&key, "loudness:-14", fp, &json!({"lufs": -9.5})).unwrap();
        assert_eq!(cache.get(&key, "loudness:-14").unwrap(), Some(json!({"lufs": -9.5})));
        assert_eq!(cache.get(&key, "energy").unwrap(), None);

        cache.put(&key, "loudness:-14", fp, &json!({"lufs": -8.0})).unwrap();
        assert_eq!(cache.get(&key, "loudness:-14").unwrap(), Some(json!({"lufs": -8.0})));
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_changed_file_is_a_miss() {
        let (dir, cache) = open_temp_cache();
        let key = audio_file(dir.path(), "a.mp3", b"abc");
        assert!(cache.put_for_path(&key, "energy", &json!(7)).unwrap());

        let later = filetime::FileTime::from_unix_time(2_000_000_000, 0);
        filetime::set_file_mtime(&key, later).unwrap();
        assert_eq!(cache.get(&key, "energy").unwrap(), None);
        assert!(cache.get_batch(&[key.as_str()], "energy").unwrap().is_empty());
    }

    #[test]
    fn test_resized_file_is_a_miss() {
        let (dir, cache) = open_temp_cache();
        let key = audio_file(dir.path(), "a.mp3", b"abc");
        let original = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&key).unwrap());
        cache.put_for_path(&key, "energy", &json!(7)).unwrap();
        std::fs::write(&key, b"abcdef").unwrap();
        filetime::set_file_mtime(&key, original).unwrap();
        assert_eq!(cache.get(&key, "energy").unwrap(), None);
    }

    #[test]
    fn test_get_batch_uses_one_query() {
        let (dir, cache) = open_temp_cache();
        let keys: Vec<String> = (0..2500)
            .map(|i| audio_file(dir.path(), &format!("{i}.mp3"), format!("{i}").as_bytes()))
            .collect();
        for key in keys.iter().step_by(2) {
            cache.put_for_path(key, "mood:v1", &json!({"mood": "happy"})).unwrap();
        }
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let before = cache.query_count();
        let found = cache.get_batch(&refs, "mood:v1").unwrap();
        assert_eq!(cache.query_count() - before, 1);
        assert_eq!(found.len(), 1250);
        assert!(found.contains_key(&keys[0]));
        assert!(!found.contains_key(&keys[1]));
    }

    #[test]
    fn test_put_for_missing_file_is_skipped() {
        let (dir, cache) = open_temp_cache();
        let missing = dir.path().join("gone.mp3");
        assert!(!cache.put_for_path(&missing.to_string_lossy(), "energy", &json!(1)).unwrap());
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_invalidate_stale_sweeps_missing_and_changed() {
        let (dir, cache) = open_temp_cache();
        let kept = audio_file(dir.path(), "kept.mp3", b"1");
        let deleted = audio_file(dir.path(), "deleted.mp3", b"2");
        let changed = audio_file(dir.path(), "changed.mp3", b"3");
        for key in [&kept, &deleted, &changed] {
            cache.put_for_path(key, "energy", &json!(5)).unwrap();
            cache.put_for_path(key, "mood:v1", &json!("calm")).unwrap();
        }
        std::fs::remove_file(&deleted).unwrap();
        filetime::set_file_mtime(&changed, filetime::FileTime::from_unix_time(1, 0)).unwrap();

        assert_eq!(cache.invalidate_stale().unwrap(), 4);
        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.by_namespace.get("energy"), Some(&1));
        assert_eq!(cache.get(&kept, "energy").unwrap(), Some(json!(5)));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let (dir, cache) = open_temp_cache();
        let a = audio_file(dir.path(), "a.mp3", b"a");
        let b = audio_file(dir.path(), "b.mp3", b"b");
        for key in [&a, &b] {
            cache.put_for_path(key, "energy", &json!(3)).unwrap();
            cache.put_for_path(key, "loudness:-14", &json!({})).unwrap();
        }
        assert_eq!(cache.invalidate(&a).unwrap(), 2);
        assert_eq!(cache.clear(Some("energy")).unwrap(), 1);
        assert_eq!(cache.stats().unwrap().entries, 1);
        assert_eq!(cache.clear(None).unwrap(), 1);
        assert_eq!(cache.stats().unwrap().entries, 0);
    }
}
