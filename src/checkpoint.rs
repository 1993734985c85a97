//! Resumable task snapshots, one pretty-printed JSON file per task.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};

use chrono::{DateTime, Duration, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atomic::write_atomic;
use crate::error::{CatalogError, Result};

/// Snapshot format written by this build.
pub const FORMAT_VERSION: u32 = 1;

pub fn default_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vdj-catalog")
        .join("checkpoints")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Normalize,
    Measure,
    AnalyzeEnergy,
    AnalyzeMood,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Measure => "measure",
            Self::AnalyzeEnergy => "analyze_energy",
            Self::AnalyzeMood => "analyze_mood",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

fn format_version_default() -> u32 {
    FORMAT_VERSION
}

/// Persisted progress of one batch task.
///
/// `pending_paths` is always the ordered remainder still to process;
/// completed and failed keys never reappear in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default = "format_version_default")]
    pub format_version: u32,
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub total_items: usize,
    pub completed_paths: Vec<String>,
    pub pending_paths: Vec<String>,
    pub failed_paths: BTreeMap<String, String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub results: Vec<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskState {
    /// New pending task. Duplicate keys are dropped, first occurrence kept.
    pub fn new(task_type: TaskType, keys: impl IntoIterator<Item = String>, config: BTreeMap<String, Value>) -> Self {
        let mut seen = HashSet::new();
        let pending: Vec<String> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        let now = Utc::now();
        Self {
            format_version: FORMAT_VERSION,
            task_id: new_task_id(task_type),
            task_type,
            status: TaskStatus::Pending,
            total_items: pending.len(),
            completed_paths: Vec::new(),
            pending_paths: pending,
            failed_paths: BTreeMap::new(),
            config,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn processed_count(&self) -> usize {
        self.completed_paths.len() + self.failed_paths.len()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.processed_count() as f64 / self.total_items as f64 * 100.0
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self.status, TaskStatus::Paused | TaskStatus::Running) && !self.pending_paths.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn config_f64(&self, name: &str) -> Option<f64> {
        self.config.get(name).and_then(Value::as_f64)
    }
}

/// `<type>_<YYYYmmdd_HHMMSS>_<8 hex>`.
fn new_task_id(task_type: TaskType) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        task_type,
        Local::now().format("%Y%m%d_%H%M%S"),
        &suffix[..8]
    )
}

/// Exclusive write access to one task's checkpoint. Released on drop.
#[derive(Debug)]
pub struct TaskLease {
    task_id: String,
    lock_path: PathBuf,
}

impl TaskLease {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
    }
}

/// A lock file without a readable PID this young may still be mid-write.
const UNREADABLE_LOCK_GRACE: StdDuration = StdDuration::from_secs(10);

/// Task ids name files in the checkpoint directory.
fn validate_task_id(task_id: &str) -> Result<()> {
    if task_id.is_empty() || task_id.contains(['/', '\\']) || task_id.contains("..") {
        return Err(CatalogError::ValidationFailed(format!("invalid task id '{task_id}'")));
    }
    Ok(())
}

/// Whether a lease holder is still running. Only decidable with procfs.
fn holder_alive(pid: u32) -> bool {
    let proc_root = Path::new("/proc");
    if !proc_root.is_dir() {
        return true;
    }
    pid == std::process::id() || proc_root.join(pid.to_string()).exists()
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.lock"))
    }

    /// Create and persist a new pending task.
    pub fn create_task(
        &self,
        task_type: TaskType,
        keys: impl IntoIterator<Item = String>,
        config: BTreeMap<String, Value>,
    ) -> Result<TaskState> {
        let mut state = TaskState::new(task_type, keys, config);
        self.save(&mut state, false)?;
        tracing::info!(task_id = %state.task_id, items = state.total_items, "created task");
        Ok(state)
    }

    /// Atomically persist `state`, bumping `updated_at` when `touch` is set.
    pub fn save(&self, state: &mut TaskState, touch: bool) -> Result<()> {
        if touch {
            state.updated_at = Utc::now();
        }
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_path(&state.task_id), json.as_bytes())
    }

    pub fn load(&self, task_id: &str) -> Result<TaskState> {
        validate_task_id(task_id)?;
        let path = self.state_path(task_id);
        let text = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => CatalogError::NotFound(format!("task {task_id}")),
            _ => CatalogError::io(&path, e),
        })?;
        let state: TaskState = serde_json::from_str(&text)
            .map_err(|e| CatalogError::corrupt(format!("checkpoint {task_id}"), e.to_string()))?;
        if state.format_version > FORMAT_VERSION {
            return Err(CatalogError::corrupt(
                format!("checkpoint {task_id}"),
                format!("format version {} is newer than {FORMAT_VERSION}", state.format_version),
            ));
        }
        Ok(state)
    }

    /// Returns false if there was nothing to delete.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        validate_task_id(task_id)?;
        let path = self.state_path(task_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CatalogError::io(&path, e)),
        }
    }

    /// Every readable checkpoint, most recently updated first.
    pub fn list(&self) -> Result<Vec<TaskState>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| CatalogError::io(&self.dir, e))?;
        let mut states = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CatalogError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(task_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(task_id) {
                Ok(state) => states.push(state),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable checkpoint"),
            }
        }
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    pub fn list_incomplete(&self) -> Result<Vec<TaskState>> {
        Ok(self.list()?.into_iter().filter(|s| !s.is_complete()).collect())
    }

    pub fn list_resumable(&self) -> Result<Vec<TaskState>> {
        Ok(self.list()?.into_iter().filter(TaskState::is_resumable).collect())
    }

    /// Delete finished checkpoints last updated more than `max_age_days` ago.
    pub fn cleanup_completed(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let mut removed = 0;
        for state in self.list()? {
            if state.is_complete() && state.updated_at < cutoff && self.delete(&state.task_id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, max_age_days, "cleaned up finished checkpoints");
        }
        Ok(removed)
    }

    /// Take the single-writer lease on a task.
    ///
    /// The lock file appears with the holder's PID already in it. A lock left
    /// behind by a process that no longer exists is taken over.
    pub fn acquire(&self, task_id: &str) -> Result<TaskLease> {
        validate_task_id(task_id)?;
        let lock_path = self.lock_path(task_id);
        let pid = std::process::id();
        let staged = self.dir.join(format!("{task_id}.lock.{pid}.tmp"));
        fs::write(&staged, pid.to_string()).map_err(|e| CatalogError::io(&staged, e))?;
        let outcome = self.link_lease(task_id, &staged, &lock_path);
        let _ = fs::remove_file(&staged);
        outcome
    }

    fn link_lease(&self, task_id: &str, staged: &Path, lock_path: &Path) -> Result<TaskLease> {
        for _ in 0..2 {
            match fs::hard_link(staged, lock_path) {
                Ok(()) => {
                    return Ok(TaskLease {
                        task_id: task_id.to_string(),
                        lock_path: lock_path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(lock_path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    let held = match holder {
                        Some(pid) => holder_alive(pid),
                        None => lock_is_fresh(lock_path),
                    };
                    if held {
                        let by = holder.map_or_else(|| "another process".to_string(), |pid| format!("process {pid}"));
                        return Err(CatalogError::ValidationFailed(format!(
                            "task {task_id} is held by {by} ({})",
                            lock_path.display()
                        )));
                    }
                    tracing::warn!(task_id, "taking over stale task lease");
                    let _ = fs::remove_file(lock_path);
                }
                Err(e) => return Err(CatalogError::io(lock_path, e)),
            }
        }
        Err(CatalogError::ValidationFailed(format!(
            "could not acquire lease for task {task_id}"
        )))
    }
}

fn lock_is_fresh(lock_path: &Path) -> bool {
    fs::metadata(lock_path)
        .and_then(|meta| meta.modified())
        .map(|mtime| {
            SystemTime::now()
                .duration_since(mtime)
                .map_or(true, |age| age < UNREADABLE_LOCK_GRACE)
        })
        .unwrap_or(false)
}
