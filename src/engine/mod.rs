//! Resumable batch execution over catalog records.
//!
//! A task's keys are processed in fixed-size batches. Inside a batch,
//! workers compute in parallel (bounded by a semaphore) and hand results
//! back over a bounded channel; only the coordinator touches the
//! checkpoint, the cache, and the mutation sink. The sink is flushed
//! before each checkpoint so a key is never recorded as done while its
//! mutation exists only in memory.
//!
//! Pause is honored between batches. Cancel is also checked before each
//! record; keys skipped that way stay pending.

mod control;
mod progress;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

pub use control::{ControlSignal, TaskControl};
pub use progress::{BatchProgress, TaskEvent, TaskReport};

use crate::cache::ResultCache;
use crate::checkpoint::{CheckpointStore, TaskState, TaskStatus, TaskType};
use crate::document::{DocumentStore, FieldUpdate};
use crate::error::{CatalogError, Result};

pub const DEFAULT_BATCH_SIZE: usize = 50;

/// CPU count minus one, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// What a computation produced for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    /// Stored in the cache and in the checkpoint's results.
    pub result: Value,
    /// Applied to the catalog by the coordinator.
    pub mutation: Option<FieldUpdate>,
}

impl RecordOutcome {
    pub fn result(result: Value) -> Self {
        Self {
            result,
            mutation: None,
        }
    }

    pub fn with_mutation(mut self, update: FieldUpdate) -> Self {
        self.mutation = Some(update);
        self
    }
}

/// A per-record computation the engine can drive.
pub trait RecordTask: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    /// Result cache namespace, or `None` to skip caching.
    fn cache_namespace(&self) -> Option<String> {
        None
    }

    /// Settings persisted in the checkpoint.
    fn config(&self) -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    /// Compute one record. Timeouts and tool failures are the
    /// implementation's job and should come back as `Err`.
    fn compute(&self, key: String) -> impl Future<Output = Result<RecordOutcome>> + Send;

    /// Rebuild an outcome from a cached result.
    fn from_cached(&self, _key: &str, cached: Value) -> Result<RecordOutcome> {
        Ok(RecordOutcome::result(cached))
    }
}

/// Single writer for record mutations produced by a task.
pub trait MutationSink {
    fn apply(&mut self, key: &str, update: &FieldUpdate) -> Result<()>;

    /// Persist everything applied so far. Runs before the checkpoint of any
    /// batch that applied a mutation.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl MutationSink for DocumentStore {
    fn apply(&mut self, key: &str, update: &FieldUpdate) -> Result<()> {
        self.update_fields(key, update)
    }

    fn flush(&mut self) -> Result<()> {
        self.save(None).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseBehavior {
    /// Checkpoint and return a `Paused` report; resume later from disk.
    Exit,
    /// Checkpoint and wait in place for `resume` or `cancel` on the control.
    Suspend,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub workers: usize,
    pub pause_behavior: PauseBehavior,
    /// Remove the checkpoint once the task completes.
    pub delete_on_complete: bool,
    /// Append each result to the checkpoint's `results`.
    pub keep_results: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: default_workers(),
            pause_behavior: PauseBehavior::Exit,
            delete_on_complete: false,
            keep_results: true,
        }
    }
}

enum Gate {
    Proceed,
    Stop(TaskStatus),
}

#[derive(Default)]
struct BatchSettled {
    /// Keys left untouched because the task was cancelled.
    skipped: HashSet<String>,
    mutated: bool,
}

pub struct TaskEngine<'a, T: RecordTask> {
    task: Arc<T>,
    checkpoints: &'a CheckpointStore,
    cache: Option<&'a ResultCache>,
    config: EngineConfig,
    control: TaskControl,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl<'a, T: RecordTask> TaskEngine<'a, T> {
    pub fn new(task: T, checkpoints: &'a CheckpointStore) -> Self {
        Self {
            task: Arc::new(task),
            checkpoints,
            cache: None,
            config: EngineConfig::default(),
            control: TaskControl::new(),
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a ResultCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_control(mut self, control: TaskControl) -> Self {
        self.control = control;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn control(&self) -> TaskControl {
        self.control.clone()
    }

    /// Stop at the next batch boundary.
    pub fn pause(&self) {
        self.control.pause();
    }

    /// Stop before the next record and delete the checkpoint.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Create a checkpointed task over `keys` and run it.
    pub async fn start(&self, keys: Vec<String>, sink: &mut impl MutationSink) -> Result<TaskReport> {
        let state = self
            .checkpoints
            .create_task(self.task.task_type(), keys, self.task.config())?;
        self.run(state, sink).await
    }

    /// Continue a persisted task from its pending keys.
    pub async fn resume(&self, task_id: &str, sink: &mut impl MutationSink) -> Result<TaskReport> {
        let state = self.checkpoints.load(task_id)?;
        if state.task_type != self.task.task_type() {
            return Err(CatalogError::ValidationFailed(format!(
                "task {task_id} is a {} task, not {}",
                state.task_type,
                self.task.task_type()
            )));
        }
        if state.is_complete() {
            return Err(CatalogError::ValidationFailed(format!(
                "task {task_id} already finished ({})",
                state.status
            )));
        }
        self.run(state, sink).await
    }

    async fn run(&self, mut state: TaskState, sink: &mut impl MutationSink) -> Result<TaskReport> {
        let _lease = self.checkpoints.acquire(&state.task_id)?;
        // Starting or resuming is an explicit request to run.
        self.control.resume();
        let mut progress = BatchProgress::default();

        match self.drive(&mut state, sink, &mut progress).await {
            Ok(()) => Ok(self.report(&state, progress)),
            Err(err) => {
                tracing::warn!(task_id = %state.task_id, error = %err, "task failed");
                state.status = TaskStatus::Failed;
                if let Err(save_err) = self.checkpoints.save(&mut state, true) {
                    tracing::warn!(task_id = %state.task_id, error = %save_err, "could not record task failure");
                }
                self.emit(TaskEvent::StatusChanged {
                    task_id: state.task_id.clone(),
                    status: TaskStatus::Failed,
                });
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut TaskState,
        sink: &mut impl MutationSink,
        progress: &mut BatchProgress,
    ) -> Result<()> {
        self.set_status(state, TaskStatus::Running)?;
        let namespace = self.task.cache_namespace();
        let batch_size = self.config.batch_size.max(1);
        let mut batch_no = 0usize;

        loop {
            if let Gate::Stop(status) = self.gate(state).await? {
                tracing::info!(task_id = %state.task_id, %status, remaining = state.pending_paths.len(), "task stopped");
                return Ok(());
            }
            if state.pending_paths.is_empty() {
                break;
            }

            let batch: Vec<String> = state.pending_paths.iter().take(batch_size).cloned().collect();
            let settled = self
                .run_batch(state, &batch, namespace.as_deref(), sink, progress)
                .await;
            let rest = state.pending_paths.split_off(batch.len());
            state.pending_paths = batch
                .into_iter()
                .filter(|key| settled.skipped.contains(key))
                .chain(rest)
                .collect();
            if settled.mutated {
                sink.flush()?;
            }
            batch_no += 1;
            self.checkpoints.save(state, true)?;
            tracing::debug!(
                task_id = %state.task_id,
                batch = batch_no,
                remaining = state.pending_paths.len(),
                "checkpoint written"
            );
            self.emit(TaskEvent::BatchCompleted {
                batch: batch_no,
                remaining: state.pending_paths.len(),
            });
        }

        self.set_status(state, TaskStatus::Completed)?;
        tracing::info!(
            task_id = %state.task_id,
            completed = state.completed_paths.len(),
            failed = state.failed_paths.len(),
            "task completed"
        );
        if self.config.delete_on_complete {
            self.checkpoints.delete(&state.task_id)?;
        }
        Ok(())
    }

    /// Batch-boundary control check.
    async fn gate(&self, state: &mut TaskState) -> Result<Gate> {
        let mut signal = self.control.signal();
        if signal == ControlSignal::Pause {
            self.set_status(state, TaskStatus::Paused)?;
            match self.config.pause_behavior {
                PauseBehavior::Exit => return Ok(Gate::Stop(TaskStatus::Paused)),
                PauseBehavior::Suspend => {
                    signal = self.control.wait_while_paused().await;
                    if signal == ControlSignal::Run {
                        self.set_status(state, TaskStatus::Running)?;
                    }
                }
            }
        }
        if signal == ControlSignal::Cancel {
            state.status = TaskStatus::Cancelled;
            self.checkpoints.delete(&state.task_id)?;
            self.emit(TaskEvent::StatusChanged {
                task_id: state.task_id.clone(),
                status: TaskStatus::Cancelled,
            });
            return Ok(Gate::Stop(TaskStatus::Cancelled));
        }
        Ok(Gate::Proceed)
    }

    async fn run_batch(
        &self,
        state: &mut TaskState,
        batch: &[String],
        namespace: Option<&str>,
        sink: &mut impl MutationSink,
        progress: &mut BatchProgress,
    ) -> BatchSettled {
        let mut done = BatchSettled::default();
        let mut to_compute: Vec<String> = Vec::with_capacity(batch.len());
        match (self.cache, namespace) {
            (Some(cache), Some(ns)) => {
                let keys: Vec<&str> = batch.iter().map(String::as_str).collect();
                let hits = cache.get_batch(&keys, ns).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "cache lookup failed; computing batch");
                    HashMap::new()
                });
                for key in batch {
                    if self.control.is_cancelled() {
                        done.skipped.insert(key.clone());
                        continue;
                    }
                    let cached = hits
                        .get(key)
                        .and_then(|value| self.task.from_cached(key, value.clone()).ok());
                    match cached {
                        Some(outcome) => {
                            done.mutated |= self.settle(state, key, Ok(outcome), true, namespace, sink, progress);
                        }
                        None => to_compute.push(key.clone()),
                    }
                }
            }
            _ => to_compute.extend(batch.iter().cloned()),
        }
        if to_compute.is_empty() {
            return done;
        }

        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        // `None` marks a key skipped after cancel.
        let (tx, mut rx) = mpsc::channel::<(String, Option<Result<RecordOutcome>>)>(workers * 2);
        let mut join = JoinSet::new();
        for key in &to_compute {
            let key = key.clone();
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let task = Arc::clone(&self.task);
            let control = self.control.clone();
            join.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) if control.is_cancelled() => None,
                    Ok(_permit) => Some(task.compute(key.clone()).await),
                    Err(_) => Some(Err(CatalogError::RecordComputeFailure("worker pool closed".into()))),
                };
                let _ = tx.send((key, outcome)).await;
            });
        }
        drop(tx);

        let mut settled = HashSet::with_capacity(to_compute.len());
        while let Some((key, outcome)) = rx.recv().await {
            match outcome {
                Some(outcome) => done.mutated |= self.settle(state, &key, outcome, false, namespace, sink, progress),
                None => {
                    done.skipped.insert(key.clone());
                }
            }
            settled.insert(key);
        }
        while let Some(joined) = join.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "worker ended abnormally");
            }
        }
        for key in to_compute.iter().filter(|k| !settled.contains(*k)) {
            let lost = Err(CatalogError::RecordComputeFailure("worker aborted before reporting".into()));
            self.settle(state, key, lost, false, namespace, sink, progress);
        }
        if !done.skipped.is_empty() {
            tracing::info!(task_id = %state.task_id, skipped = done.skipped.len(), "cancelled mid-batch");
        }
        done
    }

    /// Record one key's outcome. Returns whether a mutation was applied.
    #[allow(clippy::too_many_arguments)]
    fn settle(
        &self,
        state: &mut TaskState,
        key: &str,
        outcome: Result<RecordOutcome>,
        cached: bool,
        namespace: Option<&str>,
        sink: &mut impl MutationSink,
        progress: &mut BatchProgress,
    ) -> bool {
        let mut mutated = false;
        let applied = outcome.and_then(|outcome| {
            if let Some(update) = &outcome.mutation {
                sink.apply(key, update)?;
                mutated = true;
            }
            Ok(outcome)
        });
        match applied {
            Ok(outcome) => {
                if !cached
                    && let (Some(cache), Some(ns)) = (self.cache, namespace)
                {
                    match cache.put_for_path(key, ns, &outcome.result) {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(key, "file missing; result not cached"),
                        Err(e) => tracing::warn!(key, error = %e, "cache write failed"),
                    }
                }
                state.completed_paths.push(key.to_string());
                if self.config.keep_results {
                    state.results.push(json!({ "path": key, "result": outcome.result.clone() }));
                }
                if cached {
                    progress.cached += 1;
                } else {
                    progress.computed += 1;
                }
                self.emit(TaskEvent::RecordCompleted {
                    key: key.to_string(),
                    cached,
                    result: outcome.result,
                });
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::debug!(key, %reason, "record failed");
                state.failed_paths.insert(key.to_string(), reason.clone());
                progress.failed += 1;
                self.emit(TaskEvent::RecordFailed {
                    key: key.to_string(),
                    reason,
                });
            }
        }
        self.emit(TaskEvent::Progress {
            processed: state.processed_count(),
            total: state.total_items,
            percent: state.progress_percent(),
        });
        mutated
    }

    fn set_status(&self, state: &mut TaskState, status: TaskStatus) -> Result<()> {
        state.status = status;
        self.checkpoints.save(state, true)?;
        self.emit(TaskEvent::StatusChanged {
            task_id: state.task_id.clone(),
            status,
        });
        Ok(())
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn report(&self, state: &TaskState, progress: BatchProgress) -> TaskReport {
        TaskReport {
            task_id: state.task_id.clone(),
            task_type: state.task_type,
            status: state.status,
            total_items: state.total_items,
            completed: state.completed_paths.len(),
            failed: state.failed_paths.len(),
            remaining: state.pending_paths.len(),
            this_run: progress,
        }
    }
}
