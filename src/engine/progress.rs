use serde::Serialize;
use serde_json::Value;

use crate::checkpoint::{TaskStatus, TaskType};

/// Events streamed to an optional listener while a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    StatusChanged {
        task_id: String,
        status: TaskStatus,
    },
    RecordCompleted {
        key: String,
        cached: bool,
        result: Value,
    },
    RecordFailed {
        key: String,
        reason: String,
    },
    BatchCompleted {
        batch: usize,
        remaining: usize,
    },
    Progress {
        processed: usize,
        total: usize,
        percent: f64,
    },
}

/// Counters for the records handled by this run (not earlier runs of a resumed task).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub computed: usize,
    pub cached: usize,
    pub failed: usize,
}

/// Summary of one `start`/`resume` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub total_items: usize,
    pub completed: usize,
    pub failed: usize,
    pub remaining: usize,
    pub this_run: BatchProgress,
}
