//! Indexed, lossless VirtualDJ catalog store with a resumable batch task
//! engine and a persistent per-file result cache.

mod atomic;
pub mod backup;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod document;
pub mod duplicates;
pub mod engine;
pub mod error;
pub mod external;
pub mod loudness;
pub mod remap;
pub mod retry;

pub use cache::{Fingerprint, ResultCache};
pub use checkpoint::{CheckpointStore, TaskState, TaskStatus, TaskType};
pub use document::{DocumentStore, FieldUpdate, Record, RecordField};
pub use engine::{RecordOutcome, RecordTask, TaskControl, TaskEngine};
pub use error::{CatalogError, Result};
