//! Backoff for online lookups.
//!
//! Only `NetworkTransient` is retried. Once the attempts run out the error is
//! downgraded to a per-record `RecordComputeFailure` so a task keeps going.

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::{Value, json};
use tokio::time::Duration;

use crate::checkpoint::TaskType;
use crate::engine::{RecordOutcome, RecordTask};
use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (zero-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Result of asking an online service to label a record. Not finding a
/// label is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification<T> {
    Classified(T),
    Unclassified,
}

impl<T> Classification<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Classified(value) => Some(value),
            Self::Unclassified => None,
        }
    }

    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Classified(_))
    }
}

impl<T> From<Option<T>> for Classification<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Unclassified, Self::Classified)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are spent.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(CatalogError::NetworkTransient(reason)) => {
                attempt += 1;
                if attempt >= attempts {
                    tracing::warn!(%what, attempts, %reason, "giving up after transient failures");
                    return Err(CatalogError::RecordComputeFailure(format!(
                        "{what}: {reason} (after {attempts} attempts)"
                    )));
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(%what, attempt, ?delay, %reason, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// An online service that labels one record at a time.
pub trait MetadataLookup: Send + Sync + 'static {
    /// Transient outages should come back as `NetworkTransient`.
    fn lookup(&self, key: &str) -> impl Future<Output = Result<Classification<Value>>> + Send;
}

/// Engine task around a `MetadataLookup`. Each record gets the policy's
/// attempts; "no label" is stored as a completed `null` classification.
pub struct LookupTask<L> {
    lookup: L,
    task_type: TaskType,
    namespace: String,
    policy: RetryPolicy,
}

impl<L: MetadataLookup> LookupTask<L> {
    pub fn new(lookup: L, task_type: TaskType, namespace: impl Into<String>) -> Self {
        Self {
            lookup,
            task_type,
            namespace: namespace.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<L: MetadataLookup> RecordTask for LookupTask<L> {
    fn task_type(&self) -> TaskType {
        self.task_type
    }

    fn cache_namespace(&self) -> Option<String> {
        Some(self.namespace.clone())
    }

    fn config(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("namespace".to_string(), json!(self.namespace)),
            ("max_attempts".to_string(), json!(self.policy.max_attempts)),
        ])
    }

    async fn compute(&self, key: String) -> Result<RecordOutcome> {
        let label = retry_transient(&self.policy, &key, || self.lookup.lookup(&key)).await?;
        Ok(RecordOutcome::result(json!({ "classification": label.into_option() })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, TaskStatus};
    use crate::document::FieldUpdate;
    use crate::engine::{EngineConfig, MutationSink, TaskEngine};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn transient_then_success() {
        let calls = AtomicU32::new(0);
        let value = retry_transient(&fast(), "lookup", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CatalogError::NetworkTransient("503".into()))
            } else {
                Ok(Classification::Classified("happy"))
            }
        })
        .await
        .unwrap();
        assert_eq!(value, Classification::Classified("happy"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_become_record_failure() {
        let calls = AtomicU32::new(0);
        let err = retry_transient::<(), _, _>(&fast(), "lookup", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::NetworkTransient("timeout".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CatalogError::RecordComputeFailure(ref msg) if msg.contains("timeout")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_transient::<(), _, _>(&fast(), "lookup", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CatalogError::ValidationFailed("bad".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CatalogError::ValidationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unclassified_is_a_success() {
        let outcome: Classification<String> = retry_transient(&fast(), "lookup", || async { Ok(Classification::from(None::<String>)) })
            .await
            .unwrap();
        assert!(!outcome.is_classified());
        assert_eq!(outcome.into_option(), None);
    }

    /// Fails every key's first attempt; `/flaky/down` never recovers.
    #[derive(Default)]
    struct FlakyService {
        attempts: Mutex<BTreeMap<String, u32>>,
    }

    impl MetadataLookup for FlakyService {
        async fn lookup(&self, key: &str) -> Result<Classification<Value>> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(key.to_string()).or_default();
                *n += 1;
                *n
            };
            if attempt == 1 || key.ends_with("down") {
                return Err(CatalogError::NetworkTransient(format!("503 for {key}")));
            }
            Ok(if key.ends_with("known") {
                Classification::Classified(json!("Deep House"))
            } else {
                Classification::Unclassified
            })
        }
    }

    struct NoMutations;

    impl MutationSink for NoMutations {
        fn apply(&mut self, key: &str, _update: &FieldUpdate) -> Result<()> {
            panic!("unexpected mutation for {key}");
        }
    }

    #[tokio::test]
    async fn lookup_task_retries_under_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointStore::open(dir.path()).unwrap();
        let task = LookupTask::new(FlakyService::default(), TaskType::AnalyzeMood, "genre:online").with_policy(fast());
        let engine = TaskEngine::new(task, &checkpoints).with_config(EngineConfig {
            batch_size: 10,
            workers: 2,
            ..EngineConfig::default()
        });
        let keys = vec![
            "/flaky/known".to_string(),
            "/flaky/other".to_string(),
            "/flaky/down".to_string(),
        ];
        let report = engine.start(keys, &mut NoMutations).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);

        let state = checkpoints.load(&report.task_id).unwrap();
        assert!(state.failed_paths["/flaky/down"].contains("after 3 attempts"));
        let known = state.results.iter().find(|r| r["path"] == "/flaky/known").unwrap();
        assert_eq!(known["result"]["classification"], "Deep House");
        let other = state.results.iter().find(|r| r["path"] == "/flaky/other").unwrap();
        assert!(other["result"]["classification"].is_null());
        assert_eq!(state.config["namespace"], "genre:online");
    }
}
