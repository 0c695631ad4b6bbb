//! Persistent pipeline state machine.
//!
//! Each [`PipelineRecord`] lives as one item in a [`MetadataStore`] table,
//! keyed by request id. Every write is conditional on the version that was
//! read, so concurrent invocations for the same request are totally ordered
//! and the loser sees [`StageError::ConcurrentModification`].

use crate::traits::{IndexCondition, MetadataRecord, MetadataStore, CONDITIONAL_CHECK_FAILED};
use docpipe_core::{
    Clock, DocpipeError, DocpipeResult, Fingerprint, PipelineRecord, ResilienceError, Stage,
    StageError,
};
use docpipe_resilience::{RetryExecutor, RetryOptions};
use serde_json::{Map, Value};
use std::sync::Arc;

const VERSION_ATTRIBUTE: &str = "version";

/// Reads and writes pipeline records with optimistic versioning.
///
/// Store calls go through the [`RetryExecutor`] with the options given at
/// construction. Attaching a breaker to those options is possible, but
/// every lost version race is a failure as far as a breaker is concerned.
pub struct StageTracker {
    store: Arc<dyn MetadataStore>,
    table: String,
    executor: Arc<RetryExecutor>,
    options: RetryOptions,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageTracker")
            .field("table", &self.table)
            .field("options", &self.options)
            .finish()
    }
}

fn is_conflict(err: &DocpipeError) -> bool {
    matches!(
        err,
        DocpipeError::Resilience(ResilienceError::NonRetryable { source, .. })
            if source.has_code(CONDITIONAL_CHECK_FAILED)
    )
}

fn corrupt(request_id: &str, reason: impl Into<String>) -> StageError {
    StageError::Corrupt {
        request_id: request_id.to_string(),
        reason: reason.into(),
    }
}

fn encode(record: &PipelineRecord) -> Result<Map<String, Value>, StageError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(mut attributes)) => {
            attributes.remove(VERSION_ATTRIBUTE);
            Ok(attributes)
        }
        Ok(other) => Err(corrupt(
            &record.request_id,
            format!("record encoded as non-object: {}", other),
        )),
        Err(e) => Err(corrupt(&record.request_id, e.to_string())),
    }
}

fn decode(item: MetadataRecord) -> Result<PipelineRecord, StageError> {
    let MetadataRecord {
        key,
        version,
        mut attributes,
    } = item;
    attributes.insert(VERSION_ATTRIBUTE.to_string(), Value::from(version));
    serde_json::from_value(Value::Object(attributes)).map_err(|e| corrupt(&key, e.to_string()))
}

impl StageTracker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        table: impl Into<String>,
        executor: Arc<RetryExecutor>,
        options: RetryOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            table: table.into(),
            executor,
            options,
            clock,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create a record in `Ingested`.
    pub async fn create(
        &self,
        request_id: &str,
        fingerprint: &Fingerprint,
    ) -> DocpipeResult<PipelineRecord> {
        let record = PipelineRecord::new(request_id, fingerprint.as_str(), self.clock.now());
        let stored = match self.write(request_id, encode(&record)?, 0).await {
            Err(e) if is_conflict(&e) => {
                return Err(StageError::AlreadyExists {
                    request_id: request_id.to_string(),
                }
                .into())
            }
            other => other?,
        };
        tracing::debug!(request_id, stage = %Stage::Ingested, "Pipeline record created");
        Ok(decode(stored)?)
    }

    /// The record, or `None` if it does not exist.
    pub async fn find(&self, request_id: &str) -> DocpipeResult<Option<PipelineRecord>> {
        let store = &self.store;
        let table = self.table.as_str();
        let item = self
            .executor
            .execute(&self.options, move || store.get(table, request_id))
            .await?;
        match item {
            Some(item) => Ok(Some(decode(item)?)),
            None => Ok(None),
        }
    }

    pub async fn get(&self, request_id: &str) -> DocpipeResult<PipelineRecord> {
        self.find(request_id).await?.ok_or_else(|| {
            StageError::NotFound {
                request_id: request_id.to_string(),
            }
            .into()
        })
    }

    pub async fn current_stage(&self, request_id: &str) -> DocpipeResult<Stage> {
        Ok(self.get(request_id).await?.stage)
    }

    /// Stage from which the next invocation continues.
    pub async fn resume_point(&self, request_id: &str) -> DocpipeResult<Stage> {
        Ok(self.get(request_id).await?.resume_point())
    }

    /// Move the stored record to `to`.
    pub async fn advance(
        &self,
        request_id: &str,
        to: Stage,
        error: Option<String>,
    ) -> DocpipeResult<PipelineRecord> {
        let current = self.get(request_id).await?;
        self.advance_record(&current, to, error).await
    }

    /// Move `current` to `to`, conditional on `current.version` still being
    /// the stored version.
    pub async fn advance_record(
        &self,
        current: &PipelineRecord,
        to: Stage,
        error: Option<String>,
    ) -> DocpipeResult<PipelineRecord> {
        if !current.stage.can_advance_to(to) {
            return Err(StageError::InvalidTransition {
                request_id: current.request_id.clone(),
                from: current.stage,
                to,
            }
            .into());
        }
        let next = current.transitioned(to, error, self.clock.now());
        self.replace(current, &next).await
    }

    /// Move a `Failed` record back to the stage it failed in.
    ///
    /// Records that are not `Failed` are returned unchanged.
    pub async fn reopen(&self, request_id: &str) -> DocpipeResult<PipelineRecord> {
        let current = self.get(request_id).await?;
        self.reopen_record(&current).await
    }

    pub async fn reopen_record(&self, current: &PipelineRecord) -> DocpipeResult<PipelineRecord> {
        if current.stage != Stage::Failed {
            return Ok(current.clone());
        }
        let next = current.reopened(self.clock.now());
        self.replace(current, &next).await
    }

    /// Every record currently in `stage`, ordered by request id.
    pub async fn list_by_stage(&self, stage: Stage) -> DocpipeResult<Vec<PipelineRecord>> {
        let store = &self.store;
        let table = self.table.as_str();
        let items = self
            .executor
            .execute(&self.options, move || {
                store.query(table, IndexCondition::equals("stage", stage.as_db_str()))
            })
            .await?;
        items
            .into_iter()
            .map(|item| decode(item).map_err(DocpipeError::from))
            .collect()
    }

    async fn replace(
        &self,
        current: &PipelineRecord,
        next: &PipelineRecord,
    ) -> DocpipeResult<PipelineRecord> {
        let request_id = current.request_id.as_str();
        let stored = match self.write(request_id, encode(next)?, current.version).await {
            Err(e) if is_conflict(&e) => {
                tracing::debug!(
                    request_id,
                    expected_version = current.version,
                    "Lost pipeline record version race"
                );
                return Err(StageError::ConcurrentModification {
                    request_id: request_id.to_string(),
                    expected_version: current.version,
                }
                .into());
            }
            other => other?,
        };
        let updated = decode(stored)?;
        tracing::debug!(
            request_id,
            from = %current.stage,
            to = %updated.stage,
            version = updated.version,
            "Pipeline stage transition"
        );
        Ok(updated)
    }

    async fn write(
        &self,
        request_id: &str,
        changes: Map<String, Value>,
        expected_version: u64,
    ) -> DocpipeResult<MetadataRecord> {
        let store = &self.store;
        let table = self.table.as_str();
        self.executor
            .execute(&self.options, move || {
                store.update(table, request_id, changes.clone(), Some(expected_version))
            })
            .await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryMetadataStore;
    use async_trait::async_trait;
    use docpipe_core::{
        ManualClock, PipelineStatus, ProcessingParams, ServiceError, DEFAULT_RECORDS_TABLE,
        SERVICE_METADATA_STORE,
    };
    use docpipe_resilience::{BackoffPolicy, ClassificationRules};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fingerprint() -> Fingerprint {
        Fingerprint::compute(b"%PDF-1.7 quarterly report", &ProcessingParams::new("model-a"))
    }

    fn tracker_over(store: Arc<dyn MetadataStore>) -> StageTracker {
        StageTracker::new(
            store,
            DEFAULT_RECORDS_TABLE,
            Arc::new(RetryExecutor::with_seed(ClassificationRules::default(), 7)),
            RetryOptions::new(SERVICE_METADATA_STORE)
                .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10))),
            Arc::new(ManualClock::starting_now()),
        )
    }

    fn tracker() -> (StageTracker, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        (tracker_over(store.clone()), store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (tracker, store) = tracker();
        let created = tracker.create("req-1", &fingerprint()).await.unwrap();
        assert_eq!(created.stage, Stage::Ingested);
        assert_eq!(created.version, 1);
        assert_eq!(created.content_fingerprint, fingerprint().as_str());

        assert_eq!(tracker.get("req-1").await.unwrap(), created);
        assert_eq!(store.item_count(DEFAULT_RECORDS_TABLE), 1);
    }

    #[tokio::test]
    async fn test_create_twice_already_exists() {
        let (tracker, _) = tracker();
        tracker.create("req-1", &fingerprint()).await.unwrap();
        let err = tracker.create("req-1", &fingerprint()).await.unwrap_err();
        assert_eq!(
            err,
            DocpipeError::Stage(StageError::AlreadyExists {
                request_id: "req-1".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_missing_record() {
        let (tracker, _) = tracker();
        assert_eq!(tracker.find("nope").await.unwrap(), None);
        let err = tracker.current_stage("nope").await.unwrap_err();
        assert!(matches!(err, DocpipeError::Stage(StageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_full_forward_chain() {
        let (tracker, _) = tracker();
        tracker.create("req-1", &fingerprint()).await.unwrap();

        for to in &Stage::ORDERED[1..] {
            let record = tracker.advance("req-1", *to, None).await.unwrap();
            assert_eq!(record.stage, *to);
        }
        let done = tracker.get("req-1").await.unwrap();
        assert_eq!(done.status, PipelineStatus::Completed);
        assert_eq!(done.version, 5);
    }

    #[tokio::test]
    async fn test_skipping_a_stage_is_rejected() {
        let (tracker, _) = tracker();
        tracker.create("req-1", &fingerprint()).await.unwrap();

        let err = tracker
            .advance("req-1", Stage::Analyzed, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DocpipeError::Stage(StageError::InvalidTransition {
                from: Stage::Ingested,
                to: Stage::Analyzed,
                ..
            })
        ));
        assert!(err.is_integrity_error());

        let record = tracker.get("req-1").await.unwrap();
        assert_eq!(record.stage, Stage::Ingested);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_failed_reachable_from_every_non_terminal_stage() {
        let (tracker, _) = tracker();
        for (i, stop_at) in Stage::ORDERED[..4].iter().enumerate() {
            let id = format!("req-{}", i);
            tracker.create(&id, &fingerprint()).await.unwrap();
            for to in Stage::ORDERED[1..=i].iter() {
                tracker.advance(&id, *to, None).await.unwrap();
            }

            let failed = tracker
                .advance(&id, Stage::Failed, Some("analysis engine timed out".into()))
                .await
                .unwrap();
            assert_eq!(failed.status, PipelineStatus::Failed);
            assert_eq!(failed.failed_at_stage, Some(*stop_at));
            assert_eq!(failed.last_error.as_deref(), Some("analysis engine timed out"));
            assert_eq!(tracker.resume_point(&id).await.unwrap(), *stop_at);
        }
    }

    #[tokio::test]
    async fn test_terminal_stages_accept_nothing() {
        let (tracker, _) = tracker();
        tracker.create("req-1", &fingerprint()).await.unwrap();
        tracker.advance("req-1", Stage::Failed, None).await.unwrap();

        for to in [Stage::Analyzing, Stage::Failed, Stage::Delivered] {
            let err = tracker.advance("req-1", to, None).await.unwrap_err();
            assert!(matches!(err, DocpipeError::Stage(StageError::InvalidTransition { .. })));
        }
    }

    #[tokio::test]
    async fn test_stale_version_is_concurrent_modification() {
        let (tracker, _) = tracker();
        let seen = tracker.create("req-1", &fingerprint()).await.unwrap();

        tracker
            .advance_record(&seen, Stage::Analyzing, None)
            .await
            .unwrap();
        let err = tracker
            .advance_record(&seen, Stage::Analyzing, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DocpipeError::Stage(StageError::ConcurrentModification {
                request_id: "req-1".to_string(),
                expected_version: 1,
            })
        );
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reopen_failed_record() {
        let (tracker, _) = tracker();
        tracker.create("req-1", &fingerprint()).await.unwrap();
        tracker.advance("req-1", Stage::Analyzing, None).await.unwrap();
        tracker.advance("req-1", Stage::Analyzed, None).await.unwrap();
        tracker
            .advance("req-1", Stage::Failed, Some("formatter down".into()))
            .await
            .unwrap();

        let reopened = tracker.reopen("req-1").await.unwrap();
        assert_eq!(reopened.stage, Stage::Analyzed);
        assert_eq!(reopened.status, PipelineStatus::InProgress);
        assert_eq!(reopened.attempt, 1);
        assert_eq!(reopened.last_error, None);
        assert_eq!(reopened.failed_at_stage, None);

        // Reopening a healthy record changes nothing.
        let again = tracker.reopen("req-1").await.unwrap();
        assert_eq!(again, reopened);
    }

    #[tokio::test]
    async fn test_list_by_stage() {
        let (tracker, _) = tracker();
        for id in ["b", "a", "c"] {
            tracker.create(id, &fingerprint()).await.unwrap();
        }
        tracker.advance("c", Stage::Analyzing, None).await.unwrap();

        let ingested = tracker.list_by_stage(Stage::Ingested).await.unwrap();
        let ids: Vec<_> = ingested.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(tracker.list_by_stage(Stage::Analyzing).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let (tracker, store) = tracker();
        let mut attributes = Map::new();
        attributes.insert("stage".to_string(), json!("Shipped"));
        store
            .put(
                DEFAULT_RECORDS_TABLE,
                MetadataRecord {
                    key: "req-1".to_string(),
                    version: 1,
                    attributes,
                },
            )
            .await
            .unwrap();

        let err = tracker.get("req-1").await.unwrap_err();
        assert!(matches!(err, DocpipeError::Stage(StageError::Corrupt { .. })));
    }

    /// Fails the first `failures` reads with a timeout.
    struct FlakyStore {
        inner: InMemoryMetadataStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl MetadataStore for FlakyStore {
        async fn get(
            &self,
            table: &str,
            key: &str,
        ) -> Result<Option<MetadataRecord>, ServiceError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ServiceError::timeout(SERVICE_METADATA_STORE, "read timed out"));
            }
            self.inner.get(table, key).await
        }

        async fn put(&self, table: &str, record: MetadataRecord) -> Result<(), ServiceError> {
            self.inner.put(table, record).await
        }

        async fn update(
            &self,
            table: &str,
            key: &str,
            changes: Map<String, Value>,
            expected_version: Option<u64>,
        ) -> Result<MetadataRecord, ServiceError> {
            self.inner.update(table, key, changes, expected_version).await
        }

        async fn query(
            &self,
            table: &str,
            condition: IndexCondition,
        ) -> Result<Vec<MetadataRecord>, ServiceError> {
            self.inner.query(table, condition).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_failures_are_retried() {
        let store = Arc::new(FlakyStore {
            inner: InMemoryMetadataStore::new(),
            failures: AtomicU32::new(0),
        });
        let tracker = tracker_over(store.clone());
        tracker.create("req-1", &fingerprint()).await.unwrap();

        store.failures.store(2, Ordering::SeqCst);
        assert_eq!(tracker.current_stage("req-1").await.unwrap(), Stage::Ingested);
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
    }
}
