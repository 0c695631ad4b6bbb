//! Drives one document through ingestion, analysis, formatting and delivery.
//!
//! Every step is idempotent with respect to the persisted
//! [`PipelineRecord`]: a run picks up wherever the record says work stopped,
//! expensive results come from the [`TieredCache`] when they are still valid,
//! and collaborator calls go through the [`RetryExecutor`] behind a named
//! circuit breaker.

use crate::collaborators::{
    AnalysisEngine, AnalysisResult, FormattedOutput, ResultFormatter, TextExtractor,
};
use crate::events::{
    CacheHitEvent, ListenerChain, PipelineListener, StageEnteredEvent, StageFailedEvent,
};
use docpipe_core::{
    Clock, DocpipeError, DocpipeResult, Fingerprint, FingerprintError, HealthCheck,
    PipelineConfig, PipelineRecord, Stage, StageError, CATEGORY_ANALYSIS_RESULT,
    CATEGORY_RENDERED_TEMPLATE, SERVICE_ANALYSIS_ENGINE, SERVICE_FORMATTER,
    SERVICE_METADATA_STORE, SERVICE_OBJECT_STORE, SERVICE_TEXT_EXTRACTOR,
};
use docpipe_resilience::{BreakerRegistry, RetryExecutor, RetryOptions};
use docpipe_storage::{
    CacheOutcome, MetadataStore, ObjectMetadata, ObjectStore, StageTracker, TieredCache,
    ValueSource,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Object metadata key carrying the content fingerprint.
pub const FINGERPRINT_METADATA: &str = "docpipe-fingerprint";
/// Object metadata key carrying the invocation that wrote the object.
pub const INVOCATION_METADATA: &str = "docpipe-invocation-id";

/// External services the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub object_store: Arc<dyn ObjectStore>,
    pub metadata_store: Arc<dyn MetadataStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub engine: Arc<dyn AnalysisEngine>,
    pub formatter: Arc<dyn ResultFormatter>,
}

/// Per-call context of one `run`.
struct Invocation<'a> {
    id: Uuid,
    request_id: &'a str,
    fingerprint: Fingerprint,
    document: &'a [u8],
    deadline: Option<Instant>,
}

/// Runs documents through the pipeline.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    collaborators: Collaborators,
    tracker: StageTracker,
    cache: Arc<TieredCache>,
    executor: Arc<RetryExecutor>,
    breakers: Arc<BreakerRegistry>,
    listeners: ListenerChain,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .field("breakers", &self.breakers)
            .field("listeners", &self.listeners)
            .finish()
    }
}

impl PipelineOrchestrator {
    /// Build an orchestrator. Fails if `config` does not validate.
    pub fn new(
        config: PipelineConfig,
        collaborators: Collaborators,
        cache: Arc<TieredCache>,
        clock: Arc<dyn Clock>,
    ) -> DocpipeResult<Self> {
        config.validate()?;
        cache.policies().validate()?;

        let executor = Arc::new(RetryExecutor::default());
        let breakers = Arc::new(BreakerRegistry::new(config.circuit.clone(), clock.clone()));
        let tracker = Self::build_tracker(&config, &collaborators, executor.clone(), clock.clone());
        Ok(Self {
            config,
            collaborators,
            tracker,
            cache,
            executor,
            breakers,
            listeners: ListenerChain::new(),
            clock,
        })
    }

    fn build_tracker(
        config: &PipelineConfig,
        collaborators: &Collaborators,
        executor: Arc<RetryExecutor>,
        clock: Arc<dyn Clock>,
    ) -> StageTracker {
        // No breaker: lost version races are expected and must not trip it.
        StageTracker::new(
            collaborators.metadata_store.clone(),
            config.records_table.clone(),
            executor,
            RetryOptions::from_config(SERVICE_METADATA_STORE, &config.retry),
            clock,
        )
    }

    /// Replace the retry executor, e.g. with a seeded one.
    pub fn with_executor(mut self, executor: Arc<RetryExecutor>) -> Self {
        self.tracker = Self::build_tracker(
            &self.config,
            &self.collaborators,
            executor.clone(),
            self.clock.clone(),
        );
        self.executor = executor;
        self
    }

    /// Share a breaker registry with other components.
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &StageTracker {
        &self.tracker
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// One health check per circuit breaker created so far.
    pub fn health(&self) -> Vec<HealthCheck> {
        self.breakers.health()
    }

    /// Fingerprint of `document` under the configured processing params.
    pub fn fingerprint_for(&self, document: &[u8]) -> Fingerprint {
        Fingerprint::compute(document, &self.config.params)
    }

    // ------------------------------------------------------------------------
    // Run
    // ------------------------------------------------------------------------

    /// Process `document` for `request_id`, resuming earlier progress.
    ///
    /// A fingerprint that is malformed, or that was not computed from
    /// `document` under the configured params, fails before anything is
    /// stored or cached. A fingerprint that differs from the one already
    /// recorded for `request_id` fails before the record changes. Any other
    /// failure is recorded on the record as `Failed` and returned; calling
    /// `run` again resumes from the failed stage.
    pub async fn run(
        &self,
        request_id: &str,
        fingerprint: &str,
        document: &[u8],
    ) -> DocpipeResult<PipelineRecord> {
        let fingerprint = Fingerprint::parse(fingerprint)?;
        let computed = self.fingerprint_for(document);
        if computed != fingerprint {
            return Err(FingerprintError::ContentMismatch {
                request_id: request_id.to_string(),
                computed: computed.as_str().to_string(),
                supplied: fingerprint.as_str().to_string(),
            }
            .into());
        }

        let invocation = Invocation {
            id: Uuid::now_v7(),
            request_id,
            fingerprint,
            document,
            deadline: self.config.run_timeout.map(|t| Instant::now() + t),
        };
        let span = tracing::info_span!(
            "pipeline_run",
            request_id,
            invocation_id = %invocation.id
        );
        self.run_invocation(&invocation).instrument(span).await
    }

    async fn run_invocation(&self, inv: &Invocation<'_>) -> DocpipeResult<PipelineRecord> {
        let mut record = self.load_or_create(inv).await?;
        if record.stage == Stage::Delivered {
            tracing::debug!("Already delivered");
            return Ok(record);
        }

        let mut conflicts = 0;
        loop {
            match self.step(inv, &record).await {
                Ok(next) if next.stage == Stage::Delivered => {
                    tracing::info!(attempt = next.attempt, "Pipeline delivered");
                    return Ok(next);
                }
                Ok(next) => record = next,
                Err(DocpipeError::Stage(StageError::ConcurrentModification { .. }))
                    if conflicts < self.config.max_conflict_retries =>
                {
                    conflicts += 1;
                    record = self.tracker.get(inv.request_id).await?;
                    tracing::debug!(
                        conflicts,
                        stage = %record.stage,
                        "Record moved by another invocation, continuing from stored stage"
                    );
                    if record.stage == Stage::Delivered {
                        return Ok(record);
                    }
                }
                Err(e) if e.is_integrity_error() => return Err(e),
                Err(e) => {
                    self.mark_failed(inv, &record, &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn load_or_create(&self, inv: &Invocation<'_>) -> DocpipeResult<PipelineRecord> {
        let record = match self.tracker.find(inv.request_id).await? {
            Some(record) => record,
            None => {
                self.store_document(inv).await?;
                match self.tracker.create(inv.request_id, &inv.fingerprint).await {
                    Ok(record) => {
                        self.emit_entered(inv, &record).await;
                        record
                    }
                    // Another invocation created it first.
                    Err(DocpipeError::Stage(StageError::AlreadyExists { .. })) => {
                        self.tracker.get(inv.request_id).await?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if record.content_fingerprint != inv.fingerprint.as_str() {
            return Err(FingerprintError::Mismatch {
                request_id: inv.request_id.to_string(),
                stored: record.content_fingerprint,
                supplied: inv.fingerprint.as_str().to_string(),
            }
            .into());
        }
        Ok(record)
    }

    /// Perform the work of `record`'s current stage and move it on.
    async fn step(
        &self,
        inv: &Invocation<'_>,
        record: &PipelineRecord,
    ) -> DocpipeResult<PipelineRecord> {
        let next = match record.stage {
            Stage::Failed => {
                tracing::info!(
                    failed_at = ?record.failed_at_stage,
                    attempt = record.attempt + 1,
                    "Reopening failed record"
                );
                self.tracker.reopen_record(record).await?
            }
            Stage::Ingested => {
                self.tracker
                    .advance_record(record, Stage::Analyzing, None)
                    .await?
            }
            Stage::Analyzing => {
                self.analysis(inv).await?;
                self.tracker
                    .advance_record(record, Stage::Analyzed, None)
                    .await?
            }
            Stage::Analyzed => {
                self.tracker
                    .advance_record(record, Stage::Formatting, None)
                    .await?
            }
            Stage::Formatting => {
                let analysis = self.analysis(inv).await?;
                let output = self.rendered(inv, analysis).await?;
                self.deliver(inv, output).await?;
                self.tracker
                    .advance_record(record, Stage::Delivered, None)
                    .await?
            }
            Stage::Delivered => return Ok(record.clone()),
        };
        self.emit_entered(inv, &next).await;
        Ok(next)
    }

    async fn mark_failed(
        &self,
        inv: &Invocation<'_>,
        record: &PipelineRecord,
        error: &DocpipeError,
    ) {
        tracing::warn!(stage = %record.stage, error = %error, "Pipeline stage failed");
        if !record.stage.can_advance_to(Stage::Failed) {
            return;
        }
        let message = error.to_string();
        if let Err(e) = self
            .tracker
            .advance_record(record, Stage::Failed, Some(message.clone()))
            .await
        {
            tracing::warn!(error = %e, "Could not record pipeline failure");
            return;
        }
        self.listeners
            .emit_stage_failed(StageFailedEvent {
                invocation_id: inv.id,
                request_id: inv.request_id.to_string(),
                stage: record.stage,
                error_message: message,
                timestamp: self.clock.now(),
            })
            .await;
    }

    // ------------------------------------------------------------------------
    // Stage work
    // ------------------------------------------------------------------------

    fn options(&self, service: &str, inv: &Invocation<'_>) -> RetryOptions {
        RetryOptions::from_config(service, &self.config.retry)
            .with_breaker(self.breakers.get(service))
            .with_deadline(inv.deadline)
    }

    async fn store_document(&self, inv: &Invocation<'_>) -> DocpipeResult<()> {
        let key = format!("documents/{}", inv.request_id);
        let metadata = self.object_metadata(inv);
        let store = &self.collaborators.object_store;
        let bucket = self.config.input_bucket.as_str();
        self.executor
            .execute(&self.options(SERVICE_OBJECT_STORE, inv), || {
                store.put(bucket, &key, inv.document.to_vec(), metadata.clone())
            })
            .await
    }

    async fn analysis(&self, inv: &Invocation<'_>) -> DocpipeResult<AnalysisResult> {
        self.cached(inv, CATEGORY_ANALYSIS_RESULT, || async {
            let text = self.extract(inv).await?;
            let engine = &self.collaborators.engine;
            let params = &self.config.params;
            let text = text.as_str();
            self.executor
                .execute(&self.options(SERVICE_ANALYSIS_ENGINE, inv), move || {
                    engine.analyze(text, params)
                })
                .await
        })
        .await
    }

    async fn extract(&self, inv: &Invocation<'_>) -> DocpipeResult<String> {
        let extractor = &self.collaborators.extractor;
        let params = &self.config.params;
        let document = inv.document;
        self.executor
            .execute(&self.options(SERVICE_TEXT_EXTRACTOR, inv), move || {
                extractor.extract(document, params)
            })
            .await
    }

    async fn rendered(
        &self,
        inv: &Invocation<'_>,
        analysis: AnalysisResult,
    ) -> DocpipeResult<FormattedOutput> {
        self.cached(inv, CATEGORY_RENDERED_TEMPLATE, || async {
            let formatter = &self.collaborators.formatter;
            let params = &self.config.params;
            let analysis = &analysis;
            self.executor
                .execute(&self.options(SERVICE_FORMATTER, inv), move || {
                    formatter.format(analysis, params)
                })
                .await
        })
        .await
    }

    async fn deliver(&self, inv: &Invocation<'_>, output: FormattedOutput) -> DocpipeResult<()> {
        let key = format!("results/{}", inv.request_id);
        let mut metadata = self.object_metadata(inv);
        metadata.insert("content-type".to_string(), output.content_type);
        let body = output.body.into_bytes();
        let store = &self.collaborators.object_store;
        let bucket = self.config.output_bucket.as_str();
        self.executor
            .execute(&self.options(SERVICE_OBJECT_STORE, inv), || {
                store.put(bucket, &key, body.clone(), metadata.clone())
            })
            .await
    }

    fn object_metadata(&self, inv: &Invocation<'_>) -> ObjectMetadata {
        let mut metadata = ObjectMetadata::new();
        metadata.insert(
            FINGERPRINT_METADATA.to_string(),
            inv.fingerprint.as_str().to_string(),
        );
        metadata.insert(INVOCATION_METADATA.to_string(), inv.id.to_string());
        metadata
    }

    /// Cache lookup keyed by the invocation's fingerprint, reporting hits.
    async fn cached<T, F, Fut>(
        &self,
        inv: &Invocation<'_>,
        category: &str,
        factory: F,
    ) -> DocpipeResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DocpipeResult<T>>,
    {
        let CacheOutcome { value, source } = self
            .cache
            .get_or_compute_with_source(inv.fingerprint.as_str(), category, factory, inv.deadline)
            .await?;
        if let ValueSource::Tier(tier) = source {
            tracing::debug!(category, tier = %tier, "Cache hit");
            self.listeners
                .emit_cache_hit(CacheHitEvent {
                    invocation_id: inv.id,
                    request_id: inv.request_id.to_string(),
                    category: category.to_string(),
                    tier,
                    timestamp: self.clock.now(),
                })
                .await;
        }
        Ok(value)
    }

    async fn emit_entered(&self, inv: &Invocation<'_>, record: &PipelineRecord) {
        self.listeners
            .emit_stage_entered(StageEnteredEvent {
                invocation_id: inv.id,
                request_id: inv.request_id.to_string(),
                stage: record.stage,
                attempt: record.attempt,
                timestamp: self.clock.now(),
            })
            .await;
    }
}

