//! Docpipe Test Utilities
//!
//! Shared test infrastructure for the docpipe workspace:
//! - Scripted collaborators that fail on demand and count their calls
//! - A listener that records every pipeline event
//! - A fully wired in-memory pipeline harness
//! - Proptest generators for documents and processing parameters

pub use docpipe_core::{
    DocpipeError, DocpipeResult, Fingerprint, ManualClock, PipelineConfig, PipelineRecord,
    ProcessingParams, RetryConfig, ServiceError, Stage, TierKind,
};
pub use docpipe_storage::{InMemoryMetadataStore, InMemoryObjectStore, InMemoryTierBackend};

use async_trait::async_trait;
use docpipe_pipeline::{
    AnalysisEngine, AnalysisResult, CacheHitEvent, FormattedOutput, ListenerError,
    PipelineListener, ResultFormatter, StageEnteredEvent, StageFailedEvent,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

// ============================================================================
// SCRIPTED COLLABORATORS
// ============================================================================

/// Failure script shared by the scripted collaborators.
#[derive(Debug)]
struct Script {
    calls: AtomicU32,
    failures_remaining: AtomicU32,
    failure: Mutex<ServiceError>,
}

impl Script {
    fn new(failure: ServiceError) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
            failure: Mutex::new(failure),
        }
    }

    /// Count the call and return the scripted failure if one is pending.
    fn next(&self) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone()),
            Err(_) => Ok(()),
        }
    }

    fn fail_next(&self, times: u32, error: ServiceError) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = error;
        self.failures_remaining.store(times, Ordering::SeqCst);
    }
}

/// Analysis engine whose next N calls fail with a chosen error.
///
/// Successful calls summarize the text by its character count, so results
/// are deterministic for a given input.
#[derive(Debug)]
pub struct ScriptedAnalysisEngine {
    script: Script,
}

impl ScriptedAnalysisEngine {
    pub fn new() -> Self {
        Self {
            script: Script::new(ServiceError::timeout(
                docpipe_core::SERVICE_ANALYSIS_ENGINE,
                "scripted timeout",
            )),
        }
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_next(&self, times: u32, error: ServiceError) {
        self.script.fail_next(times, error);
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedAnalysisEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedAnalysisEngine {
    async fn analyze(
        &self,
        text: &str,
        params: &ProcessingParams,
    ) -> Result<AnalysisResult, ServiceError> {
        self.script.next()?;
        Ok(
            AnalysisResult::new(params.model_id.clone(), format!("{} chars", text.chars().count()))
                .with_label("scripted")
                .with_field("temperature", serde_json::json!(params.temperature)),
        )
    }
}

/// Formatter rendering the summary as markdown, failing on demand.
#[derive(Debug)]
pub struct ScriptedFormatter {
    script: Script,
}

impl ScriptedFormatter {
    pub fn new() -> Self {
        Self {
            script: Script::new(ServiceError::status(
                docpipe_core::SERVICE_FORMATTER,
                503,
                "scripted outage",
            )),
        }
    }

    pub fn fail_next(&self, times: u32, error: ServiceError) {
        self.script.fail_next(times, error);
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedFormatter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultFormatter for ScriptedFormatter {
    async fn format(
        &self,
        result: &AnalysisResult,
        params: &ProcessingParams,
    ) -> Result<FormattedOutput, ServiceError> {
        self.script.next()?;
        Ok(FormattedOutput::new(
            format!("text/{}", params.output_format),
            format!("# {}\n\n{}\n", result.model_id, result.summary),
        ))
    }
}

// ============================================================================
// RECORDING LISTENER
// ============================================================================

/// One event seen by a [`RecordingListener`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Entered(StageEnteredEvent),
    Failed(StageFailedEvent),
    CacheHit(CacheHitEvent),
}

/// Listener that keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Stages entered, in order.
    pub fn entered_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Entered(event) => Some(event.stage),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<StageFailedEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::Failed(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn cache_hits(&self) -> Vec<CacheHitEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RecordedEvent::CacheHit(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    fn push(&self, event: RecordedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

#[async_trait]
impl PipelineListener for RecordingListener {
    async fn on_stage_entered(&self, event: StageEnteredEvent) -> Result<(), ListenerError> {
        self.push(RecordedEvent::Entered(event));
        Ok(())
    }

    async fn on_stage_failed(&self, event: StageFailedEvent) -> Result<(), ListenerError> {
        self.push(RecordedEvent::Failed(event));
        Ok(())
    }

    async fn on_cache_hit(&self, event: CacheHitEvent) -> Result<(), ListenerError> {
        self.push(RecordedEvent::CacheHit(event));
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pipeline inputs.

    use super::*;
    use proptest::prelude::*;

    /// Arbitrary document bytes, including non-UTF-8 content.
    pub fn arb_document() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512)
    }

    /// Printable text documents.
    pub fn arb_text_document() -> impl Strategy<Value = Vec<u8>> {
        "[a-zA-Z0-9 .,\n]{0,256}".prop_map(String::into_bytes)
    }

    pub fn arb_request_id() -> impl Strategy<Value = String> {
        "req-[a-z0-9]{1,16}"
    }

    pub fn arb_processing_params() -> impl Strategy<Value = ProcessingParams> {
        (
            "[a-z][a-z0-9-]{0,15}",
            1usize..200_000,
            0u8..=20,
            prop::sample::select(vec!["markdown", "html", "json"]),
        )
            .prop_map(|(model, max_chars, temp, format)| {
                let mut params = ProcessingParams::new(model).with_max_input_chars(max_chars);
                params.temperature = f32::from(temp) / 10.0;
                params.output_format = format.to_string();
                params
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired pipeline for integration tests.

    use super::*;
    use docpipe_core::{CachePolicies, Clock};
    use docpipe_pipeline::{Collaborators, PipelineOrchestrator, Utf8TextExtractor};
    use docpipe_storage::{MemoryTier, MemoryTierConfig, TieredCache};
    use std::sync::Arc;
    use std::time::Duration;

    /// Retry config with short fixed delays and no jitter.
    pub fn fast_retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            strategy: docpipe_core::BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    pub fn test_config() -> PipelineConfig {
        PipelineConfig {
            retry: fast_retry_config(),
            params: ProcessingParams::new("test-model"),
            ..PipelineConfig::default()
        }
    }

    /// Everything an integration test needs to drive and inspect a run.
    ///
    /// The cache has an in-process and a durable tier (in-memory backend);
    /// both read time from `clock`.
    pub struct PipelineHarness {
        pub orchestrator: PipelineOrchestrator,
        pub objects: Arc<InMemoryObjectStore>,
        pub metadata: Arc<InMemoryMetadataStore>,
        pub engine: Arc<ScriptedAnalysisEngine>,
        pub formatter: Arc<ScriptedFormatter>,
        pub listener: Arc<RecordingListener>,
        pub cache: Arc<TieredCache>,
        pub memory: Arc<MemoryTier>,
        pub durable: Arc<InMemoryTierBackend>,
        pub clock: Arc<ManualClock>,
    }

    impl PipelineHarness {
        pub fn new() -> Self {
            Self::with_config(test_config())
        }

        pub fn with_config(config: PipelineConfig) -> Self {
            let clock = Arc::new(ManualClock::starting_now());
            let dyn_clock: Arc<dyn Clock> = clock.clone();
            let memory = Arc::new(MemoryTier::new(MemoryTierConfig::default(), dyn_clock.clone()));
            let durable = Arc::new(InMemoryTierBackend::new("durable-cache", dyn_clock.clone()));
            let cache = Arc::new(
                TieredCache::new(memory.clone(), CachePolicies::default(), dyn_clock)
                    .with_durable(durable.clone(), Duration::from_secs(7 * 86_400)),
            );
            Self::build(config, clock, memory, durable, cache)
        }

        /// A second pipeline with its own stores and collaborators that
        /// shares `other`'s cache and clock.
        pub fn sharing_cache_with(other: &PipelineHarness, config: PipelineConfig) -> Self {
            Self::build(
                config,
                other.clock.clone(),
                other.memory.clone(),
                other.durable.clone(),
                other.cache.clone(),
            )
        }

        fn build(
            config: PipelineConfig,
            clock: Arc<ManualClock>,
            memory: Arc<MemoryTier>,
            durable: Arc<InMemoryTierBackend>,
            cache: Arc<TieredCache>,
        ) -> Self {
            let objects = Arc::new(InMemoryObjectStore::new());
            let metadata = Arc::new(InMemoryMetadataStore::new());
            let engine = Arc::new(ScriptedAnalysisEngine::new());
            let formatter = Arc::new(ScriptedFormatter::new());
            let listener = Arc::new(RecordingListener::new());

            let collaborators = Collaborators {
                object_store: objects.clone(),
                metadata_store: metadata.clone(),
                extractor: Arc::new(Utf8TextExtractor),
                engine: engine.clone(),
                formatter: formatter.clone(),
            };
            let dyn_clock: Arc<dyn Clock> = clock.clone();
            let orchestrator =
                match PipelineOrchestrator::new(config, collaborators, cache.clone(), dyn_clock) {
                    Ok(orchestrator) => orchestrator.with_listener(listener.clone()),
                    Err(e) => panic!("test pipeline config is invalid: {e}"),
                };

            Self {
                orchestrator,
                objects,
                metadata,
                engine,
                formatter,
                listener,
                cache,
                memory,
                durable,
                clock,
            }
        }

        /// Fingerprint of `document` under the harness's processing params.
        pub fn fingerprint(&self, document: &[u8]) -> String {
            self.orchestrator.fingerprint_for(document).as_str().to_string()
        }

        /// Run `document` with its correct fingerprint.
        pub async fn run(
            &self,
            request_id: &str,
            document: &[u8],
        ) -> DocpipeResult<PipelineRecord> {
            let fingerprint = self.fingerprint(document);
            self.orchestrator.run(request_id, &fingerprint, document).await
        }

        /// Drop every cached value in the in-process tier.
        pub fn clear_memory_tier(&self) {
            self.memory.clear();
        }
    }

    impl Default for PipelineHarness {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for pipeline records and errors.

    use super::*;

    #[track_caller]
    pub fn assert_stage(record: &PipelineRecord, stage: Stage) {
        assert_eq!(
            record.stage, stage,
            "record {} is in {}, expected {}",
            record.request_id, record.stage, stage
        );
    }

    /// Assert the record is `Failed` after failing in `at`.
    #[track_caller]
    pub fn assert_failed_at(record: &PipelineRecord, at: Stage) {
        assert_stage(record, Stage::Failed);
        assert_eq!(record.failed_at_stage, Some(at));
        assert!(record.last_error.is_some(), "failed record has no error");
    }

    #[track_caller]
    pub fn assert_retry_exhausted<T: std::fmt::Debug>(result: &DocpipeResult<T>) {
        match result {
            Err(DocpipeError::Resilience(docpipe_core::ResilienceError::RetryExhausted {
                ..
            })) => {}
            other => panic!("Expected RetryExhausted, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_scripted_engine_fails_then_recovers() {
        let engine = ScriptedAnalysisEngine::new();
        engine.fail_next(2, ServiceError::timeout("analysis-engine", "slow"));
        let params = ProcessingParams::new("m");

        assert!(engine.analyze("abc", &params).await.is_err());
        assert!(engine.analyze("abc", &params).await.is_err());
        let result = engine.analyze("abc", &params).await.unwrap();
        assert_eq!(result.summary, "3 chars");
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_scripted_formatter_uses_output_format() {
        let formatter = ScriptedFormatter::new();
        let params = ProcessingParams::new("m");
        let output = formatter
            .format(&AnalysisResult::new("m", "s"), &params)
            .await
            .unwrap();
        assert_eq!(output.content_type, "text/markdown");
        assert!(output.body.contains("# m"));
    }

    proptest! {
        #[test]
        fn prop_generated_params_fingerprint_deterministically(
            params in generators::arb_processing_params(),
            doc in generators::arb_document(),
        ) {
            prop_assert_eq!(
                Fingerprint::compute(&doc, &params),
                Fingerprint::compute(&doc, &params)
            );
        }
    }
}
