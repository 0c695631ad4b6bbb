//! Docpipe Pipeline - Document Processing Orchestration
//!
//! Runs documents through ingestion, analysis, formatting and delivery on
//! top of the resilience layer (`docpipe-resilience`) and the cache and
//! stage tracking of `docpipe-storage`.
//!
//! - `collaborators` - the text extractor, analysis engine and formatter traits
//! - `events` - listeners for stage transitions and cache hits
//! - `orchestrator` - `PipelineOrchestrator::run`
//! - `telemetry` - tracing subscriber setup

pub mod collaborators;
pub mod events;
pub mod orchestrator;
pub mod telemetry;

pub use collaborators::{
    AnalysisEngine, AnalysisResult, FormattedOutput, ResultFormatter, TextExtractor,
    Utf8TextExtractor, UNSUPPORTED_ENCODING,
};
pub use events::{
    CacheHitEvent, ListenerChain, ListenerError, PipelineListener, StageEnteredEvent,
    StageFailedEvent,
};
pub use orchestrator::{
    Collaborators, PipelineOrchestrator, FINGERPRINT_METADATA, INVOCATION_METADATA,
};
pub use telemetry::{init_tracing, LogFormat};
