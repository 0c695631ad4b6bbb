//! Pipeline event listeners.
//!
//! Listeners observe stage transitions and cache hits of every `run`. They
//! are called in registration order; a failing listener is logged and the
//! rest still run.

use async_trait::async_trait;
use docpipe_core::{Stage, TierKind, Timestamp};
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// EVENTS
// ============================================================================

/// A record moved into `stage`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEnteredEvent {
    pub invocation_id: Uuid,
    pub request_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub timestamp: Timestamp,
}

/// Work in `stage` failed and the record was marked `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailedEvent {
    pub invocation_id: Uuid,
    pub request_id: String,
    pub stage: Stage,
    pub error_message: String,
    pub timestamp: Timestamp,
}

/// A cached result was used instead of calling a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHitEvent {
    pub invocation_id: Uuid,
    pub request_id: String,
    pub category: String,
    pub tier: TierKind,
    pub timestamp: Timestamp,
}

/// Error returned by a listener. Never fails a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

// ============================================================================
// LISTENER
// ============================================================================

/// Async trait for pipeline listeners. Every hook defaults to a no-op.
#[async_trait]
pub trait PipelineListener: Send + Sync {
    async fn on_stage_entered(&self, _event: StageEnteredEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn on_stage_failed(&self, _event: StageFailedEvent) -> Result<(), ListenerError> {
        Ok(())
    }

    async fn on_cache_hit(&self, _event: CacheHitEvent) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Chain of pipeline listeners.
#[derive(Default)]
pub struct ListenerChain {
    listeners: Vec<Arc<dyn PipelineListener>>,
}

impl std::fmt::Debug for ListenerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerChain")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn PipelineListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub async fn emit_stage_entered(&self, event: StageEnteredEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_stage_entered(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    error = %e,
                    "Stage entered listener failed"
                );
            }
        }
    }

    pub async fn emit_stage_failed(&self, event: StageFailedEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_stage_failed(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    error = %e,
                    "Stage failed listener failed"
                );
            }
        }
    }

    pub async fn emit_cache_hit(&self, event: CacheHitEvent) {
        for (idx, listener) in self.listeners.iter().enumerate() {
            if let Err(e) = listener.on_cache_hit(event.clone()).await {
                tracing::warn!(
                    listener_index = idx,
                    error = %e,
                    "Cache hit listener failed"
                );
            }
        }
    }
}
