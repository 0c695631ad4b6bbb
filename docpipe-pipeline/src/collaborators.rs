//! Processing collaborators.
//!
//! Text extraction, AI analysis and output formatting are opaque services
//! from the pipeline's point of view. Like the storage traits they return the
//! raw [`ServiceError`] and leave retries to the orchestrator.

use async_trait::async_trait;
use docpipe_core::{ProcessingParams, ServiceError, SERVICE_TEXT_EXTRACTOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output of the analysis engine for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub model_id: String,
    pub summary: String,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Structured fields extracted from the document
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl AnalysisResult {
    pub fn new(model_id: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            summary: summary.into(),
            labels: Vec::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Rendered result ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedOutput {
    pub content_type: String,
    pub body: String,
}

impl FormattedOutput {
    pub fn new(content_type: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

/// AI inference service.
#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze(
        &self,
        text: &str,
        params: &ProcessingParams,
    ) -> Result<AnalysisResult, ServiceError>;
}

/// Turns raw document bytes into text for analysis.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], params: &ProcessingParams)
        -> Result<String, ServiceError>;
}

/// Renders an analysis result into the delivered representation.
#[async_trait]
pub trait ResultFormatter: Send + Sync {
    async fn format(
        &self,
        result: &AnalysisResult,
        params: &ProcessingParams,
    ) -> Result<FormattedOutput, ServiceError>;
}

/// Error code for documents that are not valid UTF-8.
pub const UNSUPPORTED_ENCODING: &str = "UnsupportedEncoding";

/// Treats the document as UTF-8 text, truncated to `max_input_chars`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8TextExtractor;

#[async_trait]
impl TextExtractor for Utf8TextExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        params: &ProcessingParams,
    ) -> Result<String, ServiceError> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            ServiceError::status(SERVICE_TEXT_EXTRACTOR, 415, e.to_string())
                .with_code(UNSUPPORTED_ENCODING)
        })?;
        Ok(match text.char_indices().nth(params.max_input_chars) {
            Some((cut, _)) => text[..cut].to_string(),
            None => text.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_utf8_extractor_truncates_on_char_boundary() {
        let params = ProcessingParams::new("model-a").with_max_input_chars(3);
        let text = Utf8TextExtractor.extract("héllo".as_bytes(), &params).await.unwrap();
        assert_eq!(text, "hél");

        let short = Utf8TextExtractor.extract(b"hi", &params).await.unwrap();
        assert_eq!(short, "hi");
    }

    #[tokio::test]
    async fn test_utf8_extractor_rejects_binary() {
        let params = ProcessingParams::default();
        let err = Utf8TextExtractor
            .extract(&[0xff, 0xfe, 0x00], &params)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(415));
        assert!(err.has_code(UNSUPPORTED_ENCODING));
    }

    #[test]
    fn test_analysis_result_tolerates_missing_optional_fields() {
        let parsed: AnalysisResult =
            serde_json::from_str(r#"{"model_id":"m","summary":"s"}"#).unwrap();
        assert_eq!(parsed, AnalysisResult::new("m", "s"));
    }
}
