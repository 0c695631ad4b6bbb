//! Content fingerprints.
//!
//! A fingerprint identifies a (document, processing parameters) pair. It is
//! the cache key for analysis results and the idempotency token the stage
//! tracker compares before re-running expensive work.

use crate::FingerprintError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Domain tag mixed into every digest so fingerprints can be versioned.
const FINGERPRINT_DOMAIN: &[u8] = b"docpipe.fingerprint.v1";

/// Length of a rendered fingerprint (hex-encoded SHA-256).
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// Parameters that influence the output of the pipeline.
///
/// Every field takes part in the fingerprint. `extra` is a `BTreeMap` so the
/// canonical encoding does not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingParams {
    /// Model identifier passed to the analysis engine
    pub model_id: String,
    /// Extracted text is truncated to this many characters
    pub max_input_chars: usize,
    pub temperature: f32,
    /// Output format requested from the formatter (e.g. "markdown")
    pub output_format: String,
    pub extra: BTreeMap<String, String>,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            model_id: "default-model".to_string(),
            max_input_chars: 100_000,
            temperature: 0.0,
            output_format: "markdown".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl ProcessingParams {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    pub fn with_max_input_chars(mut self, max: usize) -> Self {
        self.max_input_chars = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Canonical byte encoding used for hashing.
    ///
    /// Floats are encoded by bit pattern so `0.1` hashes identically on
    /// every platform regardless of float formatting.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.model_id.len() + self.output_format.len());
        write_field(&mut out, b"model_id", self.model_id.as_bytes());
        write_field(
            &mut out,
            b"max_input_chars",
            &(self.max_input_chars as u64).to_be_bytes(),
        );
        write_field(&mut out, b"temperature", &self.temperature.to_bits().to_be_bytes());
        write_field(&mut out, b"output_format", self.output_format.as_bytes());
        for (key, value) in &self.extra {
            write_field(&mut out, b"extra.key", key.as_bytes());
            write_field(&mut out, b"extra.value", value.as_bytes());
        }
        out
    }
}

/// Length-prefixed field so adjacent fields cannot bleed into each other.
fn write_field(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&(value.len() as u64).to_be_bytes());
    out.extend_from_slice(value);
}

/// SHA-256 fingerprint of document bytes plus processing parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of `bytes` processed with `params`.
    pub fn compute(bytes: &[u8], params: &ProcessingParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
        hasher.update(params.canonical_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Validate a caller-supplied fingerprint.
    pub fn parse(value: &str) -> Result<Self, FingerprintError> {
        if value.len() != FINGERPRINT_HEX_LEN {
            return Err(FingerprintError::Malformed {
                value: value.to_string(),
                reason: format!(
                    "expected {} hex characters, got {}",
                    FINGERPRINT_HEX_LEN,
                    value.len()
                ),
            });
        }
        if !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(FingerprintError::Malformed {
                value: value.to_string(),
                reason: "expected lowercase hex".to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = FingerprintError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_params() -> impl Strategy<Value = ProcessingParams> {
        (
            "[a-z0-9-]{1,16}",
            0usize..1_000_000,
            0.0f32..2.0,
            prop::collection::btree_map("[a-z]{1,4}", "[a-z]{0,4}", 0..3),
        )
            .prop_map(|(model_id, max_input_chars, temperature, extra)| ProcessingParams {
                model_id,
                max_input_chars,
                temperature,
                output_format: "markdown".to_string(),
                extra,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Identical bytes and params always produce the identical fingerprint.
        #[test]
        fn prop_fingerprint_deterministic(
            bytes in prop::collection::vec(any::<u8>(), 0..512),
            params in arb_params(),
        ) {
            let a = Fingerprint::compute(&bytes, &params);
            let b = Fingerprint::compute(&bytes, &params.clone());
            prop_assert_eq!(a, b);
        }

        /// Changing the model identifier never collides.
        #[test]
        fn prop_model_change_changes_fingerprint(
            bytes in prop::collection::vec(any::<u8>(), 0..256),
            params in arb_params(),
            suffix in "[a-z]{1,4}",
        ) {
            let mut other = params.clone();
            other.model_id.push_str(&suffix);
            prop_assert_ne!(
                Fingerprint::compute(&bytes, &params),
                Fingerprint::compute(&bytes, &other)
            );
        }

        /// Flipping any byte of the document changes the fingerprint.
        #[test]
        fn prop_byte_flip_changes_fingerprint(
            bytes in prop::collection::vec(any::<u8>(), 1..256),
            index in any::<prop::sample::Index>(),
            params in arb_params(),
        ) {
            let mut flipped = bytes.clone();
            let i = index.index(flipped.len());
            flipped[i] ^= 0x01;
            prop_assert_ne!(
                Fingerprint::compute(&bytes, &params),
                Fingerprint::compute(&flipped, &params)
            );
        }

        /// Every computed fingerprint parses back.
        #[test]
        fn prop_computed_fingerprint_parses(
            bytes in prop::collection::vec(any::<u8>(), 0..64),
            params in arb_params(),
        ) {
            let fp = Fingerprint::compute(&bytes, &params);
            prop_assert_eq!(Fingerprint::parse(fp.as_str()).unwrap(), fp);
        }
    }
}
