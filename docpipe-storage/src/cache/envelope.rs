//! Stored layout shared by the byte-oriented remote tiers.
//!
//! `[expires_at: 8 bytes, little-endian unix millis][value bytes]`

use chrono::DateTime;
use docpipe_core::{ServiceError, Timestamp};

const HEADER_LEN: usize = 8;

pub(crate) fn seal(expires_at: Timestamp, bytes: &[u8]) -> Vec<u8> {
    let mut full = Vec::with_capacity(HEADER_LEN + bytes.len());
    full.extend_from_slice(&expires_at.timestamp_millis().to_le_bytes());
    full.extend_from_slice(bytes);
    full
}

pub(crate) fn open(
    service: &str,
    key: &str,
    stored: &[u8],
) -> Result<(Vec<u8>, Timestamp), ServiceError> {
    let malformed = || ServiceError::other(service, format!("malformed entry for {}", key));
    let header: [u8; HEADER_LEN] = stored
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(malformed)?;
    let expires_at =
        DateTime::from_timestamp_millis(i64::from_le_bytes(header)).ok_or_else(malformed)?;
    Ok((stored[HEADER_LEN..].to_vec(), expires_at))
}
