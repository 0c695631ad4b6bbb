//! Fuzz target for caller-supplied fingerprints.
//!
//! `Fingerprint::parse` runs before any record is touched, so it must reject
//! every malformed input without panicking.
//!
//! Run with: cargo +nightly fuzz run fingerprint_fuzz -- -max_total_time=60

#![no_main]

use docpipe_core::{Fingerprint, FINGERPRINT_HEX_LEN};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(fp) = Fingerprint::parse(input) {
            assert_eq!(fp.as_str().len(), FINGERPRINT_HEX_LEN);
            assert_eq!(fp.as_str(), input);
            assert!(fp
                .as_str()
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }
    }
});
