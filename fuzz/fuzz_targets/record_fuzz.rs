//! Fuzz target for stored pipeline records.
//!
//! Records come back from the metadata store as JSON; decoding arbitrary
//! attributes must fail cleanly, and anything that decodes must keep a stage
//! name that parses back to itself.
//!
//! Run with: cargo +nightly fuzz run record_fuzz -- -max_total_time=60

#![no_main]

use docpipe_core::{PipelineRecord, Stage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = serde_json::from_slice::<PipelineRecord>(data) {
        let _ = record.resume_point();
        assert_eq!(record.stage.to_string().parse::<Stage>(), Ok(record.stage));
    }
});
