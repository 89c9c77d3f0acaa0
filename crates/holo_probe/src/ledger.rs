//! Submission timestamps keyed by sequence value.
//!
//! Only read when a validation pass reports a missing value, to help line the
//! gap up with backend logs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Write-once map from reserved value to the instant it was submitted.
#[derive(Debug, Default)]
pub struct TimestampLedger {
    entries: Mutex<HashMap<u64, SystemTime>>,
}

impl TimestampLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Record the submission instant for `value`. Later records for the same
    /// value are ignored.
    pub fn record(&self, value: u64, at: SystemTime) {
        self.lock().entry(value).or_insert(at);
    }

    pub fn record_now(&self, value: u64) {
        self.record(value, SystemTime::now());
    }

    pub fn get(&self, value: u64) -> Option<SystemTime> {
        self.lock().get(&value).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, SystemTime>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Render an optional ledger timestamp for diagnostics.
pub fn format_timestamp(at: Option<SystemTime>) -> String {
    match at {
        Some(at) => humantime::format_rfc3339_millis(at).to_string(),
        None => "unknown".to_string(),
    }
}
