//! Warning channel for recoverable, record-level problems
//!
//! Malformed records are dropped and reported here, never escalated. The first
//! few are logged individually; the rest only show up in the summary so that a
//! systematically broken input does not flood stderr.

use crate::error::KeyError;
use itertools::Itertools;
use log::warn;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Number of skipped records reported one by one before going quiet
pub const DEFAULT_WARNING_LIMIT: u64 = 10;

#[derive(Debug, Default)]
struct Counts {
    skipped: u64,
    by_reason: BTreeMap<KeyError, u64>,
}

/// Thread-safe aggregator of skipped-record warnings.
#[derive(Debug)]
pub struct Diagnostics {
    limit: u64,
    counts: Mutex<Counts>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(DEFAULT_WARNING_LIMIT)
    }
}

impl Diagnostics {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Record that line `line_no` of `origin` was dropped
    pub fn skip_record(&self, origin: &str, line_no: u64, reason: KeyError) {
        let seen = {
            let mut counts = self.counts.lock();
            counts.skipped += 1;
            *counts.by_reason.entry(reason).or_insert(0) += 1;
            counts.skipped
        };
        if seen <= self.limit {
            warn!("{origin}:{line_no}: skipping record: {reason}");
        }
        if seen == self.limit + 1 {
            warn!("further skipped records will only be counted");
        }
    }

    /// Total records skipped so far
    pub fn skipped(&self) -> u64 {
        self.counts.lock().skipped
    }

    /// Records skipped for one reason
    pub fn skipped_for(&self, reason: KeyError) -> u64 {
        self.counts
            .lock()
            .by_reason
            .get(&reason)
            .copied()
            .unwrap_or(0)
    }

    /// Emit one summary warning if anything was skipped
    pub fn summarize(&self) {
        let counts = self.counts.lock();
        if counts.skipped == 0 {
            return;
        }
        let detail = counts
            .by_reason
            .iter()
            .map(|(reason, n)| format!("{n} with {reason}"))
            .join(", ");
        warn!("skipped {} malformed record(s): {detail}", counts.skipped);
    }
}
