//! Large-file ordering engine for tab-delimited variant records
//!
//! Records are lines whose first two tab-separated fields are a grouping key
//! (a chromosome name) and an integer position. The crate sorts such inputs
//! under a lexicographic or natural chromosome order, whatever their size:
//! in memory, through a memory-mapped zero-copy path, or by spilling sorted
//! shards to disk and merging them back with a k-way merge. The same merge
//! powers the merge, check and diff operations over already-sorted inputs.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]

pub mod error;
pub mod config;
pub mod diagnostics;

// Ordering and record model
pub mod ordering;
pub mod record;
pub mod line_scan;

// Sorting paths
pub mod in_memory;
pub mod zero_copy;
pub mod external_sort;
pub mod merge;
pub mod diff;
pub mod core_sort;

// Re-export commonly used types
pub use config::{SortConfig, Strategy};
pub use error::{KeyError, SortError, SortResult};
pub use ordering::ChromOrder;

/// Exit codes
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const SORT_FAILURE: i32 = 2;

/// Counters reported by every sorting path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Data lines read, malformed ones included
    pub records_read: u64,
    pub records_written: u64,
    /// Malformed data lines dropped
    pub skipped: u64,
    pub header_lines: u64,
    /// Shard files written and merged
    pub shards: usize,
    /// Largest accounted chunk held in memory at once
    pub peak_chunk_bytes: usize,
}

impl SortStats {
    /// Add the counters of another run to these
    pub fn absorb(&mut self, other: &SortStats) {
        self.records_read += other.records_read;
        self.records_written += other.records_written;
        self.skipped += other.skipped;
        self.header_lines += other.header_lines;
        self.shards += other.shards;
        self.peak_chunk_bytes = self.peak_chunk_bytes.max(other.peak_chunk_bytes);
    }
}

/// Run the operation selected by `config`; returns the process exit code
pub fn run(config: SortConfig) -> SortResult<i32> {
    config.validate()?;
    core_sort::CoreSort::new(config).run()
}
