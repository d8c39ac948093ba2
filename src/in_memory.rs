//! In-memory sorting of owned records
//!
//! Keys are extracted once on ingestion and the grouping key is interned, so
//! after [`RankTable::finalize`] every comparison is two integer compares,
//! whatever the policy.

use crate::error::KeyError;
use crate::ordering::{ChromOrder, RankTable};
use crate::record::extract;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::io::{self, Write};
use std::mem::size_of;

/// Record count above which the key sort runs on the rayon pool
pub const PARALLEL_THRESHOLD: usize = 10_000;

/// Accounted cost of one record beyond its line bytes
pub const RECORD_OVERHEAD: usize = size_of::<OwnedRecord>() + 16;

/// Estimated resident cost of a record whose line is `line_len` bytes long
#[inline]
pub fn estimate(line_len: usize) -> usize {
    line_len + RECORD_OVERHEAD
}

struct OwnedRecord {
    /// Provisional key id before sorting, ordinal after
    rank: u32,
    position: i64,
    line: Box<[u8]>,
}

/// Collects owned records and sorts them under one ordering policy.
pub struct InMemorySorter {
    table: RankTable<'static>,
    records: Vec<OwnedRecord>,
    bytes: usize,
    parallel: bool,
}

impl InMemorySorter {
    pub fn new(order: ChromOrder) -> Self {
        Self {
            table: RankTable::new(order),
            records: Vec::new(),
            bytes: 0,
            parallel: true,
        }
    }

    /// Allow the rayon pool for large sorts (default on)
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Add one data line (without its newline). A line whose key cannot be
    /// extracted is rejected and not stored.
    pub fn push(&mut self, line: Vec<u8>) -> Result<(), KeyError> {
        let key = extract(&line)?;
        let rank = self.table.intern(key.group);
        let position = key.position;
        self.bytes += estimate(line.len());
        self.records.push(OwnedRecord {
            rank,
            position,
            line: line.into_boxed_slice(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Accounted bytes held by the buffered records
    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }

    /// Sort the buffered records. Equal keys are ordered by their line
    /// bytes, so the result does not depend on insertion order.
    pub fn sort(self) -> SortedRecords {
        let ordinals = self.table.finalize();
        let mut records = self.records;
        for record in &mut records {
            record.rank = ordinals.ordinal(record.rank);
        }

        // Only byte-identical lines compare equal, so unstable is enough.
        if self.parallel && records.len() >= PARALLEL_THRESHOLD {
            records.par_sort_unstable_by(compare_records);
        } else {
            records.sort_unstable_by(compare_records);
        }

        SortedRecords {
            inner: records.into_iter(),
        }
    }
}

fn compare_records(a: &OwnedRecord, b: &OwnedRecord) -> Ordering {
    (a.rank, a.position)
        .cmp(&(b.rank, b.position))
        .then_with(|| a.line.cmp(&b.line))
}

/// Sorted lines, in output order.
pub struct SortedRecords {
    inner: std::vec::IntoIter<OwnedRecord>,
}

impl SortedRecords {
    /// Write every remaining line newline-terminated; returns the line count
    pub fn write_to<W: Write + ?Sized>(self, out: &mut W) -> io::Result<u64> {
        let mut written = 0;
        for line in self {
            out.write_all(&line)?;
            out.write_all(b"\n")?;
            written += 1;
        }
        Ok(written)
    }
}

impl Iterator for SortedRecords {
    type Item = Box<[u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|r| r.line)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SortedRecords {}
