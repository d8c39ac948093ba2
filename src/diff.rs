//! Streaming comparison of two sorted inputs
//!
//! Both inputs feed one two-source [`KWayMerger`]. Records are taken off the
//! merge one run of equal (grouping key, position) at a time; within a run the
//! two sides are compared as multisets of whole lines, so reordering inside a
//! run is not a difference.

use crate::diagnostics::Diagnostics;
use crate::error::SortResult;
use crate::merge::{KWayMerger, MergeSource};
use crate::ordering::ChromOrder;
use itertools::{Either, EitherOrBoth, Itertools};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;

const LEFT: usize = 0;

/// Which input a differing record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSide {
    Left,
    Right,
}

impl DiffSide {
    fn marker(self) -> &'static [u8] {
        match self {
            DiffSide::Left => b"<\t",
            DiffSide::Right => b">\t",
        }
    }
}

/// A record present on one side only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub side: DiffSide,
    pub line: Vec<u8>,
}

impl DiffRecord {
    /// Write as `<\tLINE` or `>\tLINE`
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.side.marker())?;
        out.write_all(&self.line)?;
        out.write_all(b"\n")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub left_only: u64,
    pub right_only: u64,
    pub common: u64,
}

impl DiffStats {
    pub fn is_identical(&self) -> bool {
        self.left_only == 0 && self.right_only == 0
    }
}

/// Lockstep diff of two sorted sources
pub struct SortedDiff<S> {
    merger: KWayMerger<S>,
    pending: VecDeque<DiffRecord>,
    stats: DiffStats,
}

impl<S: MergeSource> SortedDiff<S> {
    pub fn new(left: S, right: S, order: ChromOrder, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            merger: KWayMerger::new(vec![left, right], order, diagnostics),
            pending: VecDeque::new(),
            stats: DiffStats::default(),
        }
    }

    /// Compare the next run of equal keys. Returns `false` once both inputs
    /// are exhausted.
    fn advance(&mut self) -> bool {
        let Some(first) = self.merger.next_entry() else {
            return false;
        };
        let mut run = vec![first];
        while self
            .merger
            .peek()
            .is_some_and(|next| next.same_key(&run[0]))
        {
            match self.merger.next_entry() {
                Some(entry) => run.push(entry),
                None => break,
            }
        }

        let (mut left, mut right): (Vec<Vec<u8>>, Vec<Vec<u8>>) = run
            .into_iter()
            .partition_map(|entry| {
                if entry.source_id() == LEFT {
                    Either::Left(entry.into_line())
                } else {
                    Either::Right(entry.into_line())
                }
            });
        left.sort_unstable();
        right.sort_unstable();

        for pair in left.into_iter().merge_join_by(right, |a, b| a.cmp(b)) {
            match pair {
                EitherOrBoth::Both(..) => self.stats.common += 1,
                EitherOrBoth::Left(line) => {
                    self.stats.left_only += 1;
                    self.pending.push_back(DiffRecord {
                        side: DiffSide::Left,
                        line,
                    });
                }
                EitherOrBoth::Right(line) => {
                    self.stats.right_only += 1;
                    self.pending.push_back(DiffRecord {
                        side: DiffSide::Right,
                        line,
                    });
                }
            }
        }
        true
    }

    pub fn stats(&self) -> DiffStats {
        self.stats
    }

    /// Write every difference to `out`
    pub fn write_to<W: Write + ?Sized>(mut self, out: &mut W) -> SortResult<DiffStats> {
        for record in self.by_ref() {
            record.write_to(out)?;
        }
        Ok(self.stats)
    }
}

impl<S: MergeSource> Iterator for SortedDiff<S> {
    type Item = DiffRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            if !self.advance() {
                return None;
            }
        }
    }
}
