//! Streaming k-way merge of sorted record sources
//!
//! One buffered record per source lives in a binary min-heap. The heap is
//! ordered by the policy's rank, then the grouping key bytes, then position,
//! then the whole line, then source index. This is the order the sorters
//! produce, so merging their runs gives the bytes a single sort would.

use crate::diagnostics::Diagnostics;
use crate::error::SortResult;
use crate::ordering::{ChromOrder, GroupRank};
use crate::record::{extract, RecordReader};
use log::{debug, warn};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// A sorted stream of data lines.
pub trait MergeSource {
    /// Read the next line, without its newline, into `buf`. `Ok(false)` at
    /// end of input.
    fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool>;

    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Number of the line most recently read
    fn line_no(&self) -> u64;
}

impl<R: BufRead> MergeSource for RecordReader<R> {
    fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        RecordReader::next_line(self, buf)
    }

    fn name(&self) -> &str {
        RecordReader::name(self)
    }

    fn line_no(&self) -> u64 {
        RecordReader::line_no(self)
    }
}

impl<S: MergeSource + ?Sized> MergeSource for Box<S> {
    fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        (**self).next_line(buf)
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn line_no(&self) -> u64 {
        (**self).line_no()
    }
}

/// Head record of one source.
#[derive(Debug)]
pub struct MergeEntry {
    rank: GroupRank,
    key_len: usize,
    position: i64,
    line: Vec<u8>,
    source_id: usize,
}

impl MergeEntry {
    pub fn group(&self) -> &[u8] {
        &self.line[..self.key_len]
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn line(&self) -> &[u8] {
        &self.line
    }

    pub fn into_line(self) -> Vec<u8> {
        self.line
    }

    /// Index of the source this record came from
    pub fn source_id(&self) -> usize {
        self.source_id
    }

    /// Same grouping key and position, whatever the source
    pub fn same_key(&self, other: &MergeEntry) -> bool {
        self.rank == other.rank && self.position == other.position && self.group() == other.group()
    }
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.group().cmp(other.group()))
            .then(self.position.cmp(&other.position))
            .then_with(|| self.line.cmp(&other.line))
            .then(self.source_id.cmp(&other.source_id))
    }
}

/// Counters of one merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub records: u64,
    pub skipped: u64,
    pub failed_sources: usize,
}

/// Min-heap merge over `N` sources with `O(N)` buffered records.
pub struct KWayMerger<S> {
    order: ChromOrder,
    sources: Vec<Option<S>>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
    diagnostics: Arc<Diagnostics>,
    stats: MergeStats,
}

impl<S: MergeSource> KWayMerger<S> {
    /// Prime the heap with the first valid record of every source. The
    /// sources are trusted to be sorted under `order`.
    pub fn new(sources: Vec<S>, order: ChromOrder, diagnostics: Arc<Diagnostics>) -> Self {
        let count = sources.len();
        let mut merger = Self {
            order,
            sources: sources.into_iter().map(Some).collect(),
            heap: BinaryHeap::with_capacity(count),
            diagnostics,
            stats: MergeStats::default(),
        };
        for source_id in 0..count {
            merger.pull(source_id, Vec::new());
        }
        debug!("merging {count} sources");
        merger
    }

    /// Refill the heap from `source_id`, reusing `buf`. Bad lines are
    /// skipped; a read error closes the source.
    fn pull(&mut self, source_id: usize, mut buf: Vec<u8>) {
        loop {
            let Some(source) = self.sources[source_id].as_mut() else {
                return;
            };
            match source.next_line(&mut buf) {
                Ok(true) => {}
                Ok(false) => {
                    self.sources[source_id] = None;
                    return;
                }
                Err(err) => {
                    warn!(
                        "{}: read failed after line {}, remaining records are lost: {err}",
                        source.name(),
                        source.line_no()
                    );
                    self.stats.failed_sources += 1;
                    self.sources[source_id] = None;
                    return;
                }
            }

            let parsed = extract(&buf)
                .map(|key| (self.order.rank(key.group), key.group.len(), key.position));
            match parsed {
                Ok((rank, key_len, position)) => {
                    self.heap.push(Reverse(MergeEntry {
                        rank,
                        key_len,
                        position,
                        line: buf,
                        source_id,
                    }));
                    return;
                }
                Err(reason) => {
                    self.stats.skipped += 1;
                    self.diagnostics
                        .skip_record(source.name(), source.line_no(), reason);
                }
            }
        }
    }

    /// Smallest buffered record, without consuming it
    pub fn peek(&self) -> Option<&MergeEntry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    /// Remove and return the smallest record
    pub fn next_entry(&mut self) -> Option<MergeEntry> {
        let Reverse(entry) = self.heap.pop()?;
        self.stats.records += 1;
        self.pull(entry.source_id, Vec::new());
        Some(entry)
    }

    /// Sources that still have buffered or unread records
    pub fn active_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }

    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Drain the merge into `out`, one newline-terminated line per record.
    pub fn merge_into<W: Write + ?Sized>(mut self, out: &mut W) -> SortResult<MergeStats> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            out.write_all(&entry.line)?;
            out.write_all(b"\n")?;
            self.stats.records += 1;
            let MergeEntry {
                line, source_id, ..
            } = entry;
            self.pull(source_id, line);
        }
        Ok(self.stats)
    }
}

impl<S: MergeSource> Iterator for KWayMerger<S> {
    type Item = MergeEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyError;
    use crate::in_memory::InMemorySorter;
    use proptest::prelude::*;
    use std::io::Cursor;

    fn reader(name: &str, text: &str) -> RecordReader<Cursor<Vec<u8>>> {
        RecordReader::new(Cursor::new(text.as_bytes().to_vec()), name, b'#')
    }

    fn full_sort(order: ChromOrder, text: &str) -> Vec<u8> {
        let mut sorter = InMemorySorter::new(order);
        for line in text.lines() {
            sorter.push(line.as_bytes().to_vec()).unwrap();
        }
        let mut out = Vec::new();
        sorter.sort().write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn test_merge_three_shards_matches_full_sort() {
        let shards = [
            "1\t5\ta\nchr1\t5\tb\nchrX\t1\tc\n",
            "2\t7\td\n",
            "1\t1\te\n10\t3\tf\nchr2\t9\tg\nchrM\t4\th\n",
        ];
        let sources: Vec<_> = shards
            .iter()
            .enumerate()
            .map(|(i, s)| reader(&format!("shard{i}"), s))
            .collect();
        let merger = KWayMerger::new(
            sources,
            ChromOrder::Natural,
            Arc::new(Diagnostics::default()),
        );
        let mut out = Vec::new();
        let stats = merger.merge_into(&mut out).unwrap();

        assert_eq!(stats.records, 8);
        assert_eq!(out, full_sort(ChromOrder::Natural, &shards.concat()));
    }

    #[test]
    fn test_bad_line_does_not_close_source() {
        let diagnostics = Arc::new(Diagnostics::default());
        let merger = KWayMerger::new(
            vec![reader("a", "1\t1\nbroken\n1\t3\n"), reader("b", "1\t2\n")],
            ChromOrder::Lexicographic,
            Arc::clone(&diagnostics),
        );
        let lines: Vec<Vec<u8>> = merger.map(MergeEntry::into_line).collect();
        assert_eq!(lines, vec![b"1\t1".to_vec(), b"1\t2".to_vec(), b"1\t3".to_vec()]);
        assert_eq!(diagnostics.skipped_for(KeyError::MissingFields), 1);
    }

    struct FailingSource {
        lines: Vec<&'static str>,
        read: usize,
    }

    impl MergeSource for FailingSource {
        fn next_line(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
            match self.lines.get(self.read) {
                Some(line) => {
                    self.read += 1;
                    buf.clear();
                    buf.extend_from_slice(line.as_bytes());
                    Ok(true)
                }
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "device gone")),
            }
        }

        fn name(&self) -> &str {
            "failing"
        }

        fn line_no(&self) -> u64 {
            self.read as u64
        }
    }

    #[test]
    fn test_failed_source_keeps_others() {
        let sources: Vec<Box<dyn MergeSource>> = vec![
            Box::new(FailingSource {
                lines: vec!["1\t2"],
                read: 0,
            }),
            Box::new(reader("ok", "1\t1\n1\t3\n2\t1\n")),
        ];
        let merger = KWayMerger::new(
            sources,
            ChromOrder::Lexicographic,
            Arc::new(Diagnostics::default()),
        );
        let mut out = Vec::new();
        let stats = merger.merge_into(&mut out).unwrap();
        assert_eq!(out, b"1\t1\n1\t2\n1\t3\n2\t1\n");
        assert_eq!(stats.failed_sources, 1);
        assert_eq!(stats.records, 4);
    }

    #[test]
    fn test_equal_keys_ordered_by_line_then_source() {
        let merger = KWayMerger::new(
            vec![
                reader("a", "1\t1\tsame\n1\t1\tzz\n"),
                reader("b", "1\t1\tmm\n1\t1\tsame\n"),
            ],
            ChromOrder::Natural,
            Arc::new(Diagnostics::default()),
        );
        let order: Vec<(usize, Vec<u8>)> = merger.map(|e| (e.source_id(), e.into_line())).collect();
        assert_eq!(
            order,
            vec![
                (1, b"1\t1\tmm".to_vec()),
                (0, b"1\t1\tsame".to_vec()),
                (1, b"1\t1\tsame".to_vec()),
                (0, b"1\t1\tzz".to_vec()),
            ]
        );
    }

    #[test]
    fn test_empty_and_single_source() {
        let merger: KWayMerger<RecordReader<Cursor<Vec<u8>>>> = KWayMerger::new(
            Vec::new(),
            ChromOrder::Natural,
            Arc::new(Diagnostics::default()),
        );
        assert!(merger.peek().is_none());

        let mut merger = KWayMerger::new(
            vec![reader("only", "X\t2\nY\t1\n")],
            ChromOrder::Natural,
            Arc::new(Diagnostics::default()),
        );
        assert_eq!(merger.active_sources(), 1);
        assert_eq!(merger.peek().map(|e| e.position()), Some(2));
        let first = merger.next_entry().map(MergeEntry::into_line);
        assert_eq!(first, Some(b"X\t2".to_vec()));
        assert_eq!(merger.stats().records, 1);
    }

    fn record_strategy() -> impl Strategy<Value = String> {
        ("(chr)?(1|2|10|X|M|Un_a)", 0u32..50, "[a-z]{0,3}")
            .prop_map(|(g, p, tail)| format!("{g}\t{p}\t{tail}"))
    }

    proptest! {
        #[test]
        fn prop_merge_equals_sort_of_concatenation(
            shards in prop::collection::vec(prop::collection::vec(record_strategy(), 0..12), 1..6),
            natural in any::<bool>(),
        ) {
            let order = if natural { ChromOrder::Natural } else { ChromOrder::Lexicographic };
            let sorted_shards: Vec<String> = shards
                .iter()
                .map(|shard| String::from_utf8(full_sort(order, &shard.join("\n"))).unwrap())
                .collect();
            let sources: Vec<_> = sorted_shards.iter().map(|s| reader("p", s)).collect();
            let mut out = Vec::new();
            KWayMerger::new(sources, order, Arc::new(Diagnostics::default()))
                .merge_into(&mut out)
                .unwrap();
            prop_assert_eq!(out, full_sort(order, &sorted_shards.concat()));
        }
    }
}
