//! Zero-copy sorting of a memory-mapped file
//!
//! The file is scanned once. Each data line becomes a [`CompactSortKey`] that
//! refers to its bytes by offset and length; the key array is sorted and the
//! original byte ranges are streamed out. No line is ever copied or reparsed.

use crate::diagnostics::Diagnostics;
use crate::error::{SortContext, SortError, SortResult};
use crate::in_memory::PARALLEL_THRESHOLD;
use crate::line_scan::{line_spans, LineScan};
use crate::ordering::{ChromOrder, RankTable};
use crate::record::{extract, is_comment, HeaderBlock, DEFAULT_COMMENT_MARKER};
use crate::SortStats;
use log::debug;
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Size of the output blocks handed to the writer
pub const OUTPUT_BLOCK_SIZE: usize = 256 * 1024;

/// Read-only view of a whole input file
pub struct MappedFile {
    mmap: Option<Mmap>,
}

impl MappedFile {
    /// Map `path` read-only. Empty files are not mapped at all.
    pub fn open(path: &Path) -> SortResult<Self> {
        let name = path.display().to_string();
        let file = File::open(path).with_file_context(&name)?;
        let metadata = file.metadata().with_file_context(&name)?;
        if metadata.is_dir() {
            return Err(SortError::is_directory(&name));
        }
        // A pipe reports length zero and would silently map as empty.
        if !metadata.is_file() {
            return Err(SortError::not_regular_file(&name));
        }
        let len = metadata.len();
        if len == 0 {
            return Ok(Self { mmap: None });
        }

        // SAFETY: the mapping is read-only and lives as long as `self`; the
        // input must not be truncated by another process while it is sorted.
        let mmap = unsafe { Mmap::map(&file) }.with_file_context(&name)?;
        #[cfg(unix)]
        {
            // Advisory only.
            let _ = mmap.advise(memmap2::Advice::Sequential);
        }
        Ok(Self { mmap: Some(mmap) })
    }

    pub fn bytes(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

/// Fixed-size key of one data line, pointing into the mapping by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactSortKey {
    /// Interned key id during the scan, ordinal once sorted
    pub rank: u32,
    pub len: u32,
    pub position: i64,
    pub offset: u64,
}

impl CompactSortKey {
    #[inline]
    fn range(&self) -> std::ops::Range<usize> {
        let start = self.offset as usize;
        start..start + self.len as usize
    }
}

/// Sorter for a single seekable file
#[derive(Clone)]
pub struct MappedFileSorter {
    order: ChromOrder,
    scan: LineScan,
    comment: u8,
    parallel: bool,
    diagnostics: Arc<Diagnostics>,
}

impl MappedFileSorter {
    pub fn new(order: ChromOrder, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            order,
            scan: LineScan::default(),
            comment: DEFAULT_COMMENT_MARKER,
            parallel: true,
            diagnostics,
        }
    }

    pub fn with_scan(mut self, scan: LineScan) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_comment_marker(mut self, comment: u8) -> Self {
        self.comment = comment;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sort the file at `path`, writing header then records to `out`.
    pub fn sort_file<W: Write>(&self, path: &Path, out: W) -> SortResult<SortStats> {
        let mapped = MappedFile::open(path)?;
        let name = path.display().to_string();
        let view = self.sort_bytes(mapped.bytes(), &name)?;

        let mut out = BufWriter::with_capacity(OUTPUT_BLOCK_SIZE, out);
        view.write_header(&mut out)?;
        view.write_records(&mut out)?;
        out.flush()?;
        Ok(view.stats())
    }

    /// Scan and sort already-mapped bytes. `origin` names the input in
    /// warnings.
    pub fn sort_bytes<'m>(&self, data: &'m [u8], origin: &str) -> SortResult<SortedView<'m>> {
        let mut table = RankTable::new(self.order);
        let mut header = Vec::new();
        let mut keys = Vec::new();
        let mut skipped = 0u64;
        let mut in_header = true;

        for (line_no, (start, end)) in line_spans(data, self.scan).enumerate() {
            let line = &data[start..end];
            if line.is_empty() {
                continue;
            }
            if in_header {
                if is_comment(line, self.comment) {
                    header.push((start, end));
                    continue;
                }
                in_header = false;
            }

            match extract(line) {
                Ok(key) => {
                    let len = u32::try_from(line.len()).map_err(|_| {
                        SortError::parse_error(&format!(
                            "{origin}:{}: line longer than {} bytes",
                            line_no + 1,
                            u32::MAX
                        ))
                    })?;
                    keys.push(CompactSortKey {
                        rank: table.intern_borrowed(key.group),
                        len,
                        position: key.position,
                        offset: start as u64,
                    });
                }
                Err(reason) => {
                    skipped += 1;
                    self.diagnostics
                        .skip_record(origin, line_no as u64 + 1, reason);
                }
            }
        }

        let distinct = table.len();
        let ordinals = table.finalize();
        for key in &mut keys {
            key.rank = ordinals.ordinal(key.rank);
        }
        // Equal keys fall back to the line bytes, as in the in-memory path.
        let compare = |a: &CompactSortKey, b: &CompactSortKey| {
            (a.rank, a.position)
                .cmp(&(b.rank, b.position))
                .then_with(|| data[a.range()].cmp(&data[b.range()]))
        };
        if self.parallel && keys.len() >= PARALLEL_THRESHOLD {
            keys.par_sort_unstable_by(compare);
        } else {
            keys.sort_unstable_by(compare);
        }
        debug!(
            "{origin}: {} records, {distinct} distinct keys, {} header lines",
            keys.len(),
            header.len()
        );

        Ok(SortedView {
            data,
            header,
            keys,
            skipped,
        })
    }
}

/// Sorted key array borrowing the mapped bytes.
pub struct SortedView<'m> {
    data: &'m [u8],
    header: Vec<(usize, usize)>,
    keys: Vec<CompactSortKey>,
    skipped: u64,
}

impl<'m> SortedView<'m> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[CompactSortKey] {
        &self.keys
    }

    /// Header lines as an owned block
    pub fn header_block(&self) -> HeaderBlock {
        let mut block = HeaderBlock::new();
        for &(start, end) in &self.header {
            block.push(self.data[start..end].to_vec());
        }
        block
    }

    /// Record lines in sorted order
    pub fn lines(&self) -> impl Iterator<Item = &'m [u8]> + '_ {
        let data = self.data;
        self.keys.iter().map(move |key| &data[key.range()])
    }

    pub fn write_header<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        for &(start, end) in &self.header {
            out.write_all(&self.data[start..end])?;
            out.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Write the records in sorted order; returns the count written
    pub fn write_records<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<u64> {
        for key in &self.keys {
            out.write_all(&self.data[key.range()])?;
            out.write_all(b"\n")?;
        }
        Ok(self.keys.len() as u64)
    }

    pub fn stats(&self) -> SortStats {
        SortStats {
            records_read: self.keys.len() as u64 + self.skipped,
            records_written: self.keys.len() as u64,
            skipped: self.skipped,
            header_lines: self.header.len() as u64,
            ..SortStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyError;
    use std::fs;
    use tempfile::TempDir;

    fn sorter(order: ChromOrder) -> (MappedFileSorter, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::default());
        (MappedFileSorter::new(order, Arc::clone(&diagnostics)), diagnostics)
    }

    fn sort_text(order: ChromOrder, text: &str) -> String {
        let (sorter, _) = sorter(order);
        let view = sorter.sort_bytes(text.as_bytes(), "test").unwrap();
        let mut out = Vec::new();
        view.write_header(&mut out).unwrap();
        view.write_records(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_sort_file_with_header() -> SortResult<()> {
        let dir = TempDir::new()?;
        let input = dir.path().join("in.vcf");
        fs::write(
            &input,
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\nchr2\t10\ta\nchr1\t30\tb\nchr1\t20\tc\n",
        )?;

        let (sorter, _) = sorter(ChromOrder::Natural);
        let mut out = Vec::new();
        let stats = sorter.sort_file(&input, &mut out)?;

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\nchr1\t20\tc\nchr1\t30\tb\nchr2\t10\ta\n"
        );
        assert_eq!(stats.header_lines, 2);
        assert_eq!(stats.records_written, 3);
        Ok(())
    }

    #[test]
    fn test_malformed_line_dropped_with_warning() {
        let (sorter, diagnostics) = sorter(ChromOrder::Lexicographic);
        let view = sorter
            .sort_bytes(b"b\t2\nonlyonefield\na\t1\n", "in.vcf")
            .unwrap();
        let mut out = Vec::new();
        view.write_records(&mut out).unwrap();

        assert_eq!(out, b"a\t1\nb\t2\n");
        assert_eq!(view.stats().skipped, 1);
        assert_eq!(diagnostics.skipped_for(KeyError::MissingFields), 1);
    }

    #[test]
    fn test_output_bytes_are_source_bytes() {
        // CRLF, extra columns and the missing final newline all survive.
        assert_eq!(
            sort_text(ChromOrder::Lexicographic, "2\t1\tx y  z\r\n1\t7\r\n1\t3\tq"),
            "1\t3\tq\n1\t7\r\n2\t1\tx y  z\r\n"
        );
    }

    #[test]
    fn test_blank_lines_and_late_comments() {
        assert_eq!(
            sort_text(ChromOrder::Lexicographic, "#h\n\n2\t1\n\n#z\t5\n1\t1\n"),
            "#h\n#z\t5\n1\t1\n2\t1\n"
        );
    }

    #[test]
    fn test_empty_file() -> SortResult<()> {
        let dir = TempDir::new()?;
        let input = dir.path().join("empty.vcf");
        fs::write(&input, "")?;
        let (sorter, _) = sorter(ChromOrder::Natural);
        let mut out = Vec::new();
        let stats = sorter.sort_file(&input, &mut out)?;
        assert!(out.is_empty());
        assert_eq!(stats.records_read, 0);
        Ok(())
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let (sorter, _) = sorter(ChromOrder::Natural);
        let err = sorter
            .sort_file(Path::new("/nonexistent/in.vcf"), io::sink())
            .unwrap_err();
        assert!(matches!(err, SortError::FileNotFound { .. }));
    }

    #[test]
    fn test_directory_is_not_mapped() -> SortResult<()> {
        let dir = TempDir::new()?;
        let err = MappedFile::open(dir.path()).err();
        assert!(matches!(err, Some(SortError::IsDirectory { .. })));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_fifo_is_rejected_instead_of_mapped_empty() -> SortResult<()> {
        let dir = TempDir::new()?;
        let fifo = dir.path().join("in.fifo");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status()?;
        assert!(status.success());

        // Opening a FIFO for reading blocks until a writer shows up.
        let writer = {
            let fifo = fifo.clone();
            std::thread::spawn(move || fs::write(fifo, "1\t1\n"))
        };
        let err = MappedFile::open(&fifo).err();
        writer.join().unwrap().ok();
        assert!(matches!(err, Some(SortError::NotRegularFile { .. })));
        Ok(())
    }

    #[test]
    fn test_scalar_scan_matches_vectorized() {
        let text = "#h\nchr1\t5\nchrX\t1\n10\t2\n\nchr1_alt\t5\n1\t9";
        let (fast, _) = sorter(ChromOrder::Natural);
        let slow = fast.clone().with_scan(LineScan::Scalar);
        let a = fast.sort_bytes(text.as_bytes(), "t").unwrap();
        let b = slow.sort_bytes(text.as_bytes(), "t").unwrap();
        assert_eq!(a.keys(), b.keys());
    }

    #[test]
    fn test_equal_keys_do_not_depend_on_file_order() {
        let forward = sort_text(ChromOrder::Natural, "1\t23\tid171\n1\t5\tx\n1\t23\tid488\n");
        let backward = sort_text(ChromOrder::Natural, "1\t23\tid488\n1\t5\tx\n1\t23\tid171\n");
        assert_eq!(forward, "1\t5\tx\n1\t23\tid171\n1\t23\tid488\n");
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_custom_comment_marker() {
        let (sorter, _) = sorter(ChromOrder::Lexicographic);
        let sorter = sorter.with_comment_marker(b'@');
        let view = sorter.sort_bytes(b"@meta\n2\t1\n1\t1\n", "t").unwrap();
        assert_eq!(view.header_block().len(), 1);
        assert_eq!(view.len(), 2);
    }
}
