//! Chunked external sorting for inputs larger than the memory budget
//!
//! Records accumulate in an [`InMemorySorter`] until the accounted size meets
//! the budget; the chunk is then sorted and spilled to a shard file. The
//! shards are finally merged by [`KWayMerger`]. Every shard deletes its file
//! when dropped and the session directory goes with the [`TempDir`], so
//! nothing survives the call on success or failure.

use crate::diagnostics::Diagnostics;
use crate::error::{SortContext, SortError, SortResult};
use crate::in_memory::InMemorySorter;
use crate::merge::KWayMerger;
use crate::ordering::ChromOrder;
use crate::record::{first_header, HeaderBlock, RecordReader};
use crate::SortStats;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const SHARD_BUFFER_SIZE: usize = 256 * 1024;

/// Reader over one shard file
pub type ShardReader = RecordReader<BufReader<File>>;

/// One sorted run on disk. The file is removed when the guard drops.
#[derive(Debug)]
pub struct Shard {
    path: PathBuf,
    records: u64,
}

impl Shard {
    /// Create the shard file at `path` and write `lines` to it
    pub fn write<I, L>(path: PathBuf, lines: I) -> SortResult<Shard>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        let file = File::create(&path)
            .map_err(|e| SortError::temp_file(path.parent().unwrap_or(path.as_path()), e))?;
        // From here on the guard owns the file, partial or not.
        let mut shard = Shard { path, records: 0 };
        let mut out = BufWriter::with_capacity(SHARD_BUFFER_SIZE, file);
        for line in lines {
            out.write_all(line.as_ref())
                .and_then(|_| out.write_all(b"\n"))
                .with_context(|| format!("writing shard {}", shard.path.display()))?;
            shard.records += 1;
        }
        out.flush()
            .with_context(|| format!("writing shard {}", shard.path.display()))?;
        Ok(shard)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    /// Open the shard for merging
    pub fn open(&self) -> SortResult<ShardReader> {
        let name = self.path.display().to_string();
        let file = File::open(&self.path).with_file_context(&name)?;
        Ok(RecordReader::new(
            BufReader::with_capacity(SHARD_BUFFER_SIZE, file),
            name,
            0,
        ))
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Spill session of one external sort
pub struct ExternalSort {
    order: ChromOrder,
    budget: usize,
    parallel: bool,
    diagnostics: Arc<Diagnostics>,
    chunk: InMemorySorter,
    shards: Vec<Shard>,
    stats: SortStats,
    // Declared last: shards are removed before their directory.
    dir: TempDir,
}

impl ExternalSort {
    /// Start a session with its own directory under `temp_dir` (system
    /// temporary directory when `None`).
    pub fn new(
        order: ChromOrder,
        budget_bytes: usize,
        temp_dir: Option<&Path>,
        diagnostics: Arc<Diagnostics>,
    ) -> SortResult<Self> {
        let dir = session_dir(temp_dir)?;
        debug!("spilling to {}", dir.path().display());

        Ok(Self {
            order,
            budget: budget_bytes.max(1),
            parallel: true,
            diagnostics,
            chunk: InMemorySorter::new(order),
            shards: Vec::new(),
            stats: SortStats::default(),
            dir,
        })
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self.chunk = InMemorySorter::new(self.order).with_parallel(parallel);
        self
    }

    /// Add one data line; `origin` and `line_no` locate it in warnings.
    pub fn push(&mut self, line: Vec<u8>, origin: &str, line_no: u64) -> SortResult<()> {
        self.stats.records_read += 1;
        if let Err(reason) = self.chunk.push(line) {
            self.stats.skipped += 1;
            self.diagnostics.skip_record(origin, line_no, reason);
            return Ok(());
        }
        if self.chunk.estimated_bytes() >= self.budget {
            let chunk = std::mem::replace(
                &mut self.chunk,
                InMemorySorter::new(self.order).with_parallel(self.parallel),
            );
            self.spill(chunk)?;
        }
        Ok(())
    }

    /// Read every remaining data line of `reader`
    pub fn consume<R: BufRead>(&mut self, reader: &mut RecordReader<R>) -> SortResult<()> {
        let mut buf = Vec::new();
        while reader
            .next_line(&mut buf)
            .with_file_context(reader.name())?
        {
            let line_no = reader.line_no();
            let line = std::mem::take(&mut buf);
            self.push(line, reader.name(), line_no)?;
        }
        Ok(())
    }

    /// Sort `chunk` and write it as the next shard. Records already counted
    /// by the caller are not counted again.
    pub fn spill(&mut self, chunk: InMemorySorter) -> SortResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.stats.peak_chunk_bytes = self.stats.peak_chunk_bytes.max(chunk.estimated_bytes());
        let path = self.shard_path(self.shards.len());
        let shard = Shard::write(path, chunk.sort())?;
        debug!(
            "spilled shard {} with {} records",
            self.shards.len(),
            shard.records()
        );
        self.shards.push(shard);
        Ok(())
    }

    /// Account for records read by the caller before handing over a chunk
    pub fn count_read(&mut self, records: u64, skipped: u64) {
        self.stats.records_read += records;
        self.stats.skipped += skipped;
    }

    fn shard_path(&self, index: usize) -> PathBuf {
        self.dir
            .path()
            .join(format!("shard-{}-{index:06}", std::process::id()))
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.shards.iter().map(|s| s.path.clone()).collect()
    }

    /// Spill the final partial chunk and open every shard for the merge
    pub fn finish(mut self) -> SortResult<ShardMerge> {
        let chunk = std::mem::replace(&mut self.chunk, InMemorySorter::new(self.order));
        self.spill(chunk)?;

        let readers = self
            .shards
            .iter()
            .map(Shard::open)
            .collect::<SortResult<Vec<_>>>()?;
        self.stats.shards = self.shards.len();
        info!(
            "external sort: {} records in {} shards",
            self.stats.records_read - self.stats.skipped,
            self.stats.shards
        );

        Ok(ShardMerge {
            merger: KWayMerger::new(readers, self.order, Arc::clone(&self.diagnostics)),
            stats: self.stats,
            shards: std::mem::take(&mut self.shards),
            _dir: self.dir,
        })
    }
}

/// Create a private working directory under `temp_dir`, or under the system
/// temporary directory when `None`.
pub fn session_dir(temp_dir: Option<&Path>) -> SortResult<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("vcfx-sort-");
    match temp_dir {
        Some(path) => builder
            .tempdir_in(path)
            .map_err(|e| SortError::temp_file(path, e)),
        None => builder
            .tempdir()
            .map_err(|e| SortError::temp_file(&std::env::temp_dir(), e)),
    }
}

/// Read `readers` to their end, one after the other, through a fresh
/// session. Returns the first non-empty header block and the merge handle.
pub fn run<R: BufRead>(
    readers: &mut [RecordReader<R>],
    order: ChromOrder,
    budget_bytes: usize,
    temp_dir: Option<&Path>,
    diagnostics: Arc<Diagnostics>,
) -> SortResult<(HeaderBlock, ShardMerge)> {
    let header = first_header(readers)?;
    let mut session = ExternalSort::new(order, budget_bytes, temp_dir, diagnostics)?;
    for reader in readers.iter_mut() {
        session.consume(reader)?;
    }
    let mut merge = session.finish()?;
    merge.stats.header_lines = header.len() as u64;
    Ok((header, merge))
}

/// Pending merge of a finished session's shards. Dropping it removes them.
pub struct ShardMerge {
    merger: KWayMerger<ShardReader>,
    stats: SortStats,
    shards: Vec<Shard>,
    _dir: TempDir,
}

impl ShardMerge {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Merge every shard into `out` and delete them
    pub fn merge_into<W: Write + ?Sized>(self, out: &mut W) -> SortResult<SortStats> {
        let ShardMerge {
            merger,
            mut stats,
            shards,
            _dir,
        } = self;
        let merged = merger.merge_into(out)?;
        drop(shards);

        stats.records_written = merged.records;
        stats.skipped += merged.skipped;
        if merged.failed_sources > 0 {
            return Err(SortError::internal(&format!(
                "{} shard(s) could not be read back",
                merged.failed_sources
            )));
        }
        Ok(stats)
    }
}
