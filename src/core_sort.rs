//! Driver: picks a sorting path and runs sort, merge, check or diff
//!
//! Every path writes the header block first, then the data lines. Paths are
//! interchangeable: for the same input and policy they produce the same bytes.

use crate::config::{SortConfig, Strategy};
use crate::diagnostics::Diagnostics;
use crate::diff::{DiffStats, SortedDiff};
use crate::error::{SortContext, SortError, SortResult};
use crate::external_sort::{self, session_dir, ExternalSort, Shard};
use crate::in_memory::InMemorySorter;
use crate::merge::KWayMerger;
use crate::record::{extract, first_header, HeaderBlock, RecordReader};
use crate::zero_copy::{MappedFile, MappedFileSorter};
use crate::{SortStats, EXIT_FAILURE, EXIT_SUCCESS};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

const READ_BUFFER_SIZE: usize = 256 * 1024;
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Input reader over a file or stdin
pub type InputReader = RecordReader<Box<dyn BufRead>>;

type WorkerResult = SortResult<(HeaderBlock, Shard, SortStats)>;

/// Result of a check run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Sorted,
    /// First record that sorts before its predecessor
    Disorder { origin: String, line: u64 },
}

/// Core sort driver
pub struct CoreSort {
    config: SortConfig,
    diagnostics: Arc<Diagnostics>,
}

impl CoreSort {
    pub fn new(config: SortConfig) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(config.warning_limit));
        Self {
            config,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Run the configured operation on a pool of `parallel_threads` threads
    /// and return the exit code.
    pub fn run(&self) -> SortResult<i32> {
        self.thread_pool()?.install(|| self.dispatch())
    }

    fn thread_pool(&self) -> SortResult<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.config.effective_thread_count())
            .build()
            .map_err(|e| SortError::thread_pool_error(&e.to_string()))
    }

    fn dispatch(&self) -> SortResult<i32> {
        if self.config.check {
            return match self.check()? {
                CheckOutcome::Sorted => Ok(EXIT_SUCCESS),
                CheckOutcome::Disorder { origin, line } => {
                    eprintln!("vcfx-sort: {origin}:{line}: disorder");
                    Ok(EXIT_FAILURE)
                }
            };
        }
        if self.config.diff {
            let stats = self.diff()?;
            return Ok(if stats.is_identical() {
                EXIT_SUCCESS
            } else {
                EXIT_FAILURE
            });
        }
        if self.config.merge {
            self.merge()?;
        } else {
            self.sort()?;
        }
        Ok(EXIT_SUCCESS)
    }

    /// Sort the inputs into the configured output
    pub fn sort(&self) -> SortResult<SortStats> {
        let files = &self.config.input_files;
        let strategy = self.config.strategy;

        // Inputs are inspected before the output is created, so a bad input
        // never truncates an existing output file.
        let unmappable = self.first_unmappable_input()?;
        let mapped = match (strategy, unmappable) {
            (Strategy::Mmap, Some(name)) => return Err(SortError::not_regular_file(name)),
            (Strategy::Mmap | Strategy::Auto, None) => true,
            _ => false,
        };
        let readers = if mapped {
            Vec::new()
        } else {
            self.open_inputs()?
        };
        let mut sink = self.open_output()?;

        let stats = if !mapped {
            debug!("sorting {} stream(s) ({strategy})", readers.len());
            self.sort_streams(readers, sink.writer())?
        } else if files.len() == 1 {
            debug!("sorting {} through a mapping", files[0]);
            self.mapped_sorter()
                .sort_file(Path::new(&files[0]), sink.writer())?
        } else {
            self.sort_multiple_files(files, sink.writer())?
        };

        sink.finish()?;
        self.diagnostics.summarize();
        info!(
            "sorted {} records ({} skipped, {} header lines, {} shards)",
            stats.records_written, stats.skipped, stats.header_lines, stats.shards
        );
        Ok(stats)
    }

    /// First input that cannot go through a mapping: stdin, a pipe or a
    /// device. Missing, unreadable and directory inputs fail here.
    fn first_unmappable_input(&self) -> SortResult<Option<&str>> {
        if self.config.reading_from_stdin() {
            return Ok(Some("-"));
        }
        let mut unmappable = None;
        for name in &self.config.input_files {
            if name == "-" {
                unmappable = unmappable.or(Some(name.as_str()));
                continue;
            }
            let metadata = fs::metadata(name).with_file_context(name)?;
            if metadata.is_dir() {
                return Err(SortError::is_directory(name));
            }
            if metadata.is_file() {
                File::open(name).with_file_context(name)?;
            } else if unmappable.is_none() {
                debug!("{name} is not a regular file, reading it as a stream");
                unmappable = Some(name.as_str());
            }
        }
        Ok(unmappable)
    }

    fn mapped_sorter(&self) -> MappedFileSorter {
        MappedFileSorter::new(self.config.order, Arc::clone(&self.diagnostics))
            .with_scan(self.config.scan)
            .with_comment_marker(self.config.comment_marker)
            .with_parallel(self.parallel())
    }

    fn parallel(&self) -> bool {
        self.config.effective_thread_count() > 1
    }

    fn temp_dir(&self) -> Option<&Path> {
        self.config.temp_dir.as_deref().map(Path::new)
    }

    /// Sort the concatenation of `readers`. Stays in memory unless the budget
    /// is exceeded under `auto` or the strategy forces shards.
    fn sort_streams(&self, mut readers: Vec<InputReader>, out: &mut dyn Write) -> SortResult<SortStats> {
        let order = self.config.order;
        let strategy = self.config.strategy;
        let budget = self.config.memory_budget_bytes();

        if strategy == Strategy::External {
            let (header, merge) = external_sort::run(
                &mut readers,
                order,
                budget,
                self.temp_dir(),
                Arc::clone(&self.diagnostics),
            )?;
            header.write_to(out)?;
            let stats = merge.merge_into(out)?;
            out.flush()?;
            return Ok(stats);
        }

        let header = first_header(&mut readers)?;
        header.write_to(out)?;

        let mut stats = SortStats::default();
        let mut chunk = InMemorySorter::new(order).with_parallel(self.parallel());
        let mut session: Option<ExternalSort> = None;

        let mut buf = Vec::new();
        for reader in &mut readers {
            while reader.next_line(&mut buf).with_file_context(reader.name())? {
                let line = std::mem::take(&mut buf);
                if let Some(session) = session.as_mut() {
                    session.push(line, reader.name(), reader.line_no())?;
                    continue;
                }

                stats.records_read += 1;
                if let Err(reason) = chunk.push(line) {
                    stats.skipped += 1;
                    self.diagnostics
                        .skip_record(reader.name(), reader.line_no(), reason);
                    continue;
                }
                if strategy == Strategy::Auto && chunk.estimated_bytes() >= budget {
                    info!("input exceeds {budget} bytes, switching to external sort");
                    let mut spill = self.new_session()?;
                    spill.count_read(stats.records_read, stats.skipped);
                    spill.spill(std::mem::replace(&mut chunk, InMemorySorter::new(order)))?;
                    session = Some(spill);
                }
            }
        }

        let mut stats = match session {
            Some(session) => session.finish()?.merge_into(out)?,
            None => {
                stats.peak_chunk_bytes = chunk.estimated_bytes();
                stats.records_written = chunk.sort().write_to(out)?;
                stats
            }
        };
        stats.header_lines = header.len() as u64;
        out.flush()?;
        Ok(stats)
    }

    fn new_session(&self) -> SortResult<ExternalSort> {
        ExternalSort::new(
            self.config.order,
            self.config.memory_budget_bytes(),
            self.temp_dir(),
            Arc::clone(&self.diagnostics),
        )
        .map(|session| session.with_parallel(self.parallel()))
    }

    /// Sort several files in parallel, one mapped file per job, and merge
    /// the per-file shards. The workers' key sorts share one pool of
    /// `parallel_threads` threads.
    fn sort_multiple_files(&self, files: &[String], out: &mut dyn Write) -> SortResult<SortStats> {
        let dir = session_dir(self.temp_dir())?;
        let pool = self.thread_pool()?;
        let workers = self.config.effective_thread_count().clamp(1, files.len());
        debug!("sorting {} files on {workers} workers", files.len());

        let (job_tx, job_rx): (Sender<(usize, &str)>, Receiver<(usize, &str)>) =
            bounded(files.len());
        for (index, file) in files.iter().enumerate() {
            job_tx
                .send((index, file.as_str()))
                .map_err(|e| SortError::internal(&e.to_string()))?;
        }
        drop(job_tx);

        let (result_tx, result_rx): (Sender<(usize, WorkerResult)>, Receiver<(usize, WorkerResult)>) =
            bounded(files.len());
        let sorter = self.mapped_sorter();
        let pid = std::process::id();
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let sorter = &sorter;
                let pool = &pool;
                let dir = dir.path();
                scope.spawn(move || {
                    for (index, file) in job_rx.iter() {
                        let shard_path = dir.join(format!("input-{pid}-{index:06}"));
                        let result = pool.install(|| sort_file_to_shard(sorter, file, shard_path));
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut parts: Vec<Option<(HeaderBlock, Shard, SortStats)>> =
            (0..files.len()).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            parts[index] = Some(result?);
        }

        let mut stats = SortStats::default();
        let mut header: Option<HeaderBlock> = None;
        let mut shards = Vec::with_capacity(files.len());
        for (block, shard, part) in parts.into_iter().flatten() {
            stats.absorb(&part);
            if header.is_none() && !block.is_empty() {
                header = Some(block);
            }
            shards.push(shard);
        }
        if shards.len() != files.len() {
            return Err(SortError::internal("a sort worker exited without a result"));
        }

        let header = header.unwrap_or_default();
        header.write_to(out)?;
        stats.header_lines = header.len() as u64;

        let readers = shards
            .iter()
            .map(Shard::open)
            .collect::<SortResult<Vec<_>>>()?;
        let merged = KWayMerger::new(readers, self.config.order, Arc::clone(&self.diagnostics))
            .merge_into(out)?;
        if merged.failed_sources > 0 {
            return Err(SortError::internal("a sorted file could not be read back"));
        }
        stats.records_written = merged.records;
        stats.shards = shards.len();
        out.flush()?;
        Ok(stats)
    }

    /// Merge already-sorted inputs. The header comes from the first input
    /// that has one.
    pub fn merge(&self) -> SortResult<SortStats> {
        let mut readers = self.open_inputs()?;
        let mut sink = self.open_output()?;
        let out = sink.writer();

        let header = first_header(&mut readers)?;
        header.write_to(out)?;
        let merged = KWayMerger::new(readers, self.config.order, Arc::clone(&self.diagnostics))
            .merge_into(out)?;
        sink.finish()?;
        self.diagnostics.summarize();

        let stats = SortStats {
            records_read: merged.records + merged.skipped,
            records_written: merged.records,
            skipped: merged.skipped,
            header_lines: header.len() as u64,
            ..SortStats::default()
        };
        info!(
            "merged {} records ({} skipped, {} unreadable inputs)",
            merged.records, merged.skipped, merged.failed_sources
        );
        Ok(stats)
    }

    /// Verify the input is sorted; stops at the first disorder
    pub fn check(&self) -> SortResult<CheckOutcome> {
        let name = self
            .config
            .input_files
            .first()
            .map_or("-", String::as_str);
        let mut reader = open_input(name, self.config.comment_marker)?;
        reader.read_header().with_file_context(name)?;

        let order = self.config.order;
        let mut prev: Vec<u8> = Vec::new();
        let mut have_prev = false;
        let mut buf = Vec::new();
        while reader.next_line(&mut buf).with_file_context(name)? {
            let current = match extract(&buf) {
                Ok(key) => key,
                Err(reason) => {
                    self.diagnostics.skip_record(name, reader.line_no(), reason);
                    continue;
                }
            };
            if have_prev {
                if let Ok(previous) = extract(&prev) {
                    if order.compare(&previous, &current).is_gt() {
                        self.diagnostics.summarize();
                        return Ok(CheckOutcome::Disorder {
                            origin: name.to_string(),
                            line: reader.line_no(),
                        });
                    }
                }
            }
            std::mem::swap(&mut prev, &mut buf);
            have_prev = true;
        }
        self.diagnostics.summarize();
        Ok(CheckOutcome::Sorted)
    }

    /// Compare two sorted inputs, writing `<`/`>` lines for one-sided records
    pub fn diff(&self) -> SortResult<DiffStats> {
        let mut readers = self.open_inputs()?;
        for reader in &mut readers {
            let name = reader.name().to_string();
            reader.read_header().with_file_context(&name)?;
        }
        let (Some(right), Some(left), None) = (readers.pop(), readers.pop(), readers.pop()) else {
            return Err(SortError::conflicting_options(
                "--diff needs exactly two input files",
            ));
        };

        let mut sink = self.open_output()?;
        let stats = SortedDiff::new(left, right, self.config.order, Arc::clone(&self.diagnostics))
            .write_to(sink.writer())?;
        sink.finish()?;
        self.diagnostics.summarize();
        info!(
            "diff: {} only in first, {} only in second, {} common",
            stats.left_only, stats.right_only, stats.common
        );
        Ok(stats)
    }

    fn open_inputs(&self) -> SortResult<Vec<InputReader>> {
        if self.config.reading_from_stdin() {
            return Ok(vec![open_input("-", self.config.comment_marker)?]);
        }
        self.config
            .input_files
            .iter()
            .map(|f| open_input(f, self.config.comment_marker))
            .collect()
    }

    /// Open the output. When it names one of the inputs, writes are staged
    /// next to it and renamed into place by [`OutputSink::finish`].
    fn open_output(&self) -> SortResult<OutputSink> {
        let Some(output) = &self.config.output_file else {
            return Ok(OutputSink::Stdout(BufWriter::with_capacity(
                WRITE_BUFFER_SIZE,
                io::stdout(),
            )));
        };
        let target = PathBuf::from(output);

        if self.aliases_input(&target) {
            let dir = match target.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let staged = NamedTempFile::new_in(&dir).map_err(|e| SortError::temp_file(&dir, e))?;
            debug!("output {output} is also an input, staging in {}", dir.display());
            return Ok(OutputSink::Staged {
                writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, staged),
                target,
            });
        }

        let file = File::create(&target).with_file_context(output)?;
        Ok(OutputSink::File(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)))
    }

    fn aliases_input(&self, target: &Path) -> bool {
        let Ok(target) = target.canonicalize() else {
            return false;
        };
        self.config
            .input_files
            .iter()
            .filter(|f| f.as_str() != "-")
            .any(|f| Path::new(f).canonicalize().map_or(false, |p| p == target))
    }
}

/// Open `name` for streaming, `-` being stdin
pub fn open_input(name: &str, comment: u8) -> SortResult<InputReader> {
    let reader: Box<dyn BufRead> = if name == "-" {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(name).with_file_context(name)?;
        Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file))
    };
    Ok(RecordReader::new(reader, name, comment))
}

fn sort_file_to_shard(sorter: &MappedFileSorter, file: &str, shard_path: PathBuf) -> WorkerResult {
    let mapped = MappedFile::open(Path::new(file))?;
    let view = sorter.sort_bytes(mapped.bytes(), file)?;
    let shard = Shard::write(shard_path, view.lines())?;
    Ok((view.header_block(), shard, view.stats()))
}

/// Destination of sorted output
enum OutputSink {
    Stdout(BufWriter<io::Stdout>),
    File(BufWriter<File>),
    Staged {
        writer: BufWriter<NamedTempFile>,
        target: PathBuf,
    },
}

impl OutputSink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            OutputSink::Stdout(writer) => writer,
            OutputSink::File(writer) => writer,
            OutputSink::Staged { writer, .. } => writer,
        }
    }

    /// Flush, and move a staged output over its target
    fn finish(self) -> SortResult<()> {
        match self {
            OutputSink::Stdout(mut writer) => writer.flush()?,
            OutputSink::File(mut writer) => writer.flush()?,
            OutputSink::Staged { writer, target } => {
                let staged = writer
                    .into_inner()
                    .map_err(|e| SortError::Io(e.into_error()))?;
                let name = target.display().to_string();
                staged
                    .persist(&target)
                    .map_err(|e| e.error)
                    .with_file_context(&name)?;
            }
        }
        Ok(())
    }
}
