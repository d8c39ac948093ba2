//! Configuration management for sort operations

use crate::diagnostics::DEFAULT_WARNING_LIMIT;
use crate::error::{SortError, SortResult};
use crate::line_scan::LineScan;
use crate::ordering::ChromOrder;
use crate::record::DEFAULT_COMMENT_MARKER;
use std::str::FromStr;

/// Default memory budget of the chunked path (100 MiB)
pub const DEFAULT_MEMORY_BUDGET: usize = 100 * 1024 * 1024;

const MIN_BUFFER_SIZE: usize = 1024;
const MAX_BUFFER_SIZE: usize = 8 * 1024 * 1024 * 1024;
const MAX_THREADS: usize = 1024;

/// Which sorting path to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Seekable files are mapped, streams go through the chunked path and
    /// stay in memory when they fit the budget
    #[default]
    Auto,
    /// Load everything into memory regardless of the budget
    Memory,
    /// Memory-map every input file
    Mmap,
    /// Always spill through shards, even for small inputs
    External,
}

impl FromStr for Strategy {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Strategy::Auto),
            "memory" | "in-memory" => Ok(Strategy::Memory),
            "mmap" | "mapped" => Ok(Strategy::Mmap),
            "external" | "chunked" => Ok(Strategy::External),
            _ => Err(SortError::parse_error(&format!("unknown strategy: {s}"))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Auto => "auto",
            Strategy::Memory => "memory",
            Strategy::Mmap => "mmap",
            Strategy::External => "external",
        };
        write!(f, "{name}")
    }
}

/// Main configuration structure for sort operations
#[derive(Debug, Clone)]
pub struct SortConfig {
    /// Order of the grouping key
    pub order: ChromOrder,
    /// Sorting path selection
    pub strategy: Strategy,
    /// Newline scanner of the mapped path
    pub scan: LineScan,
    /// Check if input is already sorted
    pub check: bool,
    /// Merge already sorted files
    pub merge: bool,
    /// Compare two sorted files
    pub diff: bool,
    /// First byte of header lines
    pub comment_marker: u8,
    /// Output file path
    pub output_file: Option<String>,
    /// Memory budget in bytes
    pub buffer_size: Option<usize>,
    /// Number of parallel threads to use
    pub parallel_threads: Option<usize>,
    /// Files to read from (if not specified, use stdin)
    pub input_files: Vec<String>,
    /// Temporary directory for external sorting
    pub temp_dir: Option<String>,
    /// Skipped records reported individually
    pub warning_limit: u64,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            order: ChromOrder::default(),
            strategy: Strategy::default(),
            scan: LineScan::default(),
            check: false,
            merge: false,
            diff: false,
            comment_marker: DEFAULT_COMMENT_MARKER,
            output_file: None,
            buffer_size: None,
            parallel_threads: None,
            input_files: Vec::new(),
            temp_dir: None,
            warning_limit: DEFAULT_WARNING_LIMIT,
        }
    }
}

impl SortConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order(mut self, order: ChromOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_scan(mut self, scan: LineScan) -> Self {
        self.scan = scan;
        self
    }

    /// Enable check mode
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Enable merge mode
    pub fn with_merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    /// Enable diff mode
    pub fn with_diff(mut self, diff: bool) -> Self {
        self.diff = diff;
        self
    }

    pub fn with_comment_marker(mut self, marker: u8) -> Self {
        self.comment_marker = marker;
        self
    }

    /// Set output file
    pub fn with_output_file(mut self, output_file: Option<String>) -> Self {
        self.output_file = output_file;
        self
    }

    /// Set the memory budget in bytes
    pub fn with_buffer_size(mut self, buffer_size: Option<usize>) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set parallel threads
    pub fn with_parallel_threads(mut self, threads: Option<usize>) -> Self {
        self.parallel_threads = threads;
        self
    }

    /// Set input files
    pub fn with_input_files(mut self, files: Vec<String>) -> Self {
        self.input_files = files;
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: Option<String>) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    /// Parse a memory budget such as `100` (MiB), `512K`, `2G` or `65536b`
    pub fn set_buffer_size_from_string(&mut self, size_str: &str) -> SortResult<()> {
        self.buffer_size = Some(parse_size(size_str)?);
        Ok(())
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> SortResult<()> {
        let modes = [self.check, self.merge, self.diff]
            .iter()
            .filter(|&&m| m)
            .count();
        if modes > 1 {
            return Err(SortError::conflicting_options(
                "--check, --merge and --diff are mutually exclusive",
            ));
        }

        if self.diff && self.input_files.len() != 2 {
            return Err(SortError::conflicting_options(
                "--diff needs exactly two input files",
            ));
        }

        if self.check && self.input_files.len() > 1 {
            return Err(SortError::conflicting_options(
                "--check accepts at most one input file",
            ));
        }

        if self.strategy == Strategy::Mmap
            && (self.input_files.is_empty() || self.input_files.iter().any(|f| f == "-"))
        {
            return Err(SortError::conflicting_options(
                "the mmap strategy needs input files",
            ));
        }

        if matches!(self.comment_marker, b'\t' | b'\n' | b'\r') {
            return Err(SortError::parse_error(
                "comment marker cannot be a field or line separator",
            ));
        }

        // Check for reasonable buffer size
        if let Some(buffer_size) = self.buffer_size {
            if buffer_size < MIN_BUFFER_SIZE {
                return Err(SortError::invalid_buffer_size(
                    "buffer size too small (minimum 1KB)",
                ));
            }
            if buffer_size > MAX_BUFFER_SIZE {
                return Err(SortError::invalid_buffer_size(
                    "buffer size too large (maximum 8GB)",
                ));
            }
        }

        // Validate thread count
        if let Some(threads) = self.parallel_threads {
            if threads == 0 {
                return Err(SortError::thread_pool_error(
                    "thread count must be positive",
                ));
            }
            if threads > MAX_THREADS {
                return Err(SortError::thread_pool_error(
                    "too many threads (maximum 1024)",
                ));
            }
        }

        Ok(())
    }

    /// Check if reading from stdin
    pub fn reading_from_stdin(&self) -> bool {
        self.input_files.is_empty() || (self.input_files.len() == 1 && self.input_files[0] == "-")
    }

    /// Memory budget in bytes (with default)
    pub fn memory_budget_bytes(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_MEMORY_BUDGET)
    }

    /// Get effective thread count
    pub fn effective_thread_count(&self) -> usize {
        self.parallel_threads.unwrap_or_else(num_cpus::get)
    }
}

/// Parse a size with an optional `b`, `K`, `M`, `G` or `T` suffix. A bare
/// number is in MiB.
pub fn parse_size(size_str: &str) -> SortResult<usize> {
    let trimmed = size_str.trim();
    let invalid = || SortError::invalid_buffer_size(size_str);

    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(digits_end);
    if number.is_empty() {
        return Err(invalid());
    }
    let value: usize = number.parse().map_err(|_| invalid())?;

    let multiplier: usize = match suffix {
        "b" | "B" => 1,
        "k" | "K" | "KiB" => 1 << 10,
        "" | "m" | "M" | "MiB" => 1 << 20,
        "g" | "G" | "GiB" => 1 << 30,
        "t" | "T" | "TiB" => 1 << 40,
        _ => return Err(invalid()),
    };
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Builder pattern for creating configurations
pub struct SortConfigBuilder {
    config: SortConfig,
}

impl SortConfigBuilder {
    /// Start building a new configuration
    pub fn new() -> Self {
        Self {
            config: SortConfig::default(),
        }
    }

    pub fn order(mut self, order: ChromOrder) -> Self {
        self.config.order = order;
        self
    }

    pub fn natural(self) -> Self {
        self.order(ChromOrder::Natural)
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Enable check mode
    pub fn check(mut self) -> Self {
        self.config.check = true;
        self
    }

    /// Enable merge mode
    pub fn merge(mut self) -> Self {
        self.config.merge = true;
        self
    }

    /// Enable diff mode
    pub fn diff(mut self) -> Self {
        self.config.diff = true;
        self
    }

    /// Set output file
    pub fn output_file(mut self, file: String) -> Self {
        self.config.output_file = Some(file);
        self
    }

    /// Set the memory budget in bytes
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = Some(size);
        self
    }

    pub fn temp_dir(mut self, dir: String) -> Self {
        self.config.temp_dir = Some(dir);
        self
    }

    pub fn input_files(mut self, files: Vec<String>) -> Self {
        self.config.input_files = files;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> SortResult<SortConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SortConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Preset configurations for common use cases
pub mod presets {
    use super::*;

    /// Configuration for natural chromosome order
    pub fn natural() -> SortConfig {
        SortConfig::new().with_order(ChromOrder::Natural)
    }

    /// Configuration for merge mode
    pub fn merge() -> SortConfig {
        SortConfig::new().with_merge(true)
    }

    /// Configuration for check mode
    pub fn check() -> SortConfig {
        SortConfig::new().with_check(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SortConfig::default();
        assert_eq!(config.order, ChromOrder::Lexicographic);
        assert_eq!(config.strategy, Strategy::Auto);
        assert_eq!(config.comment_marker, b'#');
        assert_eq!(config.memory_budget_bytes(), 100 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = SortConfigBuilder::new()
            .natural()
            .strategy(Strategy::External)
            .buffer_size(4096)
            .build()
            .expect("Failed to build test config");

        assert_eq!(config.order, ChromOrder::Natural);
        assert_eq!(config.strategy, Strategy::External);
        assert_eq!(config.memory_budget_bytes(), 4096);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("100").unwrap(), 100 << 20);
        assert_eq!(parse_size("512K").unwrap(), 512 << 10);
        assert_eq!(parse_size("2G").unwrap(), 2 << 30);
        assert_eq!(parse_size("4096b").unwrap(), 4096);
        assert_eq!(parse_size(" 3m ").unwrap(), 3 << 20);
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("-5").is_err());
        assert!(parse_size("99999999999999999999T").is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("mmap".parse::<Strategy>().unwrap(), Strategy::Mmap);
        assert_eq!("Chunked".parse::<Strategy>().unwrap(), Strategy::External);
        assert!("fast".parse::<Strategy>().is_err());
        assert_eq!(Strategy::Memory.to_string(), "memory");
    }

    #[test]
    fn test_validate_conflicting_options() {
        let config = SortConfig {
            check: true,
            merge: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SortError::ConflictingOptions { .. })
        ));

        let config = presets::merge().with_diff(true);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_diff_needs_two_files() {
        let config = SortConfig::new().with_diff(true);
        assert!(config.validate().is_err());

        let config = config.with_input_files(vec!["a.vcf".into(), "b.vcf".into()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_limits() {
        let config = SortConfig::new().with_buffer_size(Some(100));
        assert!(matches!(
            config.validate(),
            Err(SortError::InvalidBufferSize { .. })
        ));

        let config = SortConfig::new().with_parallel_threads(Some(0));
        assert!(config.validate().is_err());

        let config = SortConfig::new().with_comment_marker(b'\t');
        assert!(config.validate().is_err());

        let config = SortConfig::new().with_strategy(Strategy::Mmap);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        assert_eq!(presets::natural().order, ChromOrder::Natural);
        assert!(presets::merge().merge);
        assert!(presets::check().check);
    }

    #[test]
    fn test_reading_from_stdin() {
        let config = SortConfig::default();
        assert!(config.reading_from_stdin());

        let config = SortConfig::default().with_input_files(vec!["-".to_string()]);
        assert!(config.reading_from_stdin());

        let config = SortConfig::default().with_input_files(vec!["file.vcf".to_string()]);
        assert!(!config.reading_from_stdin());
    }
}
