//! vcfx-sort: order tab-delimited variant records by grouping key and position
//!
//! Sorts inputs of any size under a lexicographic or natural chromosome order,
//! merges or checks already-sorted inputs, and diffs two sorted inputs.

use clap::{Arg, ArgAction, Command};
use env_logger::Env;
use std::process;

use vcfx_sort::{
    config::{SortConfig, SortConfigBuilder, Strategy},
    error::{SortError, SortResult},
    line_scan::LineScan,
    ChromOrder,
};

fn main() {
    match run() {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("vcfx-sort: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn run() -> SortResult<i32> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_count("verbose"));

    let config = parse_config_from_matches(&matches)?;
    vcfx_sort::run(config)
}

/// `RUST_LOG` overrides the level picked by `-v`
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn build_cli() -> Command {
    Command::new("vcfx-sort")
        .version(env!("CARGO_PKG_VERSION"))
        .override_usage("vcfx-sort [OPTION]... [FILE]...")
        .about("Sort variant records by chromosome and position")
        .long_about("Sort tab-delimited variant records by their first field (chromosome) and second field (position).\n\nLeading comment lines are kept as a header at the top of the output. Inputs larger than the memory budget are sorted in shards on disk and merged back.")

        // Input files
        .arg(Arg::new("files")
            .help("Input files to sort (use '-' or omit for stdin)")
            .num_args(0..)
            .value_name("FILE"))

        // Ordering
        .arg(Arg::new("natural")
            .short('n')
            .long("natural")
            .help("Order chromosomes naturally: 1..22, M/MT, X, Y, then the rest")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("order")
            .long("order")
            .help("Chromosome order")
            .value_name("ORDER")
            .value_parser(["lexicographic", "natural"]))
        .arg(Arg::new("comment-char")
            .long("comment-char")
            .help("First character of header lines")
            .value_name("CHAR")
            .default_value("#"))

        // I/O options
        .arg(Arg::new("output")
            .short('o')
            .long("output")
            .help("Write result to FILE instead of standard output (may be an input)")
            .value_name("FILE"))

        // Operation modes
        .arg(Arg::new("check")
            .short('c')
            .long("check")
            .help("Check that the input is sorted; do not sort")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("merge")
            .short('m')
            .long("merge")
            .help("Merge already sorted files; do not sort")
            .action(ArgAction::SetTrue))
        .arg(Arg::new("diff")
            .long("diff")
            .help("Compare two sorted files, printing records found in only one")
            .action(ArgAction::SetTrue))

        // Performance options
        .arg(Arg::new("buffer-size")
            .short('S')
            .long("buffer-size")
            .help("Use SIZE for the in-memory chunk")
            .long_help("Use SIZE for the in-memory chunk before spilling to disk. A bare number is in MiB; SIZE may be followed by b, K, M, G or T.")
            .value_name("SIZE"))
        .arg(Arg::new("strategy")
            .long("strategy")
            .help("Sorting path")
            .value_name("STRATEGY")
            .value_parser(["auto", "memory", "mmap", "external"])
            .default_value("auto"))
        .arg(Arg::new("scan")
            .long("scan")
            .help("Line scanner of the mapped path")
            .value_name("SCAN")
            .value_parser(["vectorized", "scalar"])
            .default_value("vectorized"))
        .arg(Arg::new("parallel")
            .long("parallel")
            .help("Change the number of sorts run concurrently to N")
            .value_name("N"))
        .arg(Arg::new("temporary-directory")
            .short('T')
            .long("temporary-directory")
            .help("Use DIR for shards, not $TMPDIR or /tmp")
            .value_name("DIR"))

        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .help("Log progress to stderr (repeat for more detail)")
            .action(ArgAction::Count))
}

/// Parse configuration from command line matches
fn parse_config_from_matches(matches: &clap::ArgMatches) -> SortResult<SortConfig> {
    let mut builder = SortConfigBuilder::new();

    if matches.get_flag("natural") {
        builder = builder.natural();
    }
    if let Some(order) = matches.get_one::<String>("order") {
        builder = builder.order(order.parse::<ChromOrder>()?);
    }
    if let Some(strategy) = matches.get_one::<String>("strategy") {
        builder = builder.strategy(strategy.parse::<Strategy>()?);
    }
    if matches.get_flag("check") {
        builder = builder.check();
    }
    if matches.get_flag("merge") {
        builder = builder.merge();
    }
    if matches.get_flag("diff") {
        builder = builder.diff();
    }
    if let Some(output) = matches.get_one::<String>("output") {
        builder = builder.output_file(output.clone());
    }
    if let Some(temp_dir) = matches.get_one::<String>("temporary-directory") {
        builder = builder.temp_dir(temp_dir.clone());
    }

    let files: Vec<String> = matches
        .get_many::<String>("files")
        .unwrap_or_default()
        .cloned()
        .collect();
    builder = builder.input_files(files);

    let mut config = builder.build()?;

    if let Some(scan) = matches.get_one::<String>("scan") {
        config.scan = scan.parse::<LineScan>()?;
    }

    if let Some(marker) = matches.get_one::<String>("comment-char") {
        match marker.as_bytes() {
            [byte] => config.comment_marker = *byte,
            _ => {
                return Err(SortError::parse_error(&format!(
                    "comment character must be a single byte: {marker:?}"
                )))
            }
        }
    }

    if let Some(buffer_str) = matches.get_one::<String>("buffer-size") {
        config.set_buffer_size_from_string(buffer_str)?;
    }

    if let Some(parallel_str) = matches.get_one::<String>("parallel") {
        let threads: usize = parallel_str
            .parse()
            .map_err(|_| SortError::parse_error(&format!("invalid thread count: {parallel_str}")))?;
        config.parallel_threads = Some(threads);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> SortResult<SortConfig> {
        let matches = build_cli()
            .try_get_matches_from(args)
            .expect("Failed to parse test arguments");
        parse_config_from_matches(&matches)
    }

    #[test]
    fn test_parse_defaults() {
        let config = parse(&["vcfx-sort"]).unwrap();
        assert_eq!(config.order, ChromOrder::Lexicographic);
        assert_eq!(config.strategy, Strategy::Auto);
        assert_eq!(config.scan, LineScan::Vectorized);
        assert_eq!(config.comment_marker, b'#');
        assert!(config.reading_from_stdin());
    }

    #[test]
    fn test_parse_complex_config() {
        let config = parse(&[
            "vcfx-sort",
            "-n",
            "-S",
            "64",
            "-T",
            "/scratch",
            "--strategy",
            "external",
            "--parallel",
            "4",
            "-o",
            "out.vcf",
            "a.vcf",
            "b.vcf",
        ])
        .unwrap();

        assert_eq!(config.order, ChromOrder::Natural);
        assert_eq!(config.buffer_size, Some(64 * 1024 * 1024));
        assert_eq!(config.temp_dir.as_deref(), Some("/scratch"));
        assert_eq!(config.strategy, Strategy::External);
        assert_eq!(config.parallel_threads, Some(4));
        assert_eq!(config.output_file.as_deref(), Some("out.vcf"));
        assert_eq!(config.input_files, vec!["a.vcf", "b.vcf"]);
    }

    #[test]
    fn test_order_option() {
        let config = parse(&["vcfx-sort", "--order", "natural"]).unwrap();
        assert_eq!(config.order, ChromOrder::Natural);
    }

    #[test]
    fn test_conflicting_modes() {
        assert!(parse(&["vcfx-sort", "-c", "-m"]).is_err());
        assert!(parse(&["vcfx-sort", "--diff", "a.vcf"]).is_err());
        assert!(parse(&["vcfx-sort", "--diff", "a.vcf", "b.vcf"]).is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse(&["vcfx-sort", "-S", "12Q"]).is_err());
        assert!(parse(&["vcfx-sort", "--parallel", "0"]).is_err());
        assert!(parse(&["vcfx-sort", "--comment-char", "##"]).is_err());
        assert!(parse(&["vcfx-sort", "--strategy", "mmap"]).is_err());
    }

    #[test]
    fn test_comment_char() {
        let config = parse(&["vcfx-sort", "--comment-char", "@"]).unwrap();
        assert_eq!(config.comment_marker, b'@');
    }
}
