//! Command-line configuration for the server and client subcommands.

use std::path::PathBuf;

use clap::Args;
use k2serve_core::classify::ClassifyOptions;
use k2serve_core::index::IndexOptions;
use k2serve_core::report::ReportOptions;

/// Exit codes mirroring `sysexits.h`.
pub mod exit_code {
    /// Successful termination.
    pub const OK: i32 = 0;
    /// Input data was incorrect in some way.
    pub const DATAERR: i32 = 65;
    /// A service is unavailable.
    pub const UNAVAILABLE: i32 = 69;
    /// An internal software error has been detected.
    pub const SOFTWARE: i32 = 70;
    /// An error occurred while doing I/O on some file.
    pub const IOERR: i32 = 74;
    /// Something was found in an unconfigured or misconfigured state.
    pub const CONFIG: i32 = 78;
}

/// Options for `k2serve serve`.
#[derive(Args, Clone, Debug)]
pub struct ServerConfig {
    /// Path to the database directory (hash.k2d, taxo.k2d, opts.k2d)
    #[arg(short, long = "db", value_name = "PATH")]
    pub db_path: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Max concurrent classify streams per connection (0 = transport default)
    #[arg(long, default_value_t = 0)]
    pub max_queue: usize,

    /// Number of classification worker threads
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub thread_pool: u32,

    /// Do not accumulate cumulative statistics across streams
    #[arg(long)]
    pub no_stats: bool,

    /// Include k-mer and distinct-k-mer columns in reports
    #[arg(long)]
    pub report_kmer_data: bool,

    /// Include zero-count taxa in reports
    #[arg(long)]
    pub report_zero_counts: bool,

    /// Classify against all six translated reading frames
    #[arg(long)]
    pub translated_search: bool,

    /// Confidence score threshold (0 - 1)
    #[arg(long, default_value_t = 0.0, value_parser = parse_confidence)]
    pub confidence_threshold: f64,

    /// Minimum base quality used in classification (FASTQ input only)
    #[arg(long, default_value_t = 0)]
    pub min_quality: u8,

    /// Minimum number of distinct minimizer groups needed to make a call
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u64).range(1..))]
    pub hit_groups: u64,

    /// Serve the hash table from the file instead of loading it into RAM
    #[arg(long)]
    pub memory_mapping: bool,

    /// Seconds to wait before opening the database files
    #[arg(long, default_value_t = 0)]
    pub wait: u64,
}

impl ServerConfig {
    /// Classification knobs for a loaded index. Protein databases force
    /// translated search regardless of the flag.
    #[must_use]
    pub fn classify_options(&self, index_options: &IndexOptions) -> ClassifyOptions {
        ClassifyOptions {
            confidence_threshold: self.confidence_threshold,
            minimum_quality_score: self.min_quality,
            minimum_hit_groups: self.hit_groups,
            use_translated_search: self.translated_search || !index_options.dna_db,
        }
    }

    #[must_use]
    pub const fn report_options(&self) -> ReportOptions {
        ReportOptions {
            report_zero_counts: self.report_zero_counts,
            report_kmer_data: self.report_kmer_data,
        }
    }
}

/// Options for `k2serve classify`.
#[derive(Args, Clone, Debug)]
pub struct ClientConfig {
    /// Path to the sequence file (*.fast(a|q), optionally gzipped)
    #[arg(short, long, value_name = "PATH")]
    pub sequence: PathBuf,

    /// Write the final summary report to this file
    #[arg(short, long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Server address
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,
}

/// Options for the `summary` and `shutdown` subcommands.
#[derive(Args, Clone, Debug)]
pub struct EndpointConfig {
    /// Server address
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,
}

fn parse_confidence(value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|e| format!("not a number: {e}"))?;
    if (0.0..=1.0).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(format!("confidence threshold {parsed} not in [0, 1]"))
    }
}
