//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download files over HTTP(S) with resume support.
///
/// Files are stored under content-addressed names inside the download
/// directory; partially downloaded files can be resumed with `--breakpoint`.
#[derive(Parser, Debug)]
#[command(name = "resumable-dl")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Download directory (defaults to the config file value, then ".")
    #[arg(short, long)]
    pub dir: Option<PathBuf>,

    /// Subdirectory of the download directory to store files in
    #[arg(short, long, default_value = "")]
    pub subdir: String,

    /// Maximum concurrent transfers (1-64)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub parallelism: Option<u8>,

    /// Resume partially downloaded files with range requests
    #[arg(short, long)]
    pub breakpoint: bool,

    /// Seconds to wait for response headers (1-3600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// Minimum percentage growth between progress updates (1-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub progress_step: Option<u8>,

    /// Delete leftover temp files in the target directory before downloading
    #[arg(long)]
    pub clean_temp: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
