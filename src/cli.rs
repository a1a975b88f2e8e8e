//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download books from a catalog through a prioritized worker pool.
///
/// Each BOOK is a catalog id, optionally followed by `:PRIORITY` (lower runs
/// first). When no BOOK is given, ids are read one per line from stdin.
#[derive(Parser, Debug)]
#[command(name = "bookqueue")]
#[command(author, version, about)]
pub struct Args {
    /// Book ids to download, as ID or ID:PRIORITY
    #[arg(value_name = "BOOK")]
    pub books: Vec<String>,

    /// JSON catalog mapping book ids to titles, formats and source URLs
    #[arg(long, value_name = "FILE")]
    pub catalog: PathBuf,

    /// Maximum concurrent downloads (1-32)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// Directory finished books are published into
    #[arg(long, value_name = "DIR")]
    pub ingest_dir: Option<PathBuf>,

    /// Directory for in-progress downloads
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Program run on each downloaded file before it is published
    #[arg(long, value_name = "PROGRAM")]
    pub hook: Option<PathBuf>,

    /// Persist the queue in this SQLite file instead of memory
    #[arg(long, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Name published files after the book title instead of the id
    #[arg(long)]
    pub use_title: bool,

    /// Scheduler fallback poll interval in milliseconds (10-60000)
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(10..=60_000))]
    pub tick_ms: Option<u64>,

    /// Read defaults from this config file instead of the default location
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the final status snapshot as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
