use clap::{Parser, Subcommand};
use fetchpool::humanize::ByteSize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchpool")]
#[command(about = "Concurrent HTTP downloads through a worker pool", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download URLs and print one JSON line per finished job
    Fetch(FetchArgs),
}

#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// URLs to download
    pub urls: Vec<String>,

    /// File with one URL per line ("-" reads stdin)
    #[arg(long, short)]
    pub input: Option<PathBuf>,

    /// Number of workers, overrides `pool.size`
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Cap on captured body bytes, e.g. "512KB"
    #[arg(long)]
    pub max_body_size: Option<ByteSize>,

    /// Configuration file, overrides `FETCHPOOL_CONFIG`
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}
