use super::app_config::LogLevel;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "covercache",
    version,
    about = "Inspect and drive the two-tier image cache",
    long_about = None
)]
pub struct CliArgs {
    /// Configuration file path.
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[arg(long, value_enum, global = true)]
    pub log_level: Option<LogLevel>,

    /// Disk cache directory.
    #[arg(long, value_name = "PATH", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Disk quota in bytes.
    #[arg(long, global = true)]
    pub disk_max_bytes: Option<u64>,

    /// HTTP timeout in seconds.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Transport retries per download.
    #[arg(long, global = true)]
    pub retry_count: Option<u32>,

    /// Share one request between concurrent fetches of the same image.
    #[arg(long, global = true)]
    pub coalesce_in_flight: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load an image through the cache and report where it came from.
    Fetch {
        /// Image URL.
        url: String,
        /// Bound on the longest edge, in pixels.
        #[arg(short, long)]
        max_dimension: Option<u32>,
        /// Extra discriminator folded into the key.
        #[arg(long)]
        variant: Option<String>,
        /// Write the decoded image to this file.
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Remove one entry from both tiers.
    Remove {
        /// Image URL.
        url: String,
        /// Size hint used when the entry was fetched.
        #[arg(short, long)]
        max_dimension: Option<u32>,
        /// Variant used when the entry was fetched.
        #[arg(long)]
        variant: Option<String>,
    },
    /// Delete every cached image.
    Clear,
    /// Print the cache key and disk path for a request.
    Key {
        /// Image URL.
        url: String,
        /// Bound on the longest edge, in pixels.
        #[arg(short, long)]
        max_dimension: Option<u32>,
        /// Extra discriminator folded into the key.
        #[arg(long)]
        variant: Option<String>,
    },
    /// Warm the cache for several images.
    Prefetch {
        /// Image URLs.
        #[arg(required = true)]
        urls: Vec<String>,
        /// Bound on the longest edge, in pixels.
        #[arg(short, long)]
        max_dimension: Option<u32>,
    },
}
