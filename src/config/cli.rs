use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the docgen binary.
#[derive(Debug, Parser)]
#[command(
    name = "docgen",
    version,
    about = "Document generation template cache and log shipping"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DOCGEN_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Prune the cache directory down to its configured size once.
    Cleanup,
    /// Hash a file and store a copy of it in the cache.
    Put(PutArgs),
    /// Show the cache entry stored under a hash.
    Find(HashArgs),
    /// Delete the cache entry stored under a hash.
    Remove(HashArgs),
    /// Run periodic eviction and log shipping until interrupted.
    Run(RunArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the cache directory.
    #[arg(long = "cache-directory", value_name = "PATH", global = true)]
    pub cache_directory: Option<PathBuf>,

    /// Override the maximum cache size (e.g. 2GB).
    #[arg(long = "cache-max-size", value_name = "SIZE", global = true)]
    pub cache_max_size: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct PutArgs {
    /// File to store. The original is left in place.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Replace an existing entry with the same hash.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub overwrite: bool,

    /// Name to store the file under; defaults to the source file name.
    #[arg(long, value_name = "NAME")]
    pub name: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct HashArgs {
    /// SHA-256 content hash (64 hex characters).
    #[arg(value_name = "HASH")]
    pub hash: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    /// Override the periodic cleanup interval; 0 disables it.
    #[arg(long = "cleanup-interval-seconds", value_name = "SECONDS")]
    pub cleanup_interval_seconds: Option<u64>,

    /// Toggle shipping logs to the common-logging collector.
    #[arg(
        long = "clogs-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub clogs_enabled: Option<bool>,
}
