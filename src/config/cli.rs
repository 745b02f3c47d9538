use std::path::PathBuf;

use clap::{Args, Parser, builder::BoolishValueParser};

/// Command-line arguments for the tally daemon.
#[derive(Debug, Parser)]
#[command(
    name = "tallyd",
    version,
    about = "Counter and search-cache consistency engine"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TALLY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of entries the in-memory cache keeps.
    #[arg(long = "cache-capacity", value_name = "COUNT")]
    pub cache_capacity: Option<u64>,

    /// Override the buffered events per handler chain.
    #[arg(long = "pipeline-channel-capacity", value_name = "COUNT")]
    pub pipeline_channel_capacity: Option<u64>,

    /// Override how long publishing waits on a full chain (0 rejects at once).
    #[arg(long = "pipeline-enqueue-wait-ms", value_name = "MILLISECONDS")]
    pub pipeline_enqueue_wait_ms: Option<u64>,

    /// Override the aggregate lock wait timeout.
    #[arg(long = "lock-wait-timeout-ms", value_name = "MILLISECONDS")]
    pub lock_wait_timeout_ms: Option<u64>,

    /// Override the number of pending targets that triggers a flush.
    #[arg(long = "batch-size-threshold", value_name = "COUNT")]
    pub batch_size_threshold: Option<u64>,

    /// Override the maximum time between flushes.
    #[arg(long = "batch-flush-interval-ms", value_name = "MILLISECONDS")]
    pub batch_flush_interval_ms: Option<u64>,

    /// Toggle the scheduled repair loop.
    #[arg(
        long = "repair-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub repair_enabled: Option<bool>,

    /// Override the scheduled repair interval.
    #[arg(long = "repair-interval-ms", value_name = "MILLISECONDS")]
    pub repair_interval_ms: Option<u64>,
}
