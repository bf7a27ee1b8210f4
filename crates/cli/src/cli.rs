//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Textile Bridge - delivers e-textile sensor frames to a broker or local logs
#[derive(Parser, Debug)]
#[command(
    name = "textile-bridge",
    author,
    version,
    about = "E-textile sensor frame bridge",
    long_about = "Delivers decoded e-textile sensor frames to exactly one destination:\n\
                  an MQTT broker (with layered TLS trust) or per-device CSV logs\n\
                  on local storage when running in local mode."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "TEXTILE_BRIDGE_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "TEXTILE_BRIDGE_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay decoded frames through the configured sink
    Run(RunArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display resolved sink, trust plan and storage layout
    Info(InfoArgs),
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "bridge.toml",
        env = "TEXTILE_BRIDGE_CONFIG"
    )]
    pub config: PathBuf,

    /// JSON-lines frame input (one wire payload per line); stdin when omitted
    #[arg(short, long, env = "TEXTILE_BRIDGE_INPUT")]
    pub input: Option<PathBuf>,

    /// Override broker host from configuration
    #[arg(long, env = "TEXTILE_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Override broker port from configuration
    #[arg(long, env = "TEXTILE_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// Force local mode (write CSV logs instead of publishing)
    #[arg(long)]
    pub local: bool,

    /// Override local log root directory
    #[arg(long, env = "TEXTILE_BRIDGE_ROOT")]
    pub root: Option<PathBuf>,

    /// Also publish every input line unchanged on the raw topic
    #[arg(long)]
    pub publish_raw: bool,

    /// Maximum number of frames to replay (0 = unlimited)
    #[arg(long, default_value = "0", env = "TEXTILE_BRIDGE_MAX_FRAMES")]
    pub max_frames: u64,

    /// Stop after this many seconds (0 = no timeout)
    #[arg(long, default_value = "0", env = "TEXTILE_BRIDGE_TIMEOUT")]
    pub timeout: u64,

    /// Validate configuration and exit without running
    #[arg(long)]
    pub dry_run: bool,

    /// Channel buffer size between input and dispatcher
    #[arg(long, default_value = "100", env = "TEXTILE_BRIDGE_BUFFER_SIZE")]
    pub buffer_size: usize,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "TEXTILE_BRIDGE_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "bridge.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "bridge.toml")]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
