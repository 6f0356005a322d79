use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "mip-live",
    about = "live decision-event feed client for the mip backend (sse with polling fallback)",
    version
)]
pub struct Args {
    /// Base URL of the MIP API
    #[arg(short, long, default_value = "http://localhost:8000")]
    pub api_base: String,

    /// Only follow events for this portfolio
    #[arg(short, long)]
    pub portfolio_id: Option<i64>,

    /// Start with the feed disabled (no network activity)
    #[arg(long)]
    pub disabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long)]
    pub json_logs: bool,

    /// Enable metrics server
    #[arg(long)]
    pub metrics: bool,

    /// Metrics server port
    #[arg(long, default_value = "9090")]
    pub metrics_port: u16,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "15")]
    pub timeout: u64,

    /// Seconds without any frame before the stream is considered dead
    #[arg(long, default_value = "60")]
    pub idle_timeout: u64,

    /// Delay before reconnecting the stream, in seconds
    #[arg(long, default_value = "5")]
    pub reconnect_delay: u64,

    /// Random extra delay added to each reconnect, up to this many milliseconds
    #[arg(long, default_value = "0")]
    pub reconnect_jitter_ms: u64,

    /// Switch to polling after this many consecutive stream failures (0 never switches)
    #[arg(long, default_value = "0")]
    pub max_push_failures: u32,

    /// Skip the stream and poll from the start
    #[arg(long)]
    pub poll_only: bool,

    /// Polling interval in seconds
    #[arg(long, default_value = "5")]
    pub poll_interval: u64,

    /// Events requested per poll
    #[arg(long, default_value = "50")]
    pub page_size: u32,

    /// Maximum number of events kept in memory
    #[arg(long, default_value = "500")]
    pub retention_cap: usize,

    /// Duplicate handling: stored-first, incoming-first (last seen wins)
    #[arg(long, default_value = "stored-first")]
    pub merge_policy: String,

    /// Buffer ordering: arrival, event-id
    #[arg(long, default_value = "arrival")]
    pub ordering: String,

    /// Output format: table, json, minimal
    #[arg(long, default_value = "table")]
    pub format: String,

    /// Disable colored output (useful for piping to files)
    #[arg(long)]
    pub no_color: bool,

    /// Quiet mode - suppress connection status lines
    #[arg(long)]
    pub quiet: bool,

    /// Stop after printing this many events (0 for unlimited)
    #[arg(long, default_value = "0")]
    pub max_events: u64,
}
