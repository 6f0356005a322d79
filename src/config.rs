/// file: src/config.rs
/// description: runtime configuration for the decision feed client
use crate::{
    buffer::{DEFAULT_RETENTION_CAP, MergePolicy, OrderingPolicy},
    cli::Args,
};
use anyhow::{Result, bail};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub stream: StreamConfig,
    pub poll: PollConfig,
    pub buffer: BufferConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub portfolio_id: Option<i64>,
    pub enabled: bool,
    /// When false the push channel is treated as unsupported and the client
    /// polls from the start.
    pub push_enabled: bool,
    pub reconnect_delay: Duration,
    pub reconnect_jitter: Duration,
    /// Consecutive failed stream attempts before falling back to polling;
    /// 0 keeps retrying the stream forever.
    pub max_push_failures: u32,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub page_size: u32,
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub retention_cap: usize,
    pub merge_policy: MergePolicy,
    pub ordering: OrderingPolicy,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Config {
    /// Stock settings: 5s reconnect, 50-event pages, 500 retained events.
    pub fn new(base_url: Url) -> Self {
        Config {
            api: ApiConfig {
                base_url,
                timeout: Duration::from_secs(15),
            },
            stream: StreamConfig {
                portfolio_id: None,
                enabled: true,
                push_enabled: true,
                reconnect_delay: Duration::from_secs(5),
                reconnect_jitter: Duration::ZERO,
                max_push_failures: 0,
                idle_timeout: Duration::from_secs(60),
            },
            poll: PollConfig {
                interval: Duration::from_secs(5),
                page_size: 50,
            },
            buffer: BufferConfig {
                retention_cap: DEFAULT_RETENTION_CAP,
                merge_policy: MergePolicy::default(),
                ordering: OrderingPolicy::default(),
            },
            metrics: MetricsConfig {
                enabled: false,
                port: 9090,
            },
        }
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let base_url = Url::parse(&args.api_base)?;

        let config = Config {
            api: ApiConfig {
                base_url,
                timeout: Duration::from_secs(args.timeout),
            },
            stream: StreamConfig {
                portfolio_id: args.portfolio_id,
                enabled: !args.disabled,
                push_enabled: !args.poll_only,
                reconnect_delay: Duration::from_secs(args.reconnect_delay),
                reconnect_jitter: Duration::from_millis(args.reconnect_jitter_ms),
                max_push_failures: args.max_push_failures,
                idle_timeout: Duration::from_secs(args.idle_timeout),
            },
            poll: PollConfig {
                interval: Duration::from_secs(args.poll_interval),
                page_size: args.page_size,
            },
            buffer: BufferConfig {
                retention_cap: args.retention_cap,
                merge_policy: parse_merge_policy(&args.merge_policy)?,
                ordering: parse_ordering(&args.ordering)?,
            },
            metrics: MetricsConfig {
                enabled: args.metrics,
                port: args.metrics_port,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the client cannot run with. Zero durations would
    /// either time out every request at once or spin the poll timer.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.api.base_url.scheme(), "http" | "https") {
            bail!("api base must be an http(s) URL, got {}", self.api.base_url);
        }
        if self.api.timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }
        if self.stream.idle_timeout.is_zero() {
            bail!("idle timeout must be greater than zero");
        }
        if self.poll.interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.poll.page_size == 0 {
            bail!("page size must be at least 1");
        }
        if self.buffer.retention_cap == 0 {
            bail!("retention cap must be at least 1");
        }
        Ok(())
    }
}

fn parse_merge_policy(value: &str) -> Result<MergePolicy> {
    match value.to_lowercase().as_str() {
        "incoming-first" | "incoming" => Ok(MergePolicy::IncomingFirst),
        "stored-first" | "stored" => Ok(MergePolicy::StoredFirst),
        other => bail!("unknown merge policy '{other}' (expected stored-first or incoming-first)"),
    }
}

fn parse_ordering(value: &str) -> Result<OrderingPolicy> {
    match value.to_lowercase().as_str() {
        "arrival" => Ok(OrderingPolicy::Arrival),
        "event-id" | "id" => Ok(OrderingPolicy::EventId),
        other => bail!("unknown ordering '{other}' (expected arrival or event-id)"),
    }
}
