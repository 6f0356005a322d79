use crate::{client_state::ClientState, error::FeedError};
use anyhow::Result;
use metrics::{Counter, Gauge, counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{net::SocketAddr, sync::LazyLock};
use tracing::{error, info};

// Series exported by the feed client.
pub static MESSAGES_RECEIVED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_messages_received_total"));
pub static EVENTS_MERGED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_events_merged_total"));
pub static DUPLICATES_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_duplicates_total"));
pub static EVICTED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_evicted_total"));
pub static MALFORMED_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_malformed_messages_total"));
pub static RECONNECT_COUNTER: LazyLock<Counter> =
    LazyLock::new(|| counter!("mip_feed_reconnects_total"));
pub static POLL_COUNTER: LazyLock<Counter> = LazyLock::new(|| counter!("mip_feed_polls_total"));
pub static CONNECTED_GAUGE: LazyLock<Gauge> = LazyLock::new(|| gauge!("mip_feed_connected"));
pub static BUFFERED_GAUGE: LazyLock<Gauge> = LazyLock::new(|| gauge!("mip_feed_buffered_events"));

/// Installs the Prometheus recorder and its `/metrics` listener on `port`.
pub async fn setup_metrics(port: u16) -> Result<()> {
    let listen: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .add_global_label("service", "mip-live-feed")
        .add_global_label("version", env!("CARGO_PKG_VERSION"))
        .install()
        .map_err(|e| {
            error!(%listen, error = %e, "Could not install metrics exporter");
            FeedError::MetricsError(e.to_string())
        })?;

    info!(%listen, "Serving Prometheus metrics at /metrics");
    reset_series();
    Ok(())
}

// Registers every series up front so scrapes see zeros before the first event.
fn reset_series() {
    for counter in [
        &MESSAGES_RECEIVED_COUNTER,
        &EVENTS_MERGED_COUNTER,
        &DUPLICATES_COUNTER,
        &EVICTED_COUNTER,
        &MALFORMED_COUNTER,
        &RECONNECT_COUNTER,
        &POLL_COUNTER,
    ] {
        counter.absolute(0);
    }
    CONNECTED_GAUGE.set(0.0);
    BUFFERED_GAUGE.set(0.0);
}

#[derive(Debug)]
pub struct FeedHealth {
    pub is_healthy: bool,
    pub state: &'static str,
    pub error: Option<String>,
    pub last_message_time: Option<chrono::DateTime<chrono::Utc>>,
    pub total_messages: u64,
    pub buffered_events: usize,
    pub malformed_messages: u64,
    pub duplicate_events: u64,
    pub reconnect_count: u64,
    pub polls_completed: u64,
    pub uptime: chrono::Duration,
}

impl FeedHealth {
    /// Healthy means events can currently flow: a live stream, or a
    /// polling loop whose last request succeeded.
    pub fn from_state(state: &ClientState) -> Self {
        use crate::client_state::ConnectionState;

        let is_healthy = match state.connection() {
            ConnectionState::Connected => true,
            ConnectionState::Polling => state.error().is_none(),
            _ => false,
        };

        Self {
            is_healthy,
            state: state.connection().as_str(),
            error: state.error().map(str::to_string),
            last_message_time: state.last_message_at,
            total_messages: state.total_messages_received,
            buffered_events: state.buffer().len(),
            malformed_messages: state.malformed_messages,
            duplicate_events: state.duplicate_events,
            reconnect_count: state.total_reconnects,
            polls_completed: state.polls_completed,
            uptime: chrono::Utc::now() - state.started_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": if self.is_healthy { "healthy" } else { "unhealthy" },
            "state": self.state,
            "error": self.error,
            "last_message_time": self.last_message_time,
            "total_messages": self.total_messages,
            "buffered_events": self.buffered_events,
            "malformed_messages": self.malformed_messages,
            "duplicate_events": self.duplicate_events,
            "reconnect_count": self.reconnect_count,
            "polls_completed": self.polls_completed,
            "uptime_seconds": self.uptime.num_seconds(),
            "timestamp": chrono::Utc::now()
        })
    }
}
