/// file: src/events.rs
/// description: notification bus between the feed client and whatever displays it
use crate::{
    client_state::Channel,
    types::{Event, Heartbeat},
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub enum FeedEvent {
    Starting,
    Idle,
    Connecting { url: String, attempt: u32 },
    Connected { session_id: String },
    EventsMerged {
        channel: Channel,
        fresh: Arc<Vec<Event>>,
        duplicates: usize,
        evicted: usize,
        buffered: usize,
    },
    Heartbeat(Arc<Heartbeat>),
    ServerError { message: String },
    MalformedMessage { kind: String, reason: String },
    ConnectionFailed(String),
    Reconnecting { attempt: u32, delay_ms: u64 },
    FallbackToPolling { reason: String },
    PollFailed(String),
    Stopping,
}

// Notifications are sent with try_send; a consumer that falls this far
// behind loses notifications, never buffer contents.
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

pub type EventSender = mpsc::Sender<FeedEvent>;
pub type EventReceiver = mpsc::Receiver<FeedEvent>;

pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}
