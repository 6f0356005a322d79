/// file: src/client_state.rs
/// description: connection state machine, cursor and buffer owned by one client
use crate::{
    buffer::{EventBuffer, MergeOutcome},
    types::{Event, EventId, Heartbeat, max_event_id},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Polling,
    TornDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Polling => "POLLING",
            ConnectionState::TornDown => "TORN DOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Poll,
}

/// Proof that a channel was the active one when it was opened. Every
/// mutation from a transport is checked against the current lease, so a
/// late response from a replaced or torn-down channel changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    generation: u64,
    channel: Channel,
}

impl Lease {
    pub fn channel(&self) -> Channel {
        self.channel
    }
}

/// Point-in-time copy handed to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub session_id: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub error: Option<String>,
    pub heartbeat: Option<Heartbeat>,
    pub events: Vec<Event>,
    pub cursor: Option<EventId>,
    pub channel: Option<Channel>,
}

#[derive(Debug)]
pub struct ClientState {
    pub session_id: String,
    generation: u64,
    connection: ConnectionState,
    active_channel: Option<Channel>,
    error: Option<String>,
    heartbeat: Option<Heartbeat>,
    cursor: Option<EventId>,
    buffer: EventBuffer,

    pub reconnect_attempt: u32,
    pub consecutive_push_failures: u32,
    pub total_reconnects: u64,
    pub total_messages_received: u64,
    pub malformed_messages: u64,
    pub duplicate_events: u64,
    pub evicted_events: u64,
    pub polls_completed: u64,
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new(EventBuffer::default())
    }
}

impl ClientState {
    pub fn new(buffer: EventBuffer) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            generation: 0,
            connection: ConnectionState::Idle,
            active_channel: None,
            error: None,
            heartbeat: None,
            cursor: None,
            buffer,
            reconnect_attempt: 0,
            consecutive_push_failures: 0,
            total_reconnects: 0,
            total_messages_received: 0,
            malformed_messages: 0,
            duplicate_events: 0,
            evicted_events: 0,
            polls_completed: 0,
            started_at: Utc::now(),
            last_message_at: None,
        }
    }

    /// Makes `channel` the only channel allowed to deliver. Any lease handed
    /// out before stops being valid. Returns `None` once torn down.
    pub fn activate(&mut self, channel: Channel) -> Option<Lease> {
        if self.connection == ConnectionState::TornDown {
            return None;
        }

        self.generation += 1;
        self.active_channel = Some(channel);
        self.connection = match channel {
            Channel::Push => ConnectionState::Connecting,
            Channel::Poll => ConnectionState::Polling,
        };

        Some(Lease {
            generation: self.generation,
            channel,
        })
    }

    pub fn is_current(&self, lease: &Lease) -> bool {
        self.connection != ConnectionState::TornDown
            && lease.generation == self.generation
            && self.active_channel == Some(lease.channel)
    }

    pub fn on_connected(&mut self, lease: &Lease) -> bool {
        if !self.is_current(lease) || lease.channel != Channel::Push {
            return false;
        }
        self.connection = ConnectionState::Connected;
        self.error = None;
        self.reconnect_attempt = 0;
        self.consecutive_push_failures = 0;
        true
    }

    pub fn on_events(
        &mut self,
        lease: &Lease,
        events: Vec<Event>,
        last_id: Option<EventId>,
    ) -> Option<MergeOutcome> {
        if !self.is_current(lease) {
            return None;
        }
        self.advance_cursor(last_id);
        self.advance_cursor(max_event_id(&events));

        let outcome = self.buffer.merge(events);
        self.duplicate_events += outcome.duplicates as u64;
        self.evicted_events += outcome.evicted as u64;
        Some(outcome)
    }

    /// A completed poll clears any error left by a failed one.
    pub fn on_poll_success(&mut self, lease: &Lease, events: Vec<Event>) -> Option<MergeOutcome> {
        if !self.is_current(lease) || lease.channel != Channel::Poll {
            return None;
        }
        self.error = None;
        self.polls_completed += 1;
        self.on_events(lease, events, None)
    }

    pub fn on_heartbeat(&mut self, lease: &Lease, heartbeat: Heartbeat) -> bool {
        if !self.is_current(lease) {
            return false;
        }
        self.heartbeat = Some(heartbeat);
        true
    }

    /// Server-reported error. Connection state is left as it is.
    pub fn on_server_error(&mut self, lease: &Lease, message: String) -> bool {
        if !self.is_current(lease) {
            return false;
        }
        self.error = Some(message);
        true
    }

    pub fn on_transport_error(&mut self, lease: &Lease, reason: String) -> bool {
        if !self.is_current(lease) {
            return false;
        }
        if lease.channel == Channel::Push {
            self.connection = ConnectionState::Disconnected;
            self.consecutive_push_failures += 1;
        }
        self.error = Some(reason);
        true
    }

    pub fn increment_reconnect(&mut self) -> u32 {
        self.reconnect_attempt += 1;
        self.total_reconnects += 1;
        self.reconnect_attempt
    }

    pub fn record_message(&mut self) {
        self.last_message_at = Some(Utc::now());
        self.total_messages_received += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed_messages += 1;
    }

    /// Drops everything the client holds. Safe to call repeatedly; only the
    /// first call returns `true`.
    pub fn teardown(&mut self) -> bool {
        if self.connection == ConnectionState::TornDown {
            return false;
        }
        self.generation += 1;
        self.connection = ConnectionState::TornDown;
        self.active_channel = None;
        self.error = None;
        self.heartbeat = None;
        self.cursor = None;
        self.buffer.clear();
        true
    }

    fn advance_cursor(&mut self, candidate: Option<EventId>) {
        if let Some(candidate) = candidate
            && self.cursor.as_ref().is_none_or(|current| candidate > *current)
        {
            self.cursor = Some(candidate);
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn active_channel(&self) -> Option<Channel> {
        self.active_channel
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn heartbeat(&self) -> Option<&Heartbeat> {
        self.heartbeat.as_ref()
    }

    pub fn cursor(&self) -> Option<&EventId> {
        self.cursor.as_ref()
    }

    /// Value for the `after_id` query parameter.
    pub fn after_id(&self) -> EventId {
        self.cursor.clone().unwrap_or_default()
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            session_id: self.session_id.clone(),
            state: self.connection,
            connected: self.is_connected(),
            error: self.error.clone(),
            heartbeat: self.heartbeat.clone(),
            events: self.buffer.events().to_vec(),
            cursor: self.cursor.clone(),
            channel: self.active_channel,
        }
    }
}

pub type SharedClientState = Arc<Mutex<ClientState>>;
