/// file: src/types.rs
/// description: wire types for the decision-event feed (push messages and poll responses)
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{cmp::Ordering, fmt};
use tracing::warn;

use crate::error::{FeedError, FeedResult};

/// Feed-wide identity of an event. The backend emits integers; string ids
/// are accepted so that a feed keyed by opaque strings still dedupes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    Numeric(i64),
    Text(String),
}

impl EventId {
    /// Cursor sent before anything has been consumed.
    pub const ZERO: EventId = EventId::Numeric(0);
}

impl Default for EventId {
    fn default() -> Self {
        Self::ZERO
    }
}

// Numeric ids order numerically, text ids lexicographically, and every
// numeric id sorts before every text id.
impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (EventId::Numeric(a), EventId::Numeric(b)) => a.cmp(b),
            (EventId::Text(a), EventId::Text(b)) => a.cmp(b),
            (EventId::Numeric(_), EventId::Text(_)) => Ordering::Less,
            (EventId::Text(_), EventId::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventId::Numeric(id) => write!(f, "{id}"),
            EventId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        EventId::Numeric(id)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        EventId::Text(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Green,
    Yellow,
    Red,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Green => "green",
            Severity::Yellow => "yellow",
            Severity::Red => "red",
            Severity::Unknown => "unknown",
        }
    }
}

/// One decision/state-transition notification. Only `event_id` is
/// interpreted; everything else is carried through for the consumer, and a
/// null or oddly typed payload field never rejects the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub portfolio_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "opaque_text_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "opaque_text")]
    pub decision_type: String,
    #[serde(default, deserialize_with = "lenient")]
    pub severity: Severity,
    #[serde(default, deserialize_with = "opaque_text")]
    pub stage: String,
    #[serde(default, deserialize_with = "opaque_text")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
    /// Fields the backend adds that this client does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// Null or mistyped values fall back to the default.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

// Strings pass through; other non-null JSON is kept as its JSON text.
fn opaque_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opaque_text_opt(deserializer)?.unwrap_or_default())
}

fn opaque_text_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

// One undecodable element (no usable `event_id`) is skipped without losing
// the rest of its batch.
fn events_skipping_invalid<'de, D>(deserializer: D) -> Result<Vec<Event>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Event>(value) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable event in batch");
                None
            }
        })
        .collect())
}

impl Event {
    /// Bare event carrying only an id, mostly useful in tests and fixtures.
    pub fn with_id(event_id: i64) -> Self {
        Self {
            event_id: EventId::Numeric(event_id),
            portfolio_id: None,
            symbol: None,
            decision_type: String::new(),
            severity: Severity::Unknown,
            stage: String::new(),
            summary: String::new(),
            metrics: None,
            extra: Map::new(),
        }
    }
}

/// Aggregate counts snapshot. Replaced wholesale on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default)]
    pub open: u64,
    #[serde(default)]
    pub triggered: u64,
    #[serde(default)]
    pub exited: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsPayload {
    #[serde(default, deserialize_with = "events_skipping_invalid")]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Body of `GET /decisions/events`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default, deserialize_with = "events_skipping_invalid")]
    pub events: Vec<Event>,
}

/// Named messages recognised on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Connected,
    Events(EventsPayload),
    Heartbeat(Heartbeat),
    Error(ErrorPayload),
}

impl StreamMessage {
    /// Decodes one SSE message by name. Unknown names yield `Ok(None)`;
    /// a known name with an unparseable payload is an `InvalidMessage`.
    pub fn decode(event: &str, data: &str) -> FeedResult<Option<Self>> {
        let message = match event {
            "connected" => StreamMessage::Connected,
            "events" => StreamMessage::Events(parse_payload(event, data)?),
            "heartbeat" => {
                let value: Value = parse_payload(event, data)?;
                if !value.is_object() {
                    return Err(FeedError::InvalidMessage(format!(
                        "heartbeat payload is not an object: {}",
                        truncate(data)
                    )));
                }
                StreamMessage::Heartbeat(serde_json::from_value(value).map_err(|e| {
                    FeedError::InvalidMessage(format!("heartbeat payload: {e}"))
                })?)
            }
            "error" => StreamMessage::Error(parse_payload(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Connected => "connected",
            StreamMessage::Events(_) => "events",
            StreamMessage::Heartbeat(_) => "heartbeat",
            StreamMessage::Error(_) => "error",
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(event: &str, data: &str) -> FeedResult<T> {
    serde_json::from_str(data).map_err(|e| {
        FeedError::InvalidMessage(format!("{event} payload: {e} ({})", truncate(data)))
    })
}

fn truncate(data: &str) -> String {
    data.chars().take(100).collect()
}

/// Highest id in a batch, used to advance the poll cursor.
pub fn max_event_id(events: &[Event]) -> Option<EventId> {
    events.iter().map(|e| &e.event_id).max().cloned()
}
