//! Core types for the relay.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Process-wide event identifier. Zero means "nothing seen yet".
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token handed to a client at registration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub Uuid);

impl QueueId {
    pub fn generate() -> Self {
        QueueId(Uuid::new_v4())
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueId({}...)", self.short())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(QueueId)
    }
}

/// Identity of the subscriber that owns a queue.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u64);

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broadcast scope of an event (a community, in practice).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(pub u64);

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", self.0)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time. A clock before the epoch reads as zero.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn since(self, earlier: Timestamp) -> Duration {
        let micros = self.0.saturating_sub(earlier.0).max(0);
        Duration::from_micros(micros as u64)
    }

    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of domain change an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewDiscussion,
    NewComment,
    UpdatedDiscussion,
    UpdatedComment,
    DeletedDiscussion,
    DeletedComment,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::NewDiscussion => "new_discussion",
            EventType::NewComment => "new_comment",
            EventType::UpdatedDiscussion => "updated_discussion",
            EventType::UpdatedComment => "updated_comment",
            EventType::DeletedDiscussion => "deleted_discussion",
            EventType::DeletedComment => "deleted_comment",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event. Immutable once it has an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Assigned at publish time.
    pub event_id: EventId,

    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Topics that define the broadcast scope.
    pub topic_ids: BTreeSet<TopicId>,

    /// Explicit allow-list. When present, topic membership is ignored.
    pub recipient_ids: Option<BTreeSet<OwnerId>>,

    /// Usually the actor that caused the event.
    pub exclude_id: Option<OwnerId>,

    /// Type-specific body.
    pub payload: serde_json::Value,

    pub created_at: Timestamp,
}

impl Event {
    /// Build the client-facing shape:
    /// `{event_id, type, timestamp, data: {..payload, topic_ids, topic_id?, recipient_ids?}}`.
    pub fn to_wire(&self) -> WireEvent {
        let mut data = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };

        let topics: Vec<u64> = self.topic_ids.iter().map(|t| t.0).collect();
        if topics.len() == 1 {
            data.insert("topic_id".to_string(), topics[0].into());
        }
        data.insert("topic_ids".to_string(), topics.into());

        if let Some(ref recipients) = self.recipient_ids {
            let ids: Vec<u64> = recipients.iter().map(|o| o.0).collect();
            data.insert("recipient_ids".to_string(), ids.into());
        }

        WireEvent {
            event_id: self.event_id,
            event_type: self.event_type,
            timestamp: self.created_at.0,
            data: serde_json::Value::Object(data),
        }
    }
}

/// Event as returned to polling clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    pub event_id: EventId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: i64,
    pub data: serde_json::Value,
}

/// Input for publishing (before id/timestamp assigned).
#[derive(Clone, Debug)]
pub struct PublishRequest {
    pub event_type: EventType,
    pub topic_ids: BTreeSet<TopicId>,
    pub recipient_ids: Option<BTreeSet<OwnerId>>,
    pub exclude_id: Option<OwnerId>,
    pub payload: serde_json::Value,
}

impl PublishRequest {
    pub fn new(event_type: EventType, topic_ids: impl IntoIterator<Item = TopicId>) -> Self {
        Self {
            event_type,
            topic_ids: topic_ids.into_iter().collect(),
            recipient_ids: None,
            exclude_id: None,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach a serializable payload.
    pub fn with_payload(mut self, payload: &impl Serialize) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Narrow delivery to exactly these owners.
    pub fn with_recipients(mut self, recipients: impl IntoIterator<Item = OwnerId>) -> Self {
        self.recipient_ids = Some(recipients.into_iter().collect());
        self
    }

    /// Never deliver to this owner.
    pub fn excluding(mut self, owner: OwnerId) -> Self {
        self.exclude_id = Some(owner);
        self
    }

    /// Stamp with an id and the current time.
    pub fn into_event(self, event_id: EventId) -> Event {
        Event {
            event_id,
            event_type: self.event_type,
            topic_ids: self.topic_ids,
            recipient_ids: self.recipient_ids,
            exclude_id: self.exclude_id,
            payload: self.payload,
            created_at: Timestamp::now(),
        }
    }
}

/// Monotonic event id counter shared by publishers and the queue manager.
#[derive(Debug, Default)]
pub struct EventSequence {
    last: AtomicU64,
}

impl EventSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id.
    pub fn next(&self) -> EventId {
        EventId(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Highest id allocated or observed so far.
    pub fn current(&self) -> EventId {
        EventId(self.last.load(Ordering::SeqCst))
    }

    /// Record an id allocated elsewhere (e.g. by the bus) so that new
    /// queues start after it.
    pub fn observe(&self, id: EventId) {
        self.last.fetch_max(id.0, Ordering::SeqCst);
    }
}
