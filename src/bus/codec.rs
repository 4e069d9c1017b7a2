//! Encoding of events on the bus.

use crate::config::BusCodec;
use crate::error::{RelayError, Result};
use crate::types::{Event, EventId, EventSequence, EventType, OwnerId, Timestamp, TopicId};
use serde::Deserialize;
use std::collections::BTreeSet;

impl BusCodec {
    pub fn encode(&self, event: &Event) -> Result<Vec<u8>> {
        match self {
            BusCodec::Json => Ok(serde_json::to_vec(event)?),
            BusCodec::Msgpack => Ok(rmp_serde::to_vec_named(event)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<InboundEvent> {
        match self {
            BusCodec::Json => serde_json::from_slice(bytes)
                .map_err(|e| RelayError::Deserialization(e.to_string())),
            BusCodec::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

/// An event as read off the bus.
///
/// Besides the relay's own encoding this accepts the producer shape used by
/// the web tier, which sends `community_id`/`community_ids`, `data` and
/// `exclude_user_id`, and leaves `event_id` null for the relay to assign.
#[derive(Clone, Debug, Deserialize)]
pub struct InboundEvent {
    #[serde(default)]
    pub event_id: Option<EventId>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default, alias = "community_ids")]
    pub topic_ids: BTreeSet<TopicId>,

    #[serde(default, alias = "community_id")]
    pub topic_id: Option<TopicId>,

    #[serde(default)]
    pub recipient_ids: Option<BTreeSet<OwnerId>>,

    #[serde(default, alias = "exclude_user_id")]
    pub exclude_id: Option<OwnerId>,

    #[serde(default, alias = "data")]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub created_at: Option<Timestamp>,
}

impl InboundEvent {
    /// Complete the event, assigning an id from `sequence` when the producer
    /// left it out. Returns `None` for events with no scope at all.
    pub fn into_event(self, sequence: &EventSequence) -> Option<Event> {
        let mut topic_ids = self.topic_ids;
        if let Some(topic) = self.topic_id {
            topic_ids.insert(topic);
        }
        if topic_ids.is_empty() && self.recipient_ids.is_none() {
            return None;
        }

        let event_id = match self.event_id {
            Some(id) if id.0 > 0 => {
                sequence.observe(id);
                id
            }
            _ => sequence.next(),
        };

        Some(Event {
            event_id,
            event_type: self.event_type,
            topic_ids,
            recipient_ids: self.recipient_ids,
            exclude_id: self.exclude_id,
            payload: self.payload,
            created_at: self.created_at.unwrap_or_else(Timestamp::now),
        })
    }
}
