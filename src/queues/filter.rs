//! Delivery policy: decides whether an event belongs in a queue.

use crate::types::{Event, OwnerId, TopicId};
use std::collections::BTreeSet;

/// Outcome of checking one event against one queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Deliver,
    /// The owner is the event's excluded actor.
    Excluded,
    /// The event has an allow-list and the owner is not on it.
    NotRecipient,
    /// No overlap between the queue's interests and the event's topics.
    NotInterested,
}

impl Decision {
    pub fn is_deliver(self) -> bool {
        self == Decision::Deliver
    }
}

/// The single precedence rule used for fan-out.
///
/// Exclusion wins over everything. An explicit recipient list is
/// authoritative when present and topic membership is then not checked.
/// Otherwise the queue must share at least one topic with the event.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeliveryFilter;

impl DeliveryFilter {
    pub fn decide(&self, owner: OwnerId, interests: &BTreeSet<TopicId>, event: &Event) -> Decision {
        if event.exclude_id == Some(owner) {
            return Decision::Excluded;
        }

        match event.recipient_ids {
            Some(ref recipients) => {
                if recipients.contains(&owner) {
                    Decision::Deliver
                } else {
                    Decision::NotRecipient
                }
            }
            None => {
                // Iterate the smaller set
                let overlaps = if interests.len() <= event.topic_ids.len() {
                    interests.iter().any(|t| event.topic_ids.contains(t))
                } else {
                    event.topic_ids.iter().any(|t| interests.contains(t))
                };
                if overlaps {
                    Decision::Deliver
                } else {
                    Decision::NotInterested
                }
            }
        }
    }

    pub fn matches(&self, owner: OwnerId, interests: &BTreeSet<TopicId>, event: &Event) -> bool {
        self.decide(owner, interests, event).is_deliver()
    }
}
