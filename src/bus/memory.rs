//! In-process bus: one bounded channel and dispatch thread per subscriber.

use super::{BusSubscription, EventBus, EventHandler};
use crate::config::{BusCodec, BusConfig};
use crate::error::{RelayError, Result};
use crate::types::{Event, EventSequence};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

struct Subscriber {
    id: u64,
    sender: Sender<Vec<u8>>,
}

#[derive(Default)]
struct Shared {
    subscribers: RwLock<Vec<Subscriber>>,
    closed: AtomicBool,
}

impl Shared {
    fn remove(&self, id: u64) {
        self.subscribers.write().retain(|s| s.id != id);
    }
}

/// Bus for single-process deployments and tests.
///
/// Publishing never blocks: a subscriber whose backlog is full misses the
/// event (with a warning) rather than stalling the producer.
pub struct InMemoryBus {
    shared: Arc<Shared>,
    codec: BusCodec,
    capacity: usize,
    sequence: Arc<EventSequence>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new(config: &BusConfig, sequence: Arc<EventSequence>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            codec: config.codec,
            capacity: config.channel_capacity.max(1),
            sequence,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    /// Hand already-encoded bytes to every subscriber, as an external
    /// producer would. Returns how many subscribers accepted them.
    pub fn publish_raw(&self, bytes: Vec<u8>) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RelayError::BusUnavailable("bus closed".into()));
        }

        let subscribers = self.shared.subscribers.read();
        let mut accepted = 0;
        for sub in subscribers.iter() {
            match sub.sender.try_send(bytes.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = sub.id, "Subscriber backlog full, event dropped");
                }
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        Ok(accepted)
    }

    /// Stop accepting events and release every subscriber.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.subscribers.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl EventBus for InMemoryBus {
    fn publish(&self, event: &Event) -> Result<usize> {
        let bytes = self.codec.encode(event)?;
        self.publish_raw(bytes)
    }

    fn subscribe(&self, handler: EventHandler) -> Result<BusSubscription> {
        if self.is_closed() {
            return Err(RelayError::BusUnavailable("bus closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded::<Vec<u8>>(self.capacity);
        let codec = self.codec;
        let sequence = Arc::clone(&self.sequence);

        let worker = thread::Builder::new()
            .name(format!("relay-bus-{id}"))
            .spawn(move || {
                // Ends once the sender is removed from the subscriber list
                for bytes in receiver.iter() {
                    match codec.decode(&bytes) {
                        Ok(inbound) => match inbound.into_event(&sequence) {
                            Some(event) => handler(event),
                            None => warn!("Event without topics or recipients ignored"),
                        },
                        Err(e) => warn!(error = %e, "Undecodable bus message dropped"),
                    }
                }
                debug!(subscriber = id, "Bus dispatch stopped");
            })?;

        self.shared.subscribers.write().push(Subscriber { id, sender });
        debug!(subscriber = id, "Bus subscriber added");

        let shared = Arc::clone(&self.shared);
        Ok(BusSubscription::new(
            id,
            Box::new(move || shared.remove(id)),
            Some(worker),
        ))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
