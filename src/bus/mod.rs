//! Event bus adapter.
//!
//! Decouples the producing tier from the delivery tier:
//! - [`EventPublisher`] stamps requests with an id and hands them to a bus
//! - [`EventBus`] implementations move encoded events between the two
//! - subscribers receive decoded events on a dispatch thread, in bus order
//!
//! Publishing is best-effort from the producer's point of view. A bus that
//! cannot be reached fails with `BusUnavailable`, which callers log and
//! otherwise ignore so their own write still commits.
//!
//! # Example
//!
//! ```ignore
//! let sequence = Arc::new(EventSequence::new());
//! let bus = Arc::new(InMemoryBus::new(&BusConfig::default(), Arc::clone(&sequence)));
//! let publisher = EventPublisher::new(bus.clone(), sequence);
//!
//! let request = PublishRequest::new(EventType::NewComment, [TopicId(3)])
//!     .with_payload(&json!({"comment_id": 10}))?
//!     .excluding(OwnerId(42));
//! publisher.publish_best_effort(request);
//! ```

mod codec;
mod memory;
#[cfg(feature = "redis-bus")]
mod redis_bus;

pub use codec::InboundEvent;
pub use memory::InMemoryBus;
#[cfg(feature = "redis-bus")]
pub use redis_bus::RedisBus;

use crate::error::Result;
use crate::types::{Event, EventId, EventSequence, PublishRequest};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Callback invoked once per received event.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Transport between producers and the queue manager.
pub trait EventBus: Send + Sync {
    /// Allocate the id for a new event. Buses with their own sequence
    /// override this; the default draws from the local counter.
    fn next_event_id(&self, local: &EventSequence) -> Result<EventId> {
        Ok(local.next())
    }

    /// Encode and hand off an event. Returns how many receivers it reached.
    fn publish(&self, event: &Event) -> Result<usize>;

    /// Register a handler. Events reach it in the order the bus delivers
    /// them, until the returned subscription is dropped.
    fn subscribe(&self, handler: EventHandler) -> Result<BusSubscription>;

    /// Short transport name for logs.
    fn name(&self) -> &'static str;
}

/// Live registration of a handler on a bus.
///
/// Dropping it stops delivery; `unsubscribe` additionally waits for the
/// dispatch thread to finish.
pub struct BusSubscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
    worker: Option<JoinHandle<()>>,
}

impl BusSubscription {
    pub(crate) fn new(
        id: u64,
        cancel: Box<dyn FnOnce() + Send>,
        worker: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            cancel: Some(cancel),
            worker,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery and join the dispatch thread.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSubscription").field("id", &self.id).finish()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Producer-side entry point.
pub struct EventPublisher {
    bus: Arc<dyn EventBus>,
    sequence: Arc<EventSequence>,
    /// Keeps id allocation and hand-off in the same order.
    publish_lock: Mutex<()>,
    published: AtomicU64,
    failed: AtomicU64,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn EventBus>, sequence: Arc<EventSequence>) -> Self {
        Self {
            bus,
            sequence,
            publish_lock: Mutex::new(()),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Assign an id and publish. Fails with `BusUnavailable` when the bus
    /// cannot take the event.
    pub fn publish(&self, request: PublishRequest) -> Result<EventId> {
        let result = {
            let _lock = self.publish_lock.lock();
            self.bus
                .next_event_id(&self.sequence)
                .map(|id| request.into_event(id))
                .and_then(|event| self.bus.publish(&event).map(|receivers| (event, receivers)))
        };

        match result {
            Ok((event, receivers)) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    topics = ?event.topic_ids,
                    receivers,
                    bus = self.bus.name(),
                    "Published event"
                );
                Ok(event.event_id)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Publish, logging and swallowing any failure.
    pub fn publish_best_effort(&self, request: PublishRequest) -> Option<EventId> {
        let event_type = request.event_type;
        match self.publish(request) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(event_type = %event_type, error = %e, "Failed to publish event");
                None
            }
        }
    }

    pub fn events_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn events_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
