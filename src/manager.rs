//! Queue manager: registration, heartbeats, fan-out and expiry.

use crate::bus::{BusSubscription, EventBus};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::poll::{PollCoordinator, PollRequest, PollResponse};
use crate::queues::{Decision, DeliveryFilter, InterestTarget, PushOutcome, QueueStore};
use crate::types::{Event, EventId, EventSequence, OwnerId, QueueId, Timestamp, TopicId};
use crossbeam_channel::{bounded, select, tick, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Returned to the client at registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub queue_id: QueueId,
    /// Cursor to start polling from.
    pub last_event_id: EventId,
}

/// What happened to one event during fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub event_id: EventId,
    /// Queues the event was appended to.
    pub delivered: usize,
    /// Queues skipped because their owner caused the event.
    pub excluded: usize,
    /// Matching queues that had already moved past this id. Each is flagged
    /// so its next poll signals catch-up.
    pub stale: usize,
}

/// Point-in-time view for health endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub timestamp: i64,
    pub active_queues: usize,
    pub pending_polls: usize,
    pub owners: usize,
    pub last_event_id: EventId,
    pub events_received: u64,
    pub deliveries: u64,
    pub queues_expired: u64,
}

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    deliveries: AtomicU64,
    queues_expired: AtomicU64,
}

/// Orchestrates the queue store, delivery filter and poll coordinator.
pub struct QueueManager {
    config: RelayConfig,
    store: Arc<QueueStore>,
    coordinator: PollCoordinator,
    filter: DeliveryFilter,
    sequence: Arc<EventSequence>,
    counters: Counters,
}

impl QueueManager {
    /// Create a manager sharing `sequence` with the publishing side.
    pub fn new(config: RelayConfig, sequence: Arc<EventSequence>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(QueueStore::new(config.buffer_capacity));
        let coordinator = PollCoordinator::new(
            Arc::clone(&store),
            config.poll_timeout(),
            config.duplicate_poll,
        );
        Ok(Self {
            config,
            store,
            coordinator,
            filter: DeliveryFilter,
            sequence,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    pub fn sequence(&self) -> &Arc<EventSequence> {
        &self.sequence
    }

    // --- Client operations ---

    /// Register an owner. An owner with a live queue gets it back with a
    /// refreshed heartbeat and the new interest set; otherwise a queue is
    /// created that only sees events published from now on.
    pub fn register(
        &self,
        owner_id: OwnerId,
        topics: impl IntoIterator<Item = TopicId>,
    ) -> Result<Registration> {
        let topics: BTreeSet<TopicId> = topics.into_iter().collect();
        if topics.is_empty() {
            return Err(RelayError::InvalidRegistration(format!(
                "owner {owner_id} registered without topics"
            )));
        }

        let start = self.sequence.current();
        let registered = self.store.create_or_reuse(owner_id, topics, start);
        Ok(Registration {
            queue_id: registered.queue_id,
            last_event_id: start,
        })
    }

    /// Keep a queue alive. Idempotent.
    pub fn heartbeat(&self, queue_id: QueueId) -> Result<()> {
        self.store.touch(queue_id).map_err(|e| {
            warn!(queue = %queue_id.short(), "Heartbeat for unknown queue");
            e
        })
    }

    /// Drop a queue now instead of waiting for expiry.
    pub fn deregister(&self, queue_id: QueueId) -> Result<()> {
        self.store.remove(queue_id)
    }

    /// Replace the interest set of a queue, or of an owner's live queue.
    /// Applies to events delivered from now on.
    pub fn update_interests(
        &self,
        target: InterestTarget,
        topics: impl IntoIterator<Item = TopicId>,
    ) -> Result<Option<QueueId>> {
        self.store
            .update_interests(target, topics.into_iter().collect())
    }

    /// Long-poll a queue. Blocks the calling thread for at most the poll
    /// timeout.
    pub fn poll(&self, request: PollRequest) -> Result<PollResponse> {
        self.coordinator.poll(request)
    }

    // --- Delivery ---

    /// Fan one event out to every matching queue and wake their polls.
    ///
    /// Only one queue lock is held at a time.
    pub fn deliver(&self, event: Event) -> DeliveryReport {
        self.sequence.observe(event.event_id);
        self.counters.events_received.fetch_add(1, Ordering::Relaxed);

        let event = Arc::new(event);
        let mut report = DeliveryReport {
            event_id: event.event_id,
            ..Default::default()
        };

        for handle in self.store.handles() {
            let mut queue = handle.lock();
            if queue.is_closed() {
                continue;
            }
            match self
                .filter
                .decide(queue.owner_id(), queue.interest_topics(), &event)
            {
                Decision::Deliver => match queue.push(Arc::clone(&event)) {
                    PushOutcome::Appended => report.delivered += 1,
                    PushOutcome::OutOfOrder => report.stale += 1,
                    // Registered while this id was in flight, or redelivered
                    PushOutcome::BeforeStart | PushOutcome::Duplicate => {
                        debug!(queue = %queue.id().short(), event_id = %event.event_id, "Skipping event the queue predates");
                    }
                },
                Decision::Excluded => {
                    debug!(owner = %queue.owner_id(), event_id = %event.event_id, "Excluding author");
                    report.excluded += 1;
                }
                Decision::NotRecipient | Decision::NotInterested => {}
            }
        }

        self.counters
            .deliveries
            .fetch_add(report.delivered as u64, Ordering::Relaxed);

        if report.stale > 0 {
            warn!(event_id = %event.event_id, stale = report.stale, "Event arrived out of order, flagged for catch-up");
        }
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            topics = ?event.topic_ids,
            delivered = report.delivered,
            excluded = report.excluded,
            "Delivered event"
        );
        report
    }

    /// Feed events from `bus` into this manager.
    pub fn listen(self: &Arc<Self>, bus: &dyn EventBus) -> Result<BusSubscription> {
        let manager = Arc::downgrade(self);
        let subscription = bus.subscribe(Arc::new(move |event: Event| {
            if let Some(manager) = manager.upgrade() {
                manager.deliver(event);
            }
        }))?;
        info!(bus = bus.name(), channel = %self.config.bus.channel, "Listening for events");
        Ok(subscription)
    }

    // --- Expiry ---

    /// Expire queues idle past TTL + grace as of `now`. Returns the count.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let expired = self.store.sweep(now, self.config.expiry_after());
        if !expired.is_empty() {
            self.counters
                .queues_expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            info!(count = expired.len(), remaining = self.store.len(), "Cleaned up expired queues");
        }
        expired.len()
    }

    /// Run `sweep` on a background thread every `sweep_interval`.
    pub fn start_sweeper(self: &Arc<Self>) -> Result<Sweeper> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(self.config.sweep_interval());
        let manager = Arc::downgrade(self);

        let worker = thread::Builder::new()
            .name("relay-sweeper".into())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => match manager.upgrade() {
                        Some(manager) => {
                            manager.sweep(Timestamp::now());
                        }
                        None => break,
                    },
                }
            })?;

        Ok(Sweeper {
            stop: Some(stop_tx),
            worker: Some(worker),
        })
    }

    // --- Introspection ---

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "healthy".to_string(),
            timestamp: Timestamp::now().0,
            active_queues: self.store.len(),
            pending_polls: self.store.pending_polls(),
            owners: self.store.owner_count(),
            last_event_id: self.sequence.current(),
            events_received: self.counters.events_received.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            queues_expired: self.counters.queues_expired.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the background sweeper. Dropping it stops the thread.
pub struct Sweeper {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the select
        self.stop.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, PublishRequest};
    use std::time::Duration;

    fn manager() -> QueueManager {
        QueueManager::new(RelayConfig::default(), Arc::new(EventSequence::new())).unwrap()
    }

    fn publish(manager: &QueueManager, request: PublishRequest) -> DeliveryReport {
        let id = manager.sequence().next();
        manager.deliver(request.into_event(id))
    }

    fn publish_with_id(manager: &QueueManager, id: EventId) -> DeliveryReport {
        manager.deliver(PublishRequest::new(EventType::NewComment, [TopicId(1)]).into_event(id))
    }

    #[test]
    fn test_register_requires_topics() {
        let manager = manager();
        let result = manager.register(OwnerId(1), Vec::<TopicId>::new());
        assert!(matches!(result, Err(RelayError::InvalidRegistration(_))));
    }

    #[test]
    fn test_register_starts_at_current_sequence() {
        let manager = manager();
        publish(&manager, PublishRequest::new(EventType::NewDiscussion, [TopicId(1)]));

        let registration = manager.register(OwnerId(1), [TopicId(1)]).unwrap();
        assert_eq!(registration.last_event_id, EventId(1));

        let handle = manager.store().get(registration.queue_id).unwrap();
        assert!(handle.lock().is_empty());
    }

    #[test]
    fn test_fan_out_counts() {
        let manager = manager();
        manager.register(OwnerId(1), [TopicId(1)]).unwrap();
        manager.register(OwnerId(2), [TopicId(1)]).unwrap();
        manager.register(OwnerId(3), [TopicId(2)]).unwrap();

        let report = publish(
            &manager,
            PublishRequest::new(EventType::NewComment, [TopicId(1)]).excluding(OwnerId(1)),
        );
        assert_eq!(report.delivered, 1);
        assert_eq!(report.excluded, 1);
        assert_eq!(report.stale, 0);
    }

    #[test]
    fn test_in_flight_event_at_registration_is_not_stale() {
        let manager = manager();
        // Id allocated but not yet delivered when the owner registers
        let in_flight = manager.sequence().next();
        let registration = manager.register(OwnerId(1), [TopicId(1)]).unwrap();
        assert_eq!(registration.last_event_id, in_flight);

        let report = manager.deliver(
            PublishRequest::new(EventType::NewComment, [TopicId(1)]).into_event(in_flight),
        );
        assert_eq!(report.delivered, 0);
        assert_eq!(report.stale, 0);

        let handle = manager.store().get(registration.queue_id).unwrap();
        assert!(!handle.lock().resync_pending());
    }

    #[test]
    fn test_out_of_order_event_counts_as_stale() {
        let manager = manager();
        let registration = manager.register(OwnerId(1), [TopicId(1)]).unwrap();
        let first = manager.sequence().next();
        let second = manager.sequence().next();

        publish_with_id(&manager, second);
        let report = publish_with_id(&manager, first);
        assert_eq!(report.stale, 1);
        assert_eq!(report.delivered, 0);

        let handle = manager.store().get(registration.queue_id).unwrap();
        assert!(handle.lock().resync_pending());
    }

    #[test]
    fn test_sweep_and_health() {
        let manager = manager();
        manager.register(OwnerId(1), [TopicId(1)]).unwrap();
        manager.register(OwnerId(2), [TopicId(1)]).unwrap();

        let health = manager.health();
        assert_eq!(health.active_queues, 2);
        assert_eq!(health.owners, 2);
        assert_eq!(health.pending_polls, 0);

        let later = Timestamp::now().saturating_add(Duration::from_secs(500));
        assert_eq!(manager.sweep(later), 2);
        let health = manager.health();
        assert_eq!(health.active_queues, 0);
        assert_eq!(health.queues_expired, 2);
    }

    #[test]
    fn test_sweeper_thread_stops() {
        let config = RelayConfig {
            sweep_interval_secs: 1,
            ..Default::default()
        };
        let manager = Arc::new(QueueManager::new(config, Arc::new(EventSequence::new())).unwrap());
        let sweeper = manager.start_sweeper().unwrap();
        sweeper.stop();
    }
}
