//! Queue store: the single owner of every per-subscriber queue.

use crate::error::{RelayError, Result};
use crate::poll::{Wake, Waiter};
use crate::types::{Event, EventId, OwnerId, QueueId, Timestamp, TopicId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Shared handle to one queue. Lock it only for the duration of an operation.
pub type QueueHandle = Arc<Mutex<Queue>>;

/// What `Queue::push` did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Appended,
    /// Already buffered.
    Duplicate,
    /// Allocated before the queue existed.
    BeforeStart,
    /// Arrived after a newer event. The next poll signals catch-up.
    OutOfOrder,
}

impl PushOutcome {
    pub fn is_appended(self) -> bool {
        self == PushOutcome::Appended
    }
}

/// Per-subscriber delivery context.
pub struct Queue {
    id: QueueId,
    owner_id: OwnerId,
    interest_topics: BTreeSet<TopicId>,
    /// Ascending by event id, oldest first.
    buffer: VecDeque<Arc<Event>>,
    capacity: usize,
    /// Highest id ever enqueued (or the global counter at creation).
    last_event_id: EventId,
    /// Highest id dropped from the buffer by eviction.
    evicted_through: EventId,
    /// Global counter at creation; older events were never meant for us.
    started_after: EventId,
    /// Set when an event was refused for arriving out of order.
    resync_pending: bool,
    last_heartbeat_at: Timestamp,
    created_at: Timestamp,
    /// At most one suspended poll.
    waiter: Option<Waiter>,
    /// Set once the queue has left the registry.
    closed: bool,
}

impl Queue {
    fn new(
        owner_id: OwnerId,
        interest_topics: BTreeSet<TopicId>,
        capacity: usize,
        start: EventId,
        now: Timestamp,
    ) -> Self {
        Self {
            id: QueueId::generate(),
            owner_id,
            interest_topics,
            buffer: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            last_event_id: start,
            evicted_through: EventId(0),
            started_after: start,
            resync_pending: false,
            last_heartbeat_at: now,
            created_at: now,
            waiter: None,
            closed: false,
        }
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    pub fn interest_topics(&self) -> &BTreeSet<TopicId> {
        &self.interest_topics
    }

    pub fn last_event_id(&self) -> EventId {
        self.last_event_id
    }

    pub fn last_heartbeat_at(&self) -> Timestamp {
        self.last_heartbeat_at
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn oldest_event_id(&self) -> Option<EventId> {
        self.buffer.front().map(|e| e.event_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending_poll(&self) -> bool {
        self.waiter.is_some()
    }

    /// Buffered events with `event_id > cursor`, ascending.
    pub fn events_after(&self, cursor: EventId) -> Vec<Arc<Event>> {
        let start = self.buffer.partition_point(|e| e.event_id <= cursor);
        self.buffer.range(start..).cloned().collect()
    }

    /// True when an event newer than `cursor` has already been evicted, so
    /// gap-free delivery from `cursor` is impossible.
    pub fn has_gap(&self, cursor: EventId) -> bool {
        self.evicted_through > cursor
    }

    /// True once an out-of-order event has been refused and no poll has
    /// signalled catch-up for it yet.
    pub fn resync_pending(&self) -> bool {
        self.resync_pending
    }

    pub(crate) fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.resync_pending)
    }

    /// Append to the tail, evicting the oldest entry at capacity, and wake
    /// the suspended poll if any.
    ///
    /// Events not newer than `last_event_id` are refused so the buffer stays
    /// ordered. A refused event that postdates the queue cannot be delivered
    /// any more, so the queue is flagged for catch-up and its poll woken.
    pub(crate) fn push(&mut self, event: Arc<Event>) -> PushOutcome {
        let id = event.event_id;
        if id <= self.last_event_id {
            if id <= self.started_after {
                return PushOutcome::BeforeStart;
            }
            if self.buffer.binary_search_by_key(&id, |e| e.event_id).is_ok() {
                return PushOutcome::Duplicate;
            }
            self.resync_pending = true;
            if let Some(ref waiter) = self.waiter {
                waiter.notify(Wake::Event);
            }
            return PushOutcome::OutOfOrder;
        }

        if self.buffer.len() >= self.capacity {
            if let Some(evicted) = self.buffer.pop_front() {
                self.evicted_through = evicted.event_id;
            }
        }

        self.last_event_id = event.event_id;
        self.buffer.push_back(event);

        if let Some(ref waiter) = self.waiter {
            waiter.notify(Wake::Event);
        }
        PushOutcome::Appended
    }

    pub(crate) fn touch(&mut self, now: Timestamp) {
        if now > self.last_heartbeat_at {
            self.last_heartbeat_at = now;
        }
    }

    pub(crate) fn set_interests(&mut self, topics: BTreeSet<TopicId>) {
        self.interest_topics = topics;
    }

    fn close(&mut self) {
        self.closed = true;
        if let Some(waiter) = self.waiter.take() {
            waiter.notify(Wake::Expired);
        }
    }

    // --- Waiter slot ---

    pub(crate) fn waiter(&self) -> Option<&Waiter> {
        self.waiter.as_ref()
    }

    pub(crate) fn has_waiter(&self, ticket: u64) -> bool {
        self.waiter.as_ref().is_some_and(|w| w.ticket() == ticket)
    }

    pub(crate) fn set_waiter(&mut self, waiter: Waiter) {
        self.waiter = Some(waiter);
    }

    /// Remove the waiter only if it still belongs to `ticket`.
    pub(crate) fn clear_waiter(&mut self, ticket: u64) {
        if self.has_waiter(ticket) {
            self.waiter = None;
        }
    }
}

/// Who an interest update is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterestTarget {
    Queue(QueueId),
    Owner(OwnerId),
}

/// Result of `create_or_reuse`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registered {
    pub queue_id: QueueId,
    /// False when the owner's live queue was handed back.
    pub created: bool,
}

/// A queue removed by `sweep`.
#[derive(Clone, Debug)]
pub struct ExpiredQueue {
    pub queue_id: QueueId,
    pub owner_id: OwnerId,
    pub idle: Duration,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<QueueId, QueueHandle>,
    by_owner: HashMap<OwnerId, QueueId>,
}

impl Registry {
    fn insert(&mut self, queue: Queue) -> QueueId {
        let id = queue.id;
        self.by_owner.insert(queue.owner_id, id);
        self.queues.insert(id, Arc::new(Mutex::new(queue)));
        id
    }

    fn remove(&mut self, id: QueueId) -> Option<QueueHandle> {
        let handle = self.queues.remove(&id)?;
        let owner = handle.lock().owner_id;
        if self.by_owner.get(&owner) == Some(&id) {
            self.by_owner.remove(&owner);
        }
        Some(handle)
    }
}

/// Registry of queues keyed by id, with an owner index.
///
/// Lock order: the registry lock may be held while taking one queue lock,
/// never the other way round, and no operation holds two queue locks.
pub struct QueueStore {
    registry: RwLock<Registry>,
    capacity: usize,
}

impl QueueStore {
    /// Create a store whose queues buffer `capacity` events each.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a new queue starting after `start`. Becomes the owner's
    /// current queue.
    pub fn create(
        &self,
        owner_id: OwnerId,
        interest_topics: BTreeSet<TopicId>,
        start: EventId,
    ) -> QueueId {
        let queue = Queue::new(owner_id, interest_topics, self.capacity, start, Timestamp::now());
        let id = self.registry.write().insert(queue);
        info!(queue = %id.short(), owner = %owner_id, "Created queue");
        id
    }

    /// Hand back the owner's live queue (refreshing heartbeat and replacing
    /// interests) or create one.
    pub fn create_or_reuse(
        &self,
        owner_id: OwnerId,
        interest_topics: BTreeSet<TopicId>,
        start: EventId,
    ) -> Registered {
        let mut registry = self.registry.write();

        if let Some(id) = registry.by_owner.get(&owner_id).copied() {
            if let Some(handle) = registry.queues.get(&id) {
                let mut queue = handle.lock();
                queue.touch(Timestamp::now());
                queue.set_interests(interest_topics);
                info!(queue = %id.short(), owner = %owner_id, "Reusing existing queue");
                return Registered {
                    queue_id: id,
                    created: false,
                };
            }
            // Mapping outlived its queue
            registry.by_owner.remove(&owner_id);
        }

        let queue = Queue::new(owner_id, interest_topics, self.capacity, start, Timestamp::now());
        let id = registry.insert(queue);
        info!(queue = %id.short(), owner = %owner_id, "Created queue");
        Registered {
            queue_id: id,
            created: true,
        }
    }

    pub fn get(&self, id: QueueId) -> Result<QueueHandle> {
        self.registry
            .read()
            .queues
            .get(&id)
            .cloned()
            .ok_or(RelayError::QueueExpired(id))
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.registry.read().queues.contains_key(&id)
    }

    pub fn find_by_owner(&self, owner_id: OwnerId) -> Option<QueueId> {
        let registry = self.registry.read();
        registry
            .by_owner
            .get(&owner_id)
            .copied()
            .filter(|id| registry.queues.contains_key(id))
    }

    /// Push an event into one queue.
    pub fn append(&self, id: QueueId, event: Arc<Event>) -> Result<PushOutcome> {
        let handle = self.get(id)?;
        let mut queue = handle.lock();
        if queue.closed {
            return Err(RelayError::QueueExpired(id));
        }
        Ok(queue.push(event))
    }

    /// Refresh the liveness timestamp.
    pub fn touch(&self, id: QueueId) -> Result<()> {
        let handle = self.get(id)?;
        let mut queue = handle.lock();
        if queue.closed {
            return Err(RelayError::QueueExpired(id));
        }
        queue.touch(Timestamp::now());
        debug!(queue = %id.short(), "Heartbeat");
        Ok(())
    }

    /// Replace the interest set. Already-buffered events are kept.
    ///
    /// Returns the queue that was updated, or `None` when the owner has no
    /// live queue.
    pub fn update_interests(
        &self,
        target: InterestTarget,
        topics: BTreeSet<TopicId>,
    ) -> Result<Option<QueueId>> {
        let id = match target {
            InterestTarget::Queue(id) => id,
            InterestTarget::Owner(owner) => match self.find_by_owner(owner) {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let handle = self.get(id)?;
        let mut queue = handle.lock();
        if queue.closed {
            return Err(RelayError::QueueExpired(id));
        }
        debug!(queue = %id.short(), topics = ?topics, "Updated interests");
        queue.set_interests(topics);
        Ok(Some(id))
    }

    /// Remove a queue, waking its suspended poll.
    pub fn remove(&self, id: QueueId) -> Result<()> {
        let handle = self
            .registry
            .write()
            .remove(id)
            .ok_or(RelayError::QueueExpired(id))?;
        handle.lock().close();
        info!(queue = %id.short(), "Removed queue");
        Ok(())
    }

    /// Remove every queue idle for longer than `expire_after` as of `now`.
    ///
    /// Candidates are found under the read lock; each is re-checked under
    /// the write lock so a heartbeat that lands in between keeps the queue.
    pub fn sweep(&self, now: Timestamp, expire_after: Duration) -> Vec<ExpiredQueue> {
        let is_expired = |queue: &Queue| now.since(queue.last_heartbeat_at) > expire_after;

        let candidates: Vec<QueueId> = {
            let registry = self.registry.read();
            registry
                .queues
                .iter()
                .filter(|(_, handle)| is_expired(&handle.lock()))
                .map(|(id, _)| *id)
                .collect()
        };

        if candidates.is_empty() {
            return Vec::new();
        }

        let mut expired = Vec::with_capacity(candidates.len());
        let mut registry = self.registry.write();
        for id in candidates {
            let still_idle = match registry.queues.get(&id) {
                Some(handle) => is_expired(&handle.lock()),
                None => false,
            };
            if !still_idle {
                continue;
            }
            if let Some(handle) = registry.remove(id) {
                let mut queue = handle.lock();
                let idle = now.since(queue.last_heartbeat_at);
                queue.close();
                info!(
                    queue = %id.short(),
                    owner = %queue.owner_id,
                    idle_secs = idle.as_secs(),
                    "Expired idle queue"
                );
                expired.push(ExpiredQueue {
                    queue_id: id,
                    owner_id: queue.owner_id,
                    idle,
                });
            }
        }
        expired
    }

    /// Clone every handle under a short read lock, for fan-out.
    pub fn handles(&self) -> Vec<QueueHandle> {
        self.registry.read().queues.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry.read().queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn owner_count(&self) -> usize {
        self.registry.read().by_owner.len()
    }

    /// Number of queues with a suspended poll.
    pub fn pending_polls(&self) -> usize {
        self.handles()
            .iter()
            .filter(|handle| handle.lock().has_pending_poll())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventType, PublishRequest};

    fn topics(ids: &[u64]) -> BTreeSet<TopicId> {
        ids.iter().copied().map(TopicId).collect()
    }

    fn make_event(id: u64) -> Arc<Event> {
        Arc::new(PublishRequest::new(EventType::NewComment, [TopicId(1)]).into_event(EventId(id)))
    }

    #[test]
    fn test_create_and_get() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(5));

        let handle = store.get(id).unwrap();
        let queue = handle.lock();
        assert_eq!(queue.owner_id(), OwnerId(1));
        assert_eq!(queue.last_event_id(), EventId(5));
        assert!(queue.is_empty());
        assert_eq!(store.find_by_owner(OwnerId(1)), Some(id));
    }

    #[test]
    fn test_get_unknown_is_expired() {
        let store = QueueStore::new(10);
        let missing = QueueId::generate();
        assert!(matches!(store.get(missing), Err(RelayError::QueueExpired(id)) if id == missing));
        assert!(matches!(store.touch(missing), Err(RelayError::QueueExpired(_))));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let store = QueueStore::new(3);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(0));

        for i in 1..=5 {
            assert!(store.append(id, make_event(i)).unwrap().is_appended());
        }

        let handle = store.get(id).unwrap();
        let queue = handle.lock();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.oldest_event_id(), Some(EventId(3)));
        assert_eq!(queue.last_event_id(), EventId(5));
        assert!(queue.has_gap(EventId(0)));
        assert!(queue.has_gap(EventId(1)));
        assert!(!queue.has_gap(EventId(2)));
    }

    #[test]
    fn test_events_after_cursor() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(0));
        for i in [2, 4, 7] {
            store.append(id, make_event(i)).unwrap();
        }

        let handle = store.get(id).unwrap();
        let queue = handle.lock();
        let ids: Vec<u64> = queue.events_after(EventId(3)).iter().map(|e| e.event_id.0).collect();
        assert_eq!(ids, vec![4, 7]);
        assert!(queue.events_after(EventId(7)).is_empty());
        // Sparse ids are not a gap
        assert!(!queue.has_gap(EventId(0)));
    }

    #[test]
    fn test_out_of_order_refused() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(3));

        // Allocated before the queue existed
        assert_eq!(store.append(id, make_event(2)).unwrap(), PushOutcome::BeforeStart);
        assert_eq!(store.append(id, make_event(3)).unwrap(), PushOutcome::BeforeStart);
        assert_eq!(store.append(id, make_event(4)).unwrap(), PushOutcome::Appended);
        assert_eq!(store.append(id, make_event(4)).unwrap(), PushOutcome::Duplicate);

        let handle = store.get(id).unwrap();
        assert!(!handle.lock().resync_pending());
    }

    #[test]
    fn test_late_event_flags_resync() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(0));

        assert!(store.append(id, make_event(2)).unwrap().is_appended());
        assert_eq!(store.append(id, make_event(1)).unwrap(), PushOutcome::OutOfOrder);

        let handle = store.get(id).unwrap();
        let mut queue = handle.lock();
        assert!(queue.resync_pending());
        assert_eq!(queue.events_after(EventId(0)).len(), 1);
        assert!(queue.take_resync());
        assert!(!queue.resync_pending());
    }

    #[test]
    fn test_create_or_reuse() {
        let store = QueueStore::new(10);
        let first = store.create_or_reuse(OwnerId(1), topics(&[1]), EventId(0));
        assert!(first.created);

        let second = store.create_or_reuse(OwnerId(1), topics(&[2, 3]), EventId(9));
        assert!(!second.created);
        assert_eq!(first.queue_id, second.queue_id);
        assert_eq!(store.len(), 1);

        let handle = store.get(first.queue_id).unwrap();
        assert_eq!(handle.lock().interest_topics(), &topics(&[2, 3]));
    }

    #[test]
    fn test_update_interests_by_owner() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(4), topics(&[1]), EventId(0));

        let updated = store
            .update_interests(InterestTarget::Owner(OwnerId(4)), topics(&[8]))
            .unwrap();
        assert_eq!(updated, Some(id));

        let none = store
            .update_interests(InterestTarget::Owner(OwnerId(5)), topics(&[8]))
            .unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_remove_clears_owner_mapping() {
        let store = QueueStore::new(10);
        let id = store.create(OwnerId(1), topics(&[1]), EventId(0));
        let handle = store.get(id).unwrap();

        store.remove(id).unwrap();
        assert!(handle.lock().is_closed());
        assert_eq!(store.find_by_owner(OwnerId(1)), None);
        assert_eq!(store.owner_count(), 0);
        assert!(matches!(store.remove(id), Err(RelayError::QueueExpired(_))));
    }

    #[test]
    fn test_sweep_expires_idle_queues() {
        let store = QueueStore::new(10);
        let idle = store.create(OwnerId(1), topics(&[1]), EventId(0));
        let ttl = Duration::from_secs(120);

        // Nothing is idle yet
        assert!(store.sweep(Timestamp::now(), ttl).is_empty());

        let later = Timestamp::now().saturating_add(Duration::from_secs(121));
        let expired = store.sweep(later, ttl);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].queue_id, idle);
        assert_eq!(expired[0].owner_id, OwnerId(1));
        assert!(store.is_empty());
        assert!(matches!(store.touch(idle), Err(RelayError::QueueExpired(_))));
    }
}
