//! Long-poll coordinator.
//!
//! A poll resolves immediately when the queue already holds events newer
//! than the client's cursor. Otherwise the calling thread parks on a
//! per-request wake channel registered in the queue's waiter slot until an
//! event is appended, the deadline passes, the poll is cancelled, or the
//! queue goes away.
//!
//! ```text
//! ARRIVED ──▶ RESOLVED_IMMEDIATE
//!    │
//!    └──▶ SUSPENDED ──▶ RESOLVED_EVENT
//!             ├──────▶ RESOLVED_EMPTY   (deadline)
//!             ├──────▶ PREEMPTED        (newer poll on same queue)
//!             └──────▶ CANCELLED        (client went away)
//! ```

use crate::error::{RelayError, Result};
use crate::queues::{QueueHandle, QueueStore};
use crate::types::{Event, EventId, QueueId, Timestamp, WireEvent};
use crossbeam_channel::{at, bounded, never, select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Handling of a second concurrent poll on a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePollPolicy {
    /// Resolve the earlier poll with an empty response; the newer one waits.
    #[default]
    Preempt,
    /// Fail the newer poll with `DuplicatePoll`.
    Reject,
}

/// Signal delivered to a suspended poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Wake {
    Event,
    Preempted,
    Expired,
}

/// Registration of a suspended poll in its queue.
pub(crate) struct Waiter {
    ticket: u64,
    sender: Sender<Wake>,
}

impl Waiter {
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Never blocks; a wake already pending is enough.
    pub(crate) fn notify(&self, wake: Wake) {
        let _ = self.sender.try_send(wake);
    }
}

/// Cancels a suspended poll. Dropping the handle cancels as well, which is
/// how a dropped client connection should be reported.
pub struct PollCancel {
    sender: Sender<()>,
}

impl PollCancel {
    pub fn cancel(&self) {
        let _ = self.sender.try_send(());
    }
}

/// One poll call.
pub struct PollRequest {
    pub queue_id: QueueId,
    /// Highest event id the client already has.
    pub cursor: EventId,
    /// Shortens the configured poll timeout. Longer values are capped at it.
    pub timeout: Option<Duration>,
    cancel: Option<Receiver<()>>,
}

impl PollRequest {
    pub fn new(queue_id: QueueId, cursor: EventId) -> Self {
        Self {
            queue_id,
            cursor,
            timeout: None,
            cancel: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation handle.
    pub fn cancellable(mut self) -> (Self, PollCancel) {
        let (sender, receiver) = bounded(1);
        self.cancel = Some(receiver);
        (self, PollCancel { sender })
    }
}

/// How a poll was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Events were already buffered on arrival.
    Immediate,
    /// Events arrived while suspended.
    Event,
    /// Deadline passed with nothing new.
    Timeout,
    /// A newer poll on the same queue took over.
    Preempted,
    Cancelled,
    /// Cursor fell behind retained history.
    CatchupRequired,
}

/// Result of a poll.
#[derive(Clone, Debug)]
pub struct PollResponse {
    /// Ascending by event id.
    pub events: Vec<Arc<Event>>,
    /// Cursor the client should send next.
    pub last_event_id: EventId,
    /// The client must resynchronize from the system of record and continue
    /// from `last_event_id`.
    pub catchup_required: bool,
    pub resolution: Resolution,
}

impl PollResponse {
    fn empty(cursor: EventId, resolution: Resolution) -> Self {
        Self {
            events: Vec::new(),
            last_event_id: cursor,
            catchup_required: false,
            resolution,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.event_id).collect()
    }

    /// Client-facing body: `{events, last_event_id, catchup_required}`.
    pub fn to_wire(&self) -> WirePollResponse {
        WirePollResponse {
            events: self.events.iter().map(|e| e.to_wire()).collect(),
            last_event_id: self.last_event_id,
            catchup_required: self.catchup_required,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WirePollResponse {
    pub events: Vec<WireEvent>,
    pub last_event_id: EventId,
    #[serde(default)]
    pub catchup_required: bool,
}

/// Clears the waiter slot on every exit path of the suspended phase.
struct WaiterGuard<'a> {
    handle: &'a QueueHandle,
    ticket: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.handle.lock().clear_waiter(self.ticket);
    }
}

/// Services poll requests against a queue store.
pub struct PollCoordinator {
    store: Arc<QueueStore>,
    default_timeout: Duration,
    policy: DuplicatePollPolicy,
    next_ticket: AtomicU64,
}

impl PollCoordinator {
    pub fn new(store: Arc<QueueStore>, default_timeout: Duration, policy: DuplicatePollPolicy) -> Self {
        Self {
            store,
            default_timeout,
            policy,
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> DuplicatePollPolicy {
        self.policy
    }

    /// Serve one poll, suspending the calling thread if nothing is ready.
    ///
    /// Fails with `QueueExpired` for unknown queues (or queues removed while
    /// suspended) and with `DuplicatePoll` under the reject policy. Every
    /// pass over the queue refreshes its heartbeat.
    pub fn poll(&self, request: PollRequest) -> Result<PollResponse> {
        let PollRequest {
            queue_id,
            cursor,
            timeout,
            cancel,
        } = request;

        let handle = self.store.get(queue_id)?;
        // Capped so a suspended poll cannot outlive the queue TTL
        let timeout = timeout.map_or(self.default_timeout, |t| t.min(self.default_timeout));
        let deadline = Instant::now().checked_add(timeout);
        let timer = deadline.map_or_else(never, at);
        let cancel = cancel.unwrap_or_else(never);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (wake_tx, wake_rx) = bounded::<Wake>(1);
        let mut resolution = Resolution::Immediate;
        let _guard = WaiterGuard {
            handle: &handle,
            ticket,
        };

        loop {
            {
                let mut queue = handle.lock();
                if queue.is_closed() {
                    return Err(RelayError::QueueExpired(queue_id));
                }
                queue.touch(Timestamp::now());

                if queue.take_resync() || queue.has_gap(cursor) {
                    debug!(queue = %queue_id.short(), cursor = %cursor, "Cursor behind retained history");
                    return Ok(PollResponse {
                        events: Vec::new(),
                        last_event_id: queue.last_event_id(),
                        catchup_required: true,
                        resolution: Resolution::CatchupRequired,
                    });
                }

                let events = queue.events_after(cursor);
                if let Some(last) = events.last() {
                    let last_event_id = last.event_id;
                    return Ok(PollResponse {
                        events,
                        last_event_id,
                        catchup_required: false,
                        resolution,
                    });
                }

                if !queue.has_waiter(ticket) {
                    if let Some(existing) = queue.waiter() {
                        match self.policy {
                            DuplicatePollPolicy::Reject => {
                                return Err(RelayError::DuplicatePoll(queue_id));
                            }
                            DuplicatePollPolicy::Preempt => {
                                debug!(queue = %queue_id.short(), "Preempting earlier poll");
                                existing.notify(Wake::Preempted);
                            }
                        }
                    }
                    queue.set_waiter(Waiter {
                        ticket,
                        sender: wake_tx.clone(),
                    });
                }
            }

            if deadline.is_some_and(|d| d <= Instant::now()) {
                return Ok(PollResponse::empty(cursor, Resolution::Timeout));
            }

            select! {
                recv(wake_rx) -> wake => match wake {
                    Ok(Wake::Event) => {
                        resolution = Resolution::Event;
                    }
                    Ok(Wake::Preempted) => {
                        return Ok(PollResponse::empty(cursor, Resolution::Preempted));
                    }
                    Ok(Wake::Expired) => {
                        return Err(RelayError::QueueExpired(queue_id));
                    }
                    // We hold a sender, so this is unreachable in practice
                    Err(_) => {
                        return Ok(PollResponse::empty(cursor, Resolution::Timeout));
                    }
                },
                recv(cancel) -> _ => {
                    debug!(queue = %queue_id.short(), "Poll cancelled");
                    return Ok(PollResponse::empty(cursor, Resolution::Cancelled));
                },
                recv(timer) -> _ => {
                    return Ok(PollResponse::empty(cursor, Resolution::Timeout));
                },
            }
        }
    }
}
