//! # Realtime Relay
//!
//! Long-poll event delivery for a web application. Producers publish small
//! notifications about domain changes; each connected client owns a server
//! side queue and polls it for anything newer than its cursor.
//!
//! ## Core Concepts
//!
//! - **Bus**: moves published events from producers to the relay process
//! - **Queues**: bounded, ordered buffers of events per subscriber
//! - **Filter**: decides which queues an event belongs in
//! - **Polls**: held requests resolved by events, timeouts or cancellation
//! - **Manager**: registration, heartbeats, fan-out and expiry
//!
//! ## Example
//!
//! ```ignore
//! use realtime_relay::*;
//!
//! let config = RelayConfig::from_env()?;
//! let sequence = Arc::new(EventSequence::new());
//! let bus = Arc::new(InMemoryBus::new(&config.bus, Arc::clone(&sequence)));
//! let manager = Arc::new(QueueManager::new(config, Arc::clone(&sequence))?);
//! let _listener = manager.listen(bus.as_ref())?;
//! let _sweeper = manager.start_sweeper()?;
//!
//! // Client side
//! let reg = manager.register(OwnerId(42), [TopicId(3)])?;
//! let response = manager.poll(PollRequest::new(reg.queue_id, reg.last_event_id))?;
//!
//! // Producer side
//! let publisher = EventPublisher::new(bus, sequence);
//! publisher.publish_best_effort(
//!     PublishRequest::new(EventType::NewDiscussion, [TopicId(3)]).excluding(OwnerId(7)),
//! );
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod manager;
pub mod poll;
pub mod queues;
pub mod types;

// Re-exports
pub use bus::{BusSubscription, EventBus, EventHandler, EventPublisher, InMemoryBus, InboundEvent};
#[cfg(feature = "redis-bus")]
pub use bus::RedisBus;
pub use config::{BusCodec, BusConfig, RelayConfig};
pub use error::{RelayError, Result};
pub use manager::{DeliveryReport, HealthSnapshot, QueueManager, Registration, Sweeper};
pub use poll::{
    DuplicatePollPolicy, PollCancel, PollCoordinator, PollRequest, PollResponse, Resolution,
    WirePollResponse,
};
pub use queues::{
    Decision, DeliveryFilter, ExpiredQueue, InterestTarget, PushOutcome, Queue, QueueHandle,
    QueueStore, Registered,
};
pub use types::*;
