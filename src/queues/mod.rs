//! Per-subscriber queues and the policy that fills them.

mod filter;
mod store;

pub use filter::{Decision, DeliveryFilter};
pub use store::{
    ExpiredQueue, InterestTarget, PushOutcome, Queue, QueueHandle, QueueStore, Registered,
};
