//! Redis pub/sub transport for multi-process deployments.
//!
//! Producers PUBLISH encoded events on the configured channel and draw ids
//! from `INCR <channel>:seq`, so every process agrees on ordering. The
//! listener thread SUBSCRIBEs and reconnects after a delay whenever the
//! connection drops.

use super::{BusSubscription, EventBus, EventHandler};
use crate::config::{BusCodec, BusConfig};
use crate::error::{RelayError, Result};
use crate::types::{Event, EventId, EventSequence};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the listener checks for shutdown while idle.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct RedisBus {
    client: redis::Client,
    channel: String,
    codec: BusCodec,
    reconnect_delay: Duration,
    sequence: Arc<EventSequence>,
    /// Reused for PUBLISH/INCR; reopened after any error.
    connection: Mutex<Option<redis::Connection>>,
    next_id: AtomicU64,
}

impl RedisBus {
    pub fn new(config: &BusConfig, sequence: Arc<EventSequence>) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            channel: config.channel.clone(),
            codec: config.codec,
            reconnect_delay: config.reconnect_delay(),
            sequence,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn sequence_key(&self) -> String {
        format!("{}:seq", self.channel)
    }

    /// Run `f` on the shared connection, dropping it on failure so the
    /// next call reconnects.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T> {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            *slot = Some(self.client.get_connection_with_timeout(CONNECT_TIMEOUT)?);
        }
        let conn = slot
            .as_mut()
            .ok_or_else(|| RelayError::BusUnavailable("no connection".into()))?;
        match f(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                *slot = None;
                Err(e.into())
            }
        }
    }
}

impl EventBus for RedisBus {
    fn next_event_id(&self, local: &EventSequence) -> Result<EventId> {
        let key = self.sequence_key();
        let id: u64 = self.with_connection(|conn| redis::cmd("INCR").arg(&key).query(conn))?;
        let id = EventId(id);
        local.observe(id);
        Ok(id)
    }

    fn publish(&self, event: &Event) -> Result<usize> {
        let bytes = self.codec.encode(event)?;
        let receivers: usize = self.with_connection(|conn| {
            redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(bytes.as_slice())
                .query(conn)
        })?;
        Ok(receivers)
    }

    fn subscribe(&self, handler: EventHandler) -> Result<BusSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let listener = Listener {
            client: self.client.clone(),
            channel: self.channel.clone(),
            codec: self.codec,
            reconnect_delay: self.reconnect_delay,
            sequence: Arc::clone(&self.sequence),
            handler,
            stop: stop_rx,
        };

        let worker = thread::Builder::new()
            .name(format!("relay-redis-{id}"))
            .spawn(move || listener.run())?;

        Ok(BusSubscription::new(
            id,
            Box::new(move || drop(stop_tx)),
            Some(worker),
        ))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct Listener {
    client: redis::Client,
    channel: String,
    codec: BusCodec,
    reconnect_delay: Duration,
    sequence: Arc<EventSequence>,
    handler: EventHandler,
    stop: Receiver<()>,
}

impl Listener {
    fn stopped(&self) -> bool {
        !matches!(self.stop.try_recv(), Err(crossbeam_channel::TryRecvError::Empty))
    }

    fn run(self) {
        loop {
            match self.listen() {
                Ok(()) => return,
                Err(e) => error!(channel = %self.channel, error = %e, "Redis listener lost connection"),
            }

            // Wait out the reconnect delay unless asked to stop
            match self.stop.recv_timeout(self.reconnect_delay) {
                Err(RecvTimeoutError::Timeout) => {
                    info!(channel = %self.channel, "Reconnecting Redis listener");
                }
                _ => return,
            }
        }
    }

    /// Returns `Ok` only when stopped.
    fn listen(&self) -> Result<()> {
        let mut conn = self.client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
        let mut pubsub = conn.as_pubsub();
        pubsub.subscribe(&self.channel)?;
        pubsub.set_read_timeout(Some(READ_TIMEOUT))?;
        info!(channel = %self.channel, "Subscribed to Redis channel");

        loop {
            if self.stopped() {
                debug!(channel = %self.channel, "Redis listener stopped");
                return Ok(());
            }

            let message = match pubsub.get_message() {
                Ok(message) => message,
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            };

            let payload: Vec<u8> = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Unreadable Redis message dropped");
                    continue;
                }
            };

            match self.codec.decode(&payload) {
                Ok(inbound) => match inbound.into_event(&self.sequence) {
                    Some(event) => (self.handler)(event),
                    None => warn!("Event without topics or recipients ignored"),
                },
                Err(e) => warn!(error = %e, "Undecodable bus message dropped"),
            }
        }
    }
}
