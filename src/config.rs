//! Relay configuration.
//!
//! Defaults match the documented deployment: 1000 events per queue, 60s
//! polls, 120s queue TTL (two missed heartbeats at the 60s client cadence).
//! Values can come from a TOML file, from the environment, or both.

use crate::error::{RelayError, Result};
use crate::poll::DuplicatePollPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for `poll_timeout_secs` and `sweep_interval_secs` (one day).
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// How events are encoded while crossing the bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusCodec {
    #[default]
    Json,
    #[serde(alias = "messagepack")]
    Msgpack,
}

/// Event bus settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Pub/sub channel name.
    pub channel: String,

    pub codec: BusCodec,

    /// Per-subscriber backlog on the in-memory bus.
    pub channel_capacity: usize,

    /// Only used by the Redis transport.
    pub redis_url: String,

    /// Delay before the Redis listener reconnects after losing its connection.
    pub reconnect_delay_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: "discussion_events".to_string(),
            codec: BusCodec::Json,
            channel_capacity: 1000,
            redis_url: "redis://localhost:6379/3".to_string(),
            reconnect_delay_secs: 5,
        }
    }
}

impl BusConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Queue manager and poll coordinator settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Ring buffer capacity per queue.
    /// Default: 1000
    pub buffer_capacity: usize,

    /// How long a poll may stay suspended.
    /// Default: 60
    pub poll_timeout_secs: u64,

    /// Idle time after which a queue is expired.
    /// Default: 120
    pub queue_ttl_secs: u64,

    /// Extra slack on top of the TTL before the sweeper removes a queue.
    pub expiry_grace_secs: u64,

    /// Interval of the background sweeper.
    /// Default: 60
    pub sweep_interval_secs: u64,

    /// What to do with a second concurrent poll on the same queue.
    pub duplicate_poll: DuplicatePollPolicy,

    pub bus: BusConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            poll_timeout_secs: 60,
            queue_ttl_secs: 120,
            expiry_grace_secs: 0,
            sweep_interval_secs: 60,
            duplicate_poll: DuplicatePollPolicy::Preempt,
            bus: BusConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// TTL plus grace: the idle time at which a queue is removed.
    pub fn expiry_after(&self) -> Duration {
        Duration::from_secs(self.queue_ttl_secs.saturating_add(self.expiry_grace_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overridden by process environment (a `.env` file is loaded
    /// first when present).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `RELAY_*` overrides from an arbitrary lookup.
    ///
    /// Recognized keys: `RELAY_BUFFER_CAPACITY`, `RELAY_POLL_TIMEOUT_SECS`,
    /// `RELAY_QUEUE_TTL_SECS`, `RELAY_EXPIRY_GRACE_SECS`,
    /// `RELAY_SWEEP_INTERVAL_SECS`, `RELAY_DUPLICATE_POLL`,
    /// `RELAY_BUS_CHANNEL`, `RELAY_BUS_CODEC`, `RELAY_BUS_CHANNEL_CAPACITY`,
    /// and `REALTIME_REDIS_URL`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| RelayError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
        }

        if let Some(v) = lookup("RELAY_BUFFER_CAPACITY") {
            self.buffer_capacity = parse("RELAY_BUFFER_CAPACITY", v)?;
        }
        if let Some(v) = lookup("RELAY_POLL_TIMEOUT_SECS") {
            self.poll_timeout_secs = parse("RELAY_POLL_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_QUEUE_TTL_SECS") {
            self.queue_ttl_secs = parse("RELAY_QUEUE_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_EXPIRY_GRACE_SECS") {
            self.expiry_grace_secs = parse("RELAY_EXPIRY_GRACE_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse("RELAY_SWEEP_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("RELAY_DUPLICATE_POLL") {
            self.duplicate_poll = match v.trim() {
                "preempt" => DuplicatePollPolicy::Preempt,
                "reject" => DuplicatePollPolicy::Reject,
                other => {
                    return Err(RelayError::InvalidConfig(format!(
                        "RELAY_DUPLICATE_POLL: unknown policy {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("RELAY_BUS_CHANNEL") {
            self.bus.channel = v;
        }
        if let Some(v) = lookup("RELAY_BUS_CODEC") {
            self.bus.codec = match v.trim() {
                "json" => BusCodec::Json,
                "msgpack" | "messagepack" => BusCodec::Msgpack,
                other => {
                    return Err(RelayError::InvalidConfig(format!(
                        "RELAY_BUS_CODEC: unknown codec {other:?}"
                    )))
                }
            };
        }
        if let Some(v) = lookup("RELAY_BUS_CHANNEL_CAPACITY") {
            self.bus.channel_capacity = parse("RELAY_BUS_CHANNEL_CAPACITY", v)?;
        }
        if let Some(v) = lookup("REALTIME_REDIS_URL") {
            self.bus.redis_url = v;
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "buffer_capacity must be at least 1".into(),
            ));
        }
        if self.poll_timeout_secs == 0 {
            return Err(RelayError::InvalidConfig(
                "poll_timeout_secs must be at least 1".into(),
            ));
        }
        if self.poll_timeout_secs > MAX_INTERVAL_SECS {
            return Err(RelayError::InvalidConfig(format!(
                "poll_timeout_secs must be at most {MAX_INTERVAL_SECS}"
            )));
        }
        if self.queue_ttl_secs <= self.poll_timeout_secs {
            return Err(RelayError::InvalidConfig(format!(
                "queue_ttl_secs ({}) must exceed poll_timeout_secs ({})",
                self.queue_ttl_secs, self.poll_timeout_secs
            )));
        }
        if self
            .queue_ttl_secs
            .checked_add(self.expiry_grace_secs)
            .is_none()
        {
            return Err(RelayError::InvalidConfig(
                "queue_ttl_secs + expiry_grace_secs overflows".into(),
            ));
        }
        if self.sweep_interval_secs == 0 || self.sweep_interval_secs > MAX_INTERVAL_SECS {
            return Err(RelayError::InvalidConfig(format!(
                "sweep_interval_secs must be between 1 and {MAX_INTERVAL_SECS}"
            )));
        }
        if self.bus.channel.is_empty() {
            return Err(RelayError::InvalidConfig("bus.channel is empty".into()));
        }
        if self.bus.channel_capacity == 0 {
            return Err(RelayError::InvalidConfig(
                "bus.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
