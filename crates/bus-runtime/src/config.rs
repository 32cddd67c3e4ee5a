//! Configuration for clients, senders, processors and the in-memory broker.
//!
//! Every section carries serde defaults so a partially specified file (or
//! none at all) yields a usable configuration. Durations are expressed in
//! milliseconds on the wire (`*_ms` keys).

use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest batch accepted by default (256 KiB, the common broker frame limit)
pub const DEFAULT_MAX_BATCH_BYTES: usize = 256 * 1024;

/// Default number of messages per batch
pub const DEFAULT_MAX_BATCH_COUNT: usize = 100;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub client: ClientOptions,
    pub processor: ProcessorOptions,
    pub in_memory: InMemoryConfig,
}

impl BusConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.client.validate()?;
        self.processor.validate()?;
        self.in_memory.validate()
    }
}

/// Client-wide options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Broker endpoint address
    pub endpoint: String,
    /// Batch limits applied to senders created by the client
    pub batch: BatchOptions,
    /// Backoff used when the connection has to be re-established
    pub reconnect: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            endpoint: "memory://local".to_string(),
            batch: BatchOptions::default(),
            reconnect: RetryPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "client.endpoint".to_string(),
            });
        }

        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: "client.reconnect.backoff_multiplier must be at least 1.0".to_string(),
            });
        }

        self.batch.validate()
    }
}

/// Size and count limits for outbound batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub max_batch_bytes: usize,
    pub max_batch_count: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_count: DEFAULT_MAX_BATCH_COUNT,
        }
    }
}

impl BatchOptions {
    pub fn new(max_batch_bytes: usize, max_batch_count: usize) -> Self {
        Self {
            max_batch_bytes,
            max_batch_count,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_batch_bytes == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_batch_bytes must be greater than zero".to_string(),
            });
        }
        if self.max_batch_count == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_batch_count must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Processor tuning knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Number of concurrent dispatch slots (>= 1)
    pub concurrency_limit: usize,

    /// Bound on how long `stop()` waits for in-flight handlers; zero waits forever
    #[serde(rename = "drain_timeout_ms", with = "duration_millis")]
    pub drain_timeout: Duration,

    /// Upper bound on messages pulled per receive call
    pub max_messages_per_receive: u32,

    /// How long one receive call waits for messages before polling again
    #[serde(rename = "receive_wait_ms", with = "duration_millis")]
    pub receive_wait: Duration,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            drain_timeout: Duration::ZERO,
            max_messages_per_receive: 10,
            receive_wait: Duration::from_secs(1),
        }
    }
}

impl ProcessorOptions {
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Drain bound, `None` meaning wait forever
    pub fn drain_deadline(&self) -> Option<Duration> {
        if self.drain_timeout.is_zero() {
            None
        } else {
            Some(self.drain_timeout)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.concurrency_limit == 0 {
            return Err(ConfigurationError::Invalid {
                message: "processor.concurrency_limit must be at least 1".to_string(),
            });
        }
        if self.max_messages_per_receive == 0 {
            return Err(ConfigurationError::Invalid {
                message: "processor.max_messages_per_receive must be at least 1".to_string(),
            });
        }
        if self.receive_wait.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: "processor.receive_wait_ms must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// In-memory broker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Maximum number of messages held by one queue or subscription
    pub max_entity_size: usize,
    /// Largest single message accepted
    pub max_message_size: usize,
    /// Deliveries before a message is moved to the dead-letter queue
    pub max_delivery_count: u32,
    /// Peek-lock duration after which an unsettled delivery is redelivered
    #[serde(rename = "lock_duration_ms", with = "duration_millis")]
    pub lock_duration: Duration,
    /// Create queues, topics and subscriptions on first use
    pub auto_create_entities: bool,
    /// Secret every connection must present; `None` accepts anyone
    pub required_secret: Option<String>,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_entity_size: 10_000,
            max_message_size: 1024 * 1024,
            max_delivery_count: 10,
            lock_duration: Duration::from_secs(30),
            auto_create_entities: true,
            required_secret: None,
        }
    }
}

impl InMemoryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_entity_size == 0 || self.max_message_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "in_memory size limits must be greater than zero".to_string(),
            });
        }
        if self.max_delivery_count == 0 {
            return Err(ConfigurationError::Invalid {
                message: "in_memory.max_delivery_count must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
