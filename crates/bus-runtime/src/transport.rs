//! Abstract broker transport.
//!
//! A [`Transport`] knows how to reach a broker endpoint; a [`Connection`] is one
//! live session with it and carries every link-level primitive the client core
//! needs. Wire framing is the implementation's concern.

use crate::error::{BusError, ValidationError};
use crate::link::{Link, LinkSpec};
use crate::message::{DeliveryId, Message, ReceivedMessage};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Broker address, e.g. `sb://bus.example.net` or `memory://local`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Result<Self, ValidationError> {
        let address = address.into();
        if address.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "endpoint".to_string(),
            });
        }

        Ok(Self(address))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque credentials handed to the transport unchanged.
///
/// The secret never appears in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    secret: Option<String>,
}

impl Credentials {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.secret.is_some() {
            "<REDACTED>"
        } else {
            "<anonymous>"
        };
        f.debug_struct("Credentials").field("secret", &shown).finish()
    }
}

/// Entry point to a broker implementation
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection.
    ///
    /// Fails with [`BusError::Authentication`] when the credentials are rejected
    /// and [`BusError::Network`] when the endpoint cannot be reached.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, BusError>;
}

/// One live session with a broker
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a logical link to a queue, topic or subscription
    async fn open_link(&self, spec: &LinkSpec) -> Result<Link, BusError>;

    /// Release a link; closing an unknown link is not an error
    async fn close_link(&self, link: &Link) -> Result<(), BusError>;

    /// Submit messages atomically.
    ///
    /// Either every message is committed or none is; implementations must never
    /// leave a partial batch visible to receivers.
    async fn send_batch(&self, link: &Link, messages: &[Message]) -> Result<(), BusError>;

    /// Pull up to `max_messages`, waiting at most `wait` for the first one.
    ///
    /// Returns an empty vector when nothing arrived in time.
    async fn receive(
        &self,
        link: &Link,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError>;

    /// Settle a delivery as successfully processed
    async fn ack(&self, link: &Link, delivery_id: &DeliveryId) -> Result<(), BusError>;

    /// Return a delivery to the broker for redelivery
    async fn nack(&self, link: &Link, delivery_id: &DeliveryId, reason: &str)
        -> Result<(), BusError>;

    /// Close the connection and every link on it
    async fn close(&self) -> Result<(), BusError>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}
