//! Connection ownership and transparent recovery.
//!
//! [`ConnectionHandle`] owns the live [`Connection`] and replaces it after a
//! network failure. [`ManagedLink`] keeps one link open on top of it, reopening
//! the link whenever the connection underneath is replaced.

use crate::error::BusError;
use crate::link::{Link, LinkSpec};
use crate::message::DeliveryId;
use crate::retry::{RetryPolicy, RetryState};
use crate::transport::{Connection, Credentials, Endpoint, Transport};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Compare connection identities without involving vtable pointers
fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Owner of the broker connection shared by every sender and processor of a
/// client
pub struct ConnectionHandle {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    credentials: Credentials,
    reconnect_policy: RetryPolicy,
    current: Mutex<Arc<dyn Connection>>,
    shutdown: CancellationToken,
}

impl ConnectionHandle {
    /// Connect once; authentication and network failures surface to the caller
    pub async fn connect(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        credentials: Credentials,
        reconnect_policy: RetryPolicy,
    ) -> Result<Self, BusError> {
        let connection = transport.connect(&endpoint, &credentials).await?;
        info!(endpoint = %endpoint, "Connected to broker");

        Ok(Self {
            transport,
            endpoint,
            credentials,
            reconnect_policy,
            current: Mutex::new(connection),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Current connection (may be one that has just failed)
    pub async fn current(&self) -> Result<Arc<dyn Connection>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        Ok(self.current.lock().await.clone())
    }

    /// Replace `failed` with a fresh connection.
    ///
    /// Concurrent callers that observed the same failed connection share one
    /// reconnect: whoever arrives after the replacement gets the new connection
    /// back immediately. Authentication failures abort recovery; network
    /// failures are retried per the reconnect policy.
    pub async fn recover(
        &self,
        failed: &Arc<dyn Connection>,
    ) -> Result<Arc<dyn Connection>, BusError> {
        let mut current = self.current.lock().await;

        if !same_connection(&current, failed) {
            return Ok(current.clone());
        }

        let mut retry_state = RetryState::new();
        loop {
            if self.is_closed() {
                return Err(BusError::Closed);
            }

            match self.transport.connect(&self.endpoint, &self.credentials).await {
                Ok(connection) => {
                    info!(
                        endpoint = %self.endpoint,
                        attempts = retry_state.attempt + 1,
                        "Reconnected to broker"
                    );
                    *current = connection.clone();
                    return Ok(connection);
                }
                Err(e) if !e.is_transient() => {
                    warn!(endpoint = %self.endpoint, error = %e, "Reconnect failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    if !retry_state.can_retry(&self.reconnect_policy) {
                        warn!(
                            endpoint = %self.endpoint,
                            error = %e,
                            attempts = retry_state.attempt + 1,
                            "Giving up on reconnect"
                        );
                        return Err(e);
                    }

                    let delay = retry_state.get_delay(&self.reconnect_policy);
                    debug!(
                        endpoint = %self.endpoint,
                        error = %e,
                        attempt = retry_state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(BusError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry_state.next_attempt();
                }
            }
        }
    }

    /// Close the connection. Subsequent calls are no-ops.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Ok(());
        }
        self.shutdown.cancel();

        let connection = self.current.lock().await.clone();
        let result = connection.close().await;
        info!(endpoint = %self.endpoint, "Connection closed");
        result
    }
}

/// A connection together with a link opened on it
#[derive(Clone)]
pub struct LinkBinding {
    pub connection: Arc<dyn Connection>,
    pub link: Link,
}

enum LinkState {
    Open(LinkBinding),
    Closed,
}

/// A link that survives reconnects.
///
/// The link is opened eagerly so configuration errors such as an unknown
/// entity surface when the owner is created.
pub struct ManagedLink {
    handle: Arc<ConnectionHandle>,
    spec: LinkSpec,
    state: RwLock<LinkState>,
}

impl ManagedLink {
    pub async fn open(handle: Arc<ConnectionHandle>, spec: LinkSpec) -> Result<Self, BusError> {
        let connection = handle.current().await?;
        let link = connection.open_link(&spec).await?;
        debug!(link = %link, "Link opened");

        Ok(Self {
            handle,
            spec,
            state: RwLock::new(LinkState::Open(LinkBinding { connection, link })),
        })
    }

    pub fn spec(&self) -> &LinkSpec {
        &self.spec
    }

    /// Current binding, or [`BusError::Closed`] once the link was released
    pub async fn binding(&self) -> Result<LinkBinding, BusError> {
        match &*self.state.read().await {
            LinkState::Open(binding) => Ok(binding.clone()),
            LinkState::Closed => Err(BusError::Closed),
        }
    }

    /// Binding whose connection is believed healthy, recovering first if the
    /// connection was lost since the last call
    pub async fn ready_binding(&self) -> Result<LinkBinding, BusError> {
        let binding = self.binding().await?;
        if binding.connection.is_open() {
            return Ok(binding);
        }

        self.recover(&binding).await
    }

    /// Re-establish the link after `failed` stopped working.
    ///
    /// Reconnects the shared connection when it is no longer open, then reopens
    /// the link on it. A binding that was already replaced by another caller is
    /// returned as is.
    pub async fn recover(&self, failed: &LinkBinding) -> Result<LinkBinding, BusError> {
        let mut state = self.state.write().await;

        let current = match &*state {
            LinkState::Open(binding) => binding.clone(),
            LinkState::Closed => return Err(BusError::Closed),
        };

        if current.link != failed.link || !same_connection(&current.connection, &failed.connection)
        {
            return Ok(current);
        }

        let connection = if current.connection.is_open() {
            current.connection.clone()
        } else {
            self.handle.recover(&current.connection).await?
        };

        let link = connection.open_link(&self.spec).await?;
        info!(link = %link, "Link re-established");

        let binding = LinkBinding { connection, link };
        *state = LinkState::Open(binding.clone());
        Ok(binding)
    }

    /// Settle a delivery on the current link
    pub async fn ack(&self, delivery_id: &DeliveryId) -> Result<(), BusError> {
        let binding = self.binding().await?;
        binding.connection.ack(&binding.link, delivery_id).await
    }

    /// Return a delivery on the current link
    pub async fn nack(&self, delivery_id: &DeliveryId, reason: &str) -> Result<(), BusError> {
        let binding = self.binding().await?;
        binding
            .connection
            .nack(&binding.link, delivery_id, reason)
            .await
    }

    /// Release the link. Subsequent calls are no-ops.
    pub async fn close(&self) -> Result<(), BusError> {
        let previous = std::mem::replace(&mut *self.state.write().await, LinkState::Closed);

        match previous {
            LinkState::Open(binding) => {
                debug!(link = %binding.link, "Closing link");
                if binding.connection.is_open() {
                    binding.connection.close_link(&binding.link).await
                } else {
                    Ok(())
                }
            }
            LinkState::Closed => Ok(()),
        }
    }

    pub async fn is_closed(&self) -> bool {
        matches!(&*self.state.read().await, LinkState::Closed)
    }
}
