//! Client entry point and shutdown coordination.
//!
//! A [`BusClient`] owns one broker connection shared by every [`Sender`] and
//! [`Processor`] it creates. Closing the client shuts them down in order:
//! processors drain first, then outstanding sends finish, and only then is
//! the connection released.

use crate::config::{BusConfig, ClientOptions, ProcessorOptions};
use crate::connection::{ConnectionHandle, ManagedLink};
use crate::error::BusError;
use crate::link::{EntityPath, LinkSpec};
use crate::processor::Processor;
use crate::providers::InMemoryTransport;
use crate::sender::Sender;
use crate::transport::{Credentials, Endpoint, Transport};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

#[derive(Default)]
struct Registry {
    senders: Vec<Sender>,
    processors: Vec<Processor>,
}

struct ClientInner {
    handle: Arc<ConnectionHandle>,
    options: ClientOptions,
    registry: Mutex<Registry>,
    /// Serializes close
    closing: Mutex<()>,
}

/// Connection-owning client that creates senders and processors
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Connect to `endpoint`.
    ///
    /// Fails with [`BusError::Authentication`] or [`BusError::Network`] when the
    /// transport cannot establish the connection.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        endpoint: Endpoint,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, BusError> {
        options.validate()?;

        let handle = ConnectionHandle::connect(
            transport,
            endpoint,
            credentials,
            options.reconnect.clone(),
        )
        .await?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                handle: Arc::new(handle),
                options,
                registry: Mutex::new(Registry::default()),
                closing: Mutex::new(()),
            }),
        })
    }

    /// Client backed by a fresh in-memory broker built from `config`
    pub async fn in_memory(config: &BusConfig) -> Result<(Self, InMemoryTransport), BusError> {
        config.validate()?;

        let transport = InMemoryTransport::new(config.in_memory.clone());
        let endpoint = Endpoint::new(config.client.endpoint.clone())?;
        let credentials = config
            .in_memory
            .required_secret
            .clone()
            .map(Credentials::new)
            .unwrap_or_default();

        let client = Self::connect(
            Arc::new(transport.clone()),
            endpoint,
            credentials,
            config.client.clone(),
        )
        .await?;
        Ok((client, transport))
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.inner.handle.endpoint()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.handle.is_closed()
    }

    /// Create a sender for a queue or topic
    pub async fn create_sender(&self, entity: EntityPath) -> Result<Sender, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let link = ManagedLink::open(self.inner.handle.clone(), LinkSpec::sender(entity.clone()))
            .await?;
        let sender = Sender::new(entity.clone(), link, self.inner.options.batch);

        self.inner.registry.lock().await.senders.push(sender.clone());
        info!(entity = %entity, "Sender created");
        Ok(sender)
    }

    /// Create a processor for a queue or subscription; call
    /// [`Processor::start`] to begin receiving
    pub async fn create_processor(
        &self,
        entity: EntityPath,
        options: ProcessorOptions,
    ) -> Result<Processor, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        options.validate()?;
        if !entity.accepts_receives() {
            return Err(BusError::InvalidState {
                from: entity.to_string(),
                to: "receive".to_string(),
            });
        }

        let processor = Processor::new(entity.clone(), self.inner.handle.clone(), options);
        self.inner
            .registry
            .lock()
            .await
            .processors
            .push(processor.clone());
        info!(entity = %entity, "Processor created");
        Ok(processor)
    }

    /// Shut everything down and release the connection.
    ///
    /// Processors are stopped (drained) first, then the client waits for every
    /// outstanding send before closing senders and the connection. Subsequent
    /// calls are no-ops.
    pub async fn close(&self) -> Result<(), BusError> {
        let _closing = self.inner.closing.lock().await;
        if self.is_closed() {
            return Ok(());
        }

        let Registry {
            senders,
            processors,
        } = std::mem::take(&mut *self.inner.registry.lock().await);

        for processor in &processors {
            if let Err(e) = processor.stop().await {
                warn!(entity = %processor.entity(), error = %e, "Processor failed to stop cleanly");
            }
        }

        for sender in &senders {
            sender.wait_idle().await;
            if let Err(e) = sender.close().await {
                warn!(entity = %sender.entity(), error = %e, "Sender failed to close cleanly");
            }
        }

        self.inner.handle.close().await?;
        info!(
            endpoint = %self.inner.handle.endpoint(),
            senders = senders.len(),
            processors = processors.len(),
            "Client closed"
        );
        Ok(())
    }
}
