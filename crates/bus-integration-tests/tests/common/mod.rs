//! Common test utilities for bus-runtime integration tests
//!
//! This module provides:
//! - A scripted transport that hands out pre-built deliveries and records settlement
//! - A recording error handler
//! - Helpers for entity paths and client construction

use async_trait::async_trait;
use bus_runtime::{
    BusClient, BusError, ClientOptions, Connection, Credentials, DeliveryId, Endpoint, EntityName,
    EntityPath, ErrorEvent, ErrorRouter, ErrorSource, Link, LinkId, LinkSpec, Message, MessageId,
    ReceivedMessage, Timestamp, Transport,
};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Entities
// ============================================================================

#[allow(dead_code)]
pub fn queue(name: &str) -> EntityPath {
    EntityPath::queue(EntityName::new(name.to_string()).unwrap())
}

#[allow(dead_code)]
pub fn delivery(id: &str, body: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: MessageId::new(),
        body: Bytes::from(body.to_string()),
        metadata: HashMap::new(),
        correlation_id: None,
        delivery_id: DeliveryId::new(id),
        delivery_count: 1,
        enqueued_at: Timestamp::now(),
        delivered_at: Timestamp::now(),
    }
}

// ============================================================================
// Scripted Transport
// ============================================================================

#[derive(Default)]
struct ScriptState {
    pending: Mutex<VecDeque<ReceivedMessage>>,
    sent: Mutex<Vec<Vec<Message>>>,
    acks: Mutex<Vec<DeliveryId>>,
    nacks: Mutex<Vec<(DeliveryId, String)>>,
    fail_sends: Mutex<Option<BusError>>,
    closed: AtomicBool,
    next_link: AtomicU64,
}

/// Transport whose single connection delivers exactly what the test scripted
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a delivery for the next receive call
    pub fn deliver(&self, message: ReceivedMessage) {
        self.state.pending.lock().unwrap().push_back(message);
    }

    /// Fail every subsequent send with `error`
    pub fn fail_sends(&self, error: BusError) {
        *self.state.fail_sends.lock().unwrap() = Some(error);
    }

    pub fn sent_batches(&self) -> Vec<Vec<Message>> {
        self.state.sent.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<DeliveryId> {
        self.state.acks.lock().unwrap().clone()
    }

    pub fn nacks(&self) -> Vec<(DeliveryId, String)> {
        self.state.nacks.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Client over this transport with default options
    pub async fn client(&self) -> BusClient {
        BusClient::connect(
            Arc::new(self.clone()),
            Endpoint::new("scripted://test").unwrap(),
            Credentials::anonymous(),
            ClientOptions::default(),
        )
        .await
        .unwrap()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, BusError> {
        self.state.closed.store(false, Ordering::SeqCst);
        Ok(Arc::new(ScriptedConnection {
            state: self.state.clone(),
        }))
    }
}

struct ScriptedConnection {
    state: Arc<ScriptState>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn open_link(&self, spec: &LinkSpec) -> Result<Link, BusError> {
        let id = self.state.next_link.fetch_add(1, Ordering::SeqCst);
        Ok(Link::new(LinkId::new(id), spec.clone()))
    }

    async fn close_link(&self, _link: &Link) -> Result<(), BusError> {
        Ok(())
    }

    async fn send_batch(&self, _link: &Link, messages: &[Message]) -> Result<(), BusError> {
        if let Some(error) = self.state.fail_sends.lock().unwrap().clone() {
            return Err(error);
        }
        self.state.sent.lock().unwrap().push(messages.to_vec());
        Ok(())
    }

    async fn receive(
        &self,
        _link: &Link,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let batch: Vec<ReceivedMessage> = {
            let mut pending = self.state.pending.lock().unwrap();
            let take = pending.len().min(max_messages as usize);
            pending.drain(..take).collect()
        };

        if batch.is_empty() {
            tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
        }
        Ok(batch)
    }

    async fn ack(&self, _link: &Link, delivery_id: &DeliveryId) -> Result<(), BusError> {
        self.state.acks.lock().unwrap().push(delivery_id.clone());
        Ok(())
    }

    async fn nack(
        &self,
        _link: &Link,
        delivery_id: &DeliveryId,
        reason: &str,
    ) -> Result<(), BusError> {
        self.state
            .nacks
            .lock()
            .unwrap()
            .push((delivery_id.clone(), reason.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.state.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Recording Error Handler
// ============================================================================

/// Error router that keeps every reported event for later assertions
#[derive(Clone, Default)]
pub struct RecordedErrors {
    events: Arc<Mutex<Vec<ErrorEvent>>>,
}

#[allow(dead_code)]
impl RecordedErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(&self) -> ErrorRouter {
        let events = self.events.clone();
        ErrorRouter::new(Arc::new(move |event: ErrorEvent| {
            let events = events.clone();
            async move {
                events.lock().unwrap().push(event);
            }
        }))
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn from_source(&self, source: ErrorSource) -> Vec<ErrorEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.context.source == source)
            .collect()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
