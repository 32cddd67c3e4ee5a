//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Supports queues and topics with subscriptions (topic sends fan out)
//! - Implements peek-lock delivery with lock expiry and redelivery
//! - Moves messages to a dead-letter queue after too many deliveries
//! - Commits batches atomically
//! - Offers fault injection and inspection hooks for tests
//!
//! Delivery identifiers are the broker sequence number of the message, so a
//! message redelivered after its lock expired carries the same identifier as
//! the copy that may still be in processing.

use crate::config::InMemoryConfig;
use crate::error::BusError;
use crate::link::{EntityPath, Link, LinkDirection, LinkId, LinkSpec};
use crate::message::{DeliveryId, EntityName, Message, MessageId, ReceivedMessage, Timestamp};
use crate::transport::{Connection, Credentials, Endpoint, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// All entities held by the broker
#[derive(Default)]
struct BrokerStorage {
    /// Receivable entities: queues and subscriptions
    entities: HashMap<EntityPath, InMemoryQueue>,
    /// Topic name to its subscription names
    topics: HashMap<EntityName, Vec<EntityName>>,
    next_sequence: u64,
}

impl BrokerStorage {
    fn queue_mut(&mut self, entity: &EntityPath) -> Result<&mut InMemoryQueue, BusError> {
        self.entities
            .get_mut(entity)
            .ok_or_else(|| BusError::EntityNotFound {
                entity: entity.to_string(),
            })
    }

    /// Make sure `entity` exists, creating it when allowed
    fn ensure_entity(&mut self, entity: &EntityPath, auto_create: bool) -> Result<(), BusError> {
        let exists = match entity {
            EntityPath::Queue { .. } => self.entities.contains_key(entity),
            EntityPath::Topic { name } => self.topics.contains_key(name),
            EntityPath::Subscription { topic, .. } => {
                self.topics.contains_key(topic) && self.entities.contains_key(entity)
            }
        };

        if exists {
            return Ok(());
        }
        if !auto_create {
            return Err(BusError::EntityNotFound {
                entity: entity.to_string(),
            });
        }

        match entity {
            EntityPath::Queue { .. } => {
                self.entities.entry(entity.clone()).or_default();
            }
            EntityPath::Topic { name } => {
                self.topics.entry(name.clone()).or_default();
            }
            EntityPath::Subscription {
                topic,
                subscription,
            } => {
                let subscriptions = self.topics.entry(topic.clone()).or_default();
                if !subscriptions.contains(subscription) {
                    subscriptions.push(subscription.clone());
                }
                self.entities.entry(entity.clone()).or_default();
            }
        }
        debug!(entity = %entity, "Created entity");
        Ok(())
    }

    /// Entities that receive a copy of a message sent to `entity`
    fn targets(&self, entity: &EntityPath) -> Result<Vec<EntityPath>, BusError> {
        match entity {
            EntityPath::Queue { .. } => Ok(vec![entity.clone()]),
            EntityPath::Topic { name } => self
                .topics
                .get(name)
                .map(|subscriptions| {
                    subscriptions
                        .iter()
                        .map(|s| EntityPath::subscription(name.clone(), s.clone()))
                        .collect()
                })
                .ok_or_else(|| BusError::EntityNotFound {
                    entity: entity.to_string(),
                }),
            EntityPath::Subscription { .. } => Err(BusError::transport(
                "send",
                "messages cannot be sent to a subscription",
            )),
        }
    }
}

/// Internal state for a single queue or subscription
#[derive(Default)]
struct InMemoryQueue {
    /// Messages available for delivery (FIFO order)
    messages: VecDeque<StoredMessage>,
    /// Messages delivered and awaiting settlement
    in_flight: HashMap<DeliveryId, InFlightMessage>,
    /// Dead letter queue for messages that could not be processed
    dead_letter: Vec<DeadLetteredMessage>,
}

impl InMemoryQueue {
    fn depth(&self) -> usize {
        self.messages.len() + self.in_flight.len()
    }

    /// Return a message for redelivery or dead-letter it when it has used up
    /// its deliveries
    fn requeue(&mut self, message: StoredMessage, reason: &str, max_delivery_count: u32) {
        if message.delivery_count >= max_delivery_count {
            warn!(
                sequence_number = message.sequence_number,
                delivery_count = message.delivery_count,
                "Moving message to dead letter queue"
            );
            self.dead_letter.push(DeadLetteredMessage {
                message,
                reason: format!("max delivery count exceeded: {}", reason),
            });
        } else {
            self.messages.push_front(message);
        }
    }

    /// Release expired locks and drop expired messages
    fn reclaim(&mut self, now: Instant, max_delivery_count: u32) {
        let mut expired: Vec<StoredMessage> = Vec::new();
        self.in_flight.retain(|_, in_flight| {
            if in_flight.lock_expires_at <= now {
                expired.push(in_flight.message.clone());
                false
            } else {
                true
            }
        });

        // push_front in descending order keeps redeliveries in sequence order
        expired.sort_by(|a, b| b.sequence_number.cmp(&a.sequence_number));
        for message in expired {
            debug!(
                sequence_number = message.sequence_number,
                "Lock expired, message available for redelivery"
            );
            self.requeue(message, "lock expired", max_delivery_count);
        }

        let (live, dead): (Vec<_>, Vec<_>) =
            self.messages.drain(..).partition(|m| !m.is_expired());
        self.messages = live.into();
        self.dead_letter
            .extend(dead.into_iter().map(|message| DeadLetteredMessage {
                message,
                reason: "time to live expired".to_string(),
            }));
    }
}

/// A message stored in the broker with delivery metadata
#[derive(Clone)]
struct StoredMessage {
    sequence_number: u64,
    message_id: MessageId,
    body: Bytes,
    metadata: HashMap<String, String>,
    correlation_id: Option<String>,
    enqueued_at: Timestamp,
    delivery_count: u32,
    expires_at: Option<Timestamp>,
}

impl StoredMessage {
    fn from_message(message: &Message, sequence_number: u64) -> Self {
        let now = Timestamp::now();
        let expires_at = message.time_to_live.map(|ttl| now.plus(ttl));

        Self {
            sequence_number,
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            metadata: message.metadata.clone(),
            correlation_id: message.correlation_id.clone(),
            enqueued_at: now,
            delivery_count: 0,
            expires_at,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .as_ref()
            .is_some_and(|expires_at| Timestamp::now() >= *expires_at)
    }

    fn delivery_id(&self) -> DeliveryId {
        DeliveryId::new(self.sequence_number.to_string())
    }

    fn to_received(&self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            body: self.body.clone(),
            metadata: self.metadata.clone(),
            correlation_id: self.correlation_id.clone(),
            delivery_id: self.delivery_id(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at.clone(),
            delivered_at: Timestamp::now(),
        }
    }
}

/// A delivered message awaiting ack or nack
struct InFlightMessage {
    message: StoredMessage,
    lock_expires_at: Instant,
}

struct DeadLetteredMessage {
    message: StoredMessage,
    reason: String,
}

/// One-shot failures injected by tests
#[derive(Default)]
struct Faults {
    next_connect: Option<BusError>,
    send_failure_at: Option<usize>,
    unreachable: bool,
}

/// Record of broker-side activity
#[derive(Default)]
struct ActivityLog {
    connect_attempts: u64,
    committed_messages: u64,
    acks: Vec<DeliveryId>,
    nacks: Vec<(DeliveryId, String)>,
}

struct Broker {
    config: InMemoryConfig,
    storage: RwLock<BrokerStorage>,
    arrivals: Notify,
    epoch: AtomicU64,
    next_connection_id: AtomicU64,
    links: Mutex<HashMap<(u64, LinkId), LinkSpec>>,
    faults: Mutex<Faults>,
    activity: Mutex<ActivityLog>,
}

impl Broker {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            config,
            storage: RwLock::new(BrokerStorage::default()),
            arrivals: Notify::new(),
            epoch: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(1),
            links: Mutex::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            activity: Mutex::new(ActivityLog::default()),
        }
    }

    /// Take up to `max` available messages from `entity`, locking them
    fn take_available(
        &self,
        entity: &EntityPath,
        max: u32,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let now = Instant::now();
        let mut storage = write(&self.storage);
        let queue = storage.queue_mut(entity)?;
        queue.reclaim(now, self.config.max_delivery_count);

        let mut delivered = Vec::new();
        while delivered.len() < max as usize {
            let Some(mut message) = queue.messages.pop_front() else {
                break;
            };
            message.delivery_count = message.delivery_count.saturating_add(1);

            delivered.push(message.to_received());
            queue.in_flight.insert(
                message.delivery_id(),
                InFlightMessage {
                    message,
                    lock_expires_at: now + self.config.lock_duration,
                },
            );
        }

        Ok(delivered)
    }

    fn settle(
        &self,
        entity: &EntityPath,
        delivery_id: &DeliveryId,
    ) -> Result<StoredMessage, BusError> {
        let mut storage = write(&self.storage);
        storage
            .queue_mut(entity)?
            .in_flight
            .remove(delivery_id)
            .map(|in_flight| in_flight.message)
            .ok_or_else(|| BusError::DeliveryNotFound {
                delivery_id: delivery_id.to_string(),
            })
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

/// In-memory broker exposed through the [`Transport`] trait
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl InMemoryTransport {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            broker: Arc::new(Broker::new(config)),
        }
    }

    /// Declare a queue up front
    pub fn create_queue(&self, name: EntityName) {
        let mut storage = write(&self.broker.storage);
        let _ = storage.ensure_entity(&EntityPath::queue(name), true);
    }

    /// Declare a topic subscription (and its topic) up front
    pub fn create_subscription(&self, topic: EntityName, subscription: EntityName) {
        let mut storage = write(&self.broker.storage);
        let _ = storage.ensure_entity(&EntityPath::subscription(topic, subscription), true);
    }

    // ------------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------------

    /// Make the next `connect` call fail with `error`
    pub fn fail_next_connect(&self, error: BusError) {
        lock(&self.broker.faults).next_connect = Some(error);
    }

    /// Make the next batch with more than `index` messages drop the connection
    /// while message `index` is being staged
    pub fn fail_send_at_index(&self, index: usize) {
        lock(&self.broker.faults).send_failure_at = Some(index);
    }

    /// Start or end an outage. While unreachable every `connect` fails with
    /// [`BusError::Network`]; starting an outage also drops open connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.broker.faults).unreachable = unreachable;
        if unreachable {
            self.disconnect_all();
        } else {
            info!("In-memory broker reachable again");
        }
    }

    /// Drop every open connection, as a network partition would
    pub fn disconnect_all(&self) {
        self.broker.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.broker.links).clear();
        self.broker.arrivals.notify_waiters();
        info!("All in-memory connections dropped");
    }

    /// Expire every lock on `entity` so in-flight messages are redelivered on
    /// the next receive
    pub fn expire_locks(&self, entity: &EntityPath) {
        let now = Instant::now();
        let mut storage = write(&self.broker.storage);
        if let Ok(queue) = storage.queue_mut(entity) {
            for in_flight in queue.in_flight.values_mut() {
                in_flight.lock_expires_at = now;
            }
        }
        drop(storage);
        self.broker.arrivals.notify_waiters();
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Messages waiting for delivery
    pub fn active_count(&self, entity: &EntityPath) -> usize {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map_or(0, |q| q.messages.len())
    }

    /// Messages delivered but not yet settled
    pub fn in_flight_count(&self, entity: &EntityPath) -> usize {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map_or(0, |q| q.in_flight.len())
    }

    pub fn dead_letter_count(&self, entity: &EntityPath) -> usize {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map_or(0, |q| q.dead_letter.len())
    }

    pub fn dead_letter_reasons(&self, entity: &EntityPath) -> Vec<String> {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map(|q| q.dead_letter.iter().map(|d| d.reason.clone()).collect())
            .unwrap_or_default()
    }

    /// Bodies of dead-lettered messages, oldest first
    pub fn dead_letter_bodies(&self, entity: &EntityPath) -> Vec<Bytes> {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map(|q| q.dead_letter.iter().map(|d| d.message.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Bodies of messages waiting for delivery, in delivery order
    pub fn active_bodies(&self, entity: &EntityPath) -> Vec<Bytes> {
        read(&self.broker.storage)
            .entities
            .get(entity)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Total messages committed by `send_batch` (before topic fan-out)
    pub fn committed_count(&self) -> u64 {
        lock(&self.broker.activity).committed_messages
    }

    pub fn connect_attempts(&self) -> u64 {
        lock(&self.broker.activity).connect_attempts
    }

    pub fn ack_log(&self) -> Vec<DeliveryId> {
        lock(&self.broker.activity).acks.clone()
    }

    pub fn nack_log(&self) -> Vec<(DeliveryId, String)> {
        lock(&self.broker.activity).nacks.clone()
    }

    pub fn open_link_count(&self) -> usize {
        lock(&self.broker.links).len()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, BusError> {
        lock(&self.broker.activity).connect_attempts += 1;

        {
            let mut faults = lock(&self.broker.faults);
            if let Some(error) = faults.next_connect.take() {
                debug!(endpoint = %endpoint, error = %error, "Injected connect failure");
                return Err(error);
            }
            if faults.unreachable {
                return Err(BusError::Network {
                    message: format!("{} is unreachable", endpoint),
                });
            }
        }

        if let Some(required) = &self.broker.config.required_secret {
            if credentials.secret() != Some(required.as_str()) {
                return Err(BusError::Authentication {
                    message: format!("credentials rejected by {}", endpoint),
                });
            }
        }

        let id = self.broker.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(endpoint = %endpoint, connection_id = id, "Accepted in-memory connection");

        Ok(Arc::new(InMemoryConnection {
            id,
            epoch: self.broker.epoch.load(Ordering::SeqCst),
            open: AtomicBool::new(true),
            next_link: AtomicU64::new(1),
            broker: self.broker.clone(),
        }))
    }
}

// ============================================================================
// InMemoryConnection
// ============================================================================

struct InMemoryConnection {
    id: u64,
    epoch: u64,
    open: AtomicBool,
    next_link: AtomicU64,
    broker: Arc<Broker>,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::Network {
                message: format!("connection {} is not open", self.id),
            })
        }
    }

    fn ensure_link(&self, link: &Link, direction: LinkDirection) -> Result<(), BusError> {
        self.ensure_open()?;

        if !lock(&self.broker.links).contains_key(&(self.id, link.id())) {
            return Err(BusError::LinkClosed {
                link: link.to_string(),
            });
        }
        if link.direction() != direction {
            return Err(BusError::transport(
                "link",
                format!("{} cannot be used for {:?}", link, direction),
            ));
        }
        Ok(())
    }

    /// Drop this connection only
    fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.broker.links).retain(|(connection, _), _| *connection != self.id);
        self.broker.arrivals.notify_waiters();
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn open_link(&self, spec: &LinkSpec) -> Result<Link, BusError> {
        self.ensure_open()?;

        let allowed = match spec.direction {
            LinkDirection::Send => spec.entity.accepts_sends(),
            LinkDirection::Receive => spec.entity.accepts_receives(),
        };
        if !allowed {
            return Err(BusError::transport(
                "open_link",
                format!("{:?} link not supported on {}", spec.direction, spec.entity),
            ));
        }

        write(&self.broker.storage)
            .ensure_entity(&spec.entity, self.broker.config.auto_create_entities)?;

        let link = Link::new(
            LinkId::new(self.next_link.fetch_add(1, Ordering::SeqCst)),
            spec.clone(),
        );
        lock(&self.broker.links).insert((self.id, link.id()), spec.clone());

        Ok(link)
    }

    async fn close_link(&self, link: &Link) -> Result<(), BusError> {
        lock(&self.broker.links).remove(&(self.id, link.id()));
        Ok(())
    }

    async fn send_batch(&self, link: &Link, messages: &[Message]) -> Result<(), BusError> {
        self.ensure_link(link, LinkDirection::Send)?;

        let max_size = self.broker.config.max_message_size;
        if let Some(oversized) = messages.iter().find(|m| m.size_in_bytes() > max_size) {
            return Err(BusError::MessageTooLarge {
                size: oversized.size_in_bytes(),
                max_size,
            });
        }

        let fail_at = {
            let mut faults = lock(&self.broker.faults);
            match faults.send_failure_at {
                Some(index) if index < messages.len() => {
                    faults.send_failure_at = None;
                    Some(index)
                }
                _ => None,
            }
        };

        let mut storage = write(&self.broker.storage);
        let targets = storage.targets(link.entity())?;

        let max_entity_size = self.broker.config.max_entity_size;
        for target in &targets {
            let depth = storage.queue_mut(target)?.depth();
            if depth + messages.len() > max_entity_size {
                return Err(BusError::transport(
                    "send",
                    format!("{} is full ({} messages)", target, depth),
                ));
            }
        }

        // Stage the whole batch before touching any entity
        let mut staged = Vec::with_capacity(messages.len());
        for (index, message) in messages.iter().enumerate() {
            if fail_at == Some(index) {
                drop(storage);
                self.sever();
                return Err(BusError::Network {
                    message: format!(
                        "connection dropped while staging message {} of {}",
                        index,
                        messages.len()
                    ),
                });
            }
            storage.next_sequence += 1;
            staged.push(StoredMessage::from_message(message, storage.next_sequence));
        }

        for target in &targets {
            let queue = storage.queue_mut(target)?;
            queue.messages.extend(staged.iter().cloned());
        }
        drop(storage);

        lock(&self.broker.activity).committed_messages += messages.len() as u64;
        self.broker.arrivals.notify_waiters();
        debug!(link = %link, count = messages.len(), "Committed batch");

        Ok(())
    }

    async fn receive(
        &self,
        link: &Link,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.broker.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_link(link, LinkDirection::Receive)?;

            let delivered = self.broker.take_available(link.entity(), max_messages)?;
            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }

            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    async fn ack(&self, link: &Link, delivery_id: &DeliveryId) -> Result<(), BusError> {
        self.ensure_link(link, LinkDirection::Receive)?;

        self.broker.settle(link.entity(), delivery_id)?;
        lock(&self.broker.activity).acks.push(delivery_id.clone());

        Ok(())
    }

    async fn nack(
        &self,
        link: &Link,
        delivery_id: &DeliveryId,
        reason: &str,
    ) -> Result<(), BusError> {
        self.ensure_link(link, LinkDirection::Receive)?;

        let message = self.broker.settle(link.entity(), delivery_id)?;
        {
            let mut storage = write(&self.broker.storage);
            storage
                .queue_mut(link.entity())?
                .requeue(message, reason, self.broker.config.max_delivery_count);
        }
        lock(&self.broker.activity)
            .nacks
            .push((delivery_id.clone(), reason.to_string()));
        self.broker.arrivals.notify_waiters();

        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.open.load(Ordering::SeqCst) {
            self.sever();
            debug!(connection_id = self.id, "In-memory connection closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.epoch == self.broker.epoch.load(Ordering::SeqCst)
    }
}
