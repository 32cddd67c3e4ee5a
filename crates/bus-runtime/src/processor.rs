//! Concurrent message processor with graceful drain.
//!
//! One receive task pulls from the broker and hands messages to
//! `concurrency_limit` dispatch slots through a bounded channel. Each slot
//! runs the handler for one message at a time and settles it (ack on success,
//! nack on failure) before taking the next.
//!
//! ```text
//! Created --start--> Started --stop--> Draining --> Stopped
//! ```
//!
//! `stop()` cancels the receive task, returns prefetched but undispatched
//! messages to the broker, waits for running handlers (bounded by the drain
//! timeout) and finally releases the link.

use crate::config::ProcessorOptions;
use crate::connection::{ConnectionHandle, ManagedLink};
use crate::error::BusError;
use crate::error_router::{ErrorContext, ErrorRouter, ErrorSource, ProcessingError};
use crate::handler::{self, MessageHandler};
use crate::in_flight::InFlightSet;
use crate::link::{EntityPath, LinkSpec};
use crate::message::{DeliveryId, ReceivedMessage};
use crate::stream::ReceiveStream;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

const DRAINING_REASON: &str = "processor draining";
const DRAIN_TIMEOUT_REASON: &str = "drain timeout";

/// Processor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    Created,
    Started,
    Draining,
    Stopped,
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

type SharedQueue = Arc<Mutex<mpsc::Receiver<ReceivedMessage>>>;

/// Tasks and resources owned while the processor runs
struct Running {
    link: Arc<ManagedLink>,
    errors: ErrorRouter,
    cancel: CancellationToken,
    receive_task: JoinHandle<Vec<ReceivedMessage>>,
    queue: SharedQueue,
    slots: Vec<JoinHandle<()>>,
}

struct ProcessorInner {
    entity: EntityPath,
    handle: Arc<ConnectionHandle>,
    options: ProcessorOptions,
    state: StdMutex<ProcessorState>,
    /// Serializes start and stop
    lifecycle: Mutex<Option<Running>>,
    in_flight: InFlightSet,
}

/// Receives messages from a queue or subscription and dispatches them to a
/// handler
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    pub(crate) fn new(
        entity: EntityPath,
        handle: Arc<ConnectionHandle>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                entity,
                handle,
                options,
                state: StdMutex::new(ProcessorState::Created),
                lifecycle: Mutex::new(None),
                in_flight: InFlightSet::new(),
            }),
        }
    }

    pub fn entity(&self) -> &EntityPath {
        &self.inner.entity
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ProcessorState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliveries whose handler is currently running
    pub fn in_flight(&self) -> InFlightSet {
        self.inner.in_flight.clone()
    }

    fn set_state(&self, next: ProcessorState) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *state, next);
        debug!(entity = %self.inner.entity, from = %previous, to = %next, "Processor state change");
    }

    /// Open the receive link and begin dispatching to `handler`.
    ///
    /// Only valid in [`ProcessorState::Created`]. Failures after this call
    /// returns are routed to `errors` and never surface here.
    pub async fn start(
        &self,
        handler: Arc<dyn MessageHandler>,
        errors: ErrorRouter,
    ) -> Result<(), BusError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        let current = self.state();
        if current != ProcessorState::Created {
            return Err(BusError::InvalidState {
                from: current.to_string(),
                to: ProcessorState::Started.to_string(),
            });
        }

        let link = Arc::new(
            ManagedLink::open(
                self.inner.handle.clone(),
                LinkSpec::receiver(self.inner.entity.clone()),
            )
            .await?,
        );

        let cancel = CancellationToken::new();
        let limit = self.inner.options.concurrency_limit;
        let (tx, rx) = mpsc::channel(limit);
        let queue: SharedQueue = Arc::new(Mutex::new(rx));

        let stream = ReceiveStream::new(
            link.clone(),
            errors.clone(),
            cancel.clone(),
            self.inner.options.max_messages_per_receive,
            self.inner.options.receive_wait,
        );
        let receive_task = tokio::spawn(receive_loop(stream, tx, cancel.clone()));

        let slots = (0..limit)
            .map(|slot| {
                let dispatcher = Dispatcher {
                    slot,
                    entity: self.inner.entity.clone(),
                    link: link.clone(),
                    handler: handler.clone(),
                    errors: errors.clone(),
                    in_flight: self.inner.in_flight.clone(),
                };
                tokio::spawn(dispatcher.run(queue.clone(), cancel.clone()))
            })
            .collect();

        *lifecycle = Some(Running {
            link,
            errors,
            cancel,
            receive_task,
            queue,
            slots,
        });
        self.set_state(ProcessorState::Started);

        info!(
            entity = %self.inner.entity,
            concurrency_limit = limit,
            "Processor started"
        );
        Ok(())
    }

    /// Stop receiving, wait for running handlers and release the link.
    ///
    /// Safe to call in any state and any number of times; a processor that
    /// was never started or is already stopped is left as is. Concurrent
    /// callers wait for the first one to finish.
    pub async fn stop(&self) -> Result<(), BusError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;

        if self.state() != ProcessorState::Started {
            return Ok(());
        }
        self.set_state(ProcessorState::Draining);

        let Some(Running {
            link,
            errors,
            cancel,
            receive_task,
            queue,
            slots,
        }) = lifecycle.take()
        else {
            self.set_state(ProcessorState::Stopped);
            return Ok(());
        };

        info!(entity = %self.inner.entity, "Processor draining");
        cancel.cancel();

        let mut undispatched = match receive_task.await {
            Ok(leftovers) => leftovers,
            Err(e) => {
                error!(entity = %self.inner.entity, error = %e, "Receive task failed");
                Vec::new()
            }
        };
        {
            let mut queue = queue.lock().await;
            queue.close();
            while let Ok(message) = queue.try_recv() {
                undispatched.push(message);
            }
        }
        for message in undispatched {
            self.abandon(&link, &errors, &message.delivery_id, DRAINING_REASON)
                .await;
        }

        let slots = futures::future::join_all(slots);
        match self.inner.options.drain_deadline() {
            None => {
                slots.await;
            }
            Some(deadline) => {
                if tokio::time::timeout(deadline, slots).await.is_err() {
                    let abandoned = self.inner.in_flight.revoke_all();
                    warn!(
                        entity = %self.inner.entity,
                        count = abandoned.len(),
                        timeout_ms = deadline.as_millis() as u64,
                        "Drain timed out, returning in-flight messages"
                    );
                    for delivery_id in abandoned {
                        self.abandon(&link, &errors, &delivery_id, DRAIN_TIMEOUT_REASON)
                            .await;
                    }
                }
            }
        }

        if let Err(e) = link.close().await {
            errors
                .report(e, ErrorContext::new(ErrorSource::Close, self.inner.entity.clone()))
                .await;
        }

        self.set_state(ProcessorState::Stopped);
        info!(entity = %self.inner.entity, "Processor stopped");
        Ok(())
    }

    async fn abandon(
        &self,
        link: &ManagedLink,
        errors: &ErrorRouter,
        delivery_id: &DeliveryId,
        reason: &str,
    ) {
        if let Err(e) = link.nack(delivery_id, reason).await {
            errors
                .report(
                    e,
                    ErrorContext::new(ErrorSource::Abandon, self.inner.entity.clone())
                        .with_delivery(delivery_id.clone()),
                )
                .await;
        }
    }
}

/// Pull messages and feed the dispatch channel until cancelled.
///
/// Returns messages that were received but never handed to a slot.
async fn receive_loop(
    mut stream: ReceiveStream,
    tx: mpsc::Sender<ReceivedMessage>,
    cancel: CancellationToken,
) -> Vec<ReceivedMessage> {
    let mut leftovers = Vec::new();

    while let Some(message) = stream.next_message().await {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };

        match permit {
            Some(permit) => permit.send(message),
            None => {
                leftovers.push(message);
                break;
            }
        }
    }

    leftovers.extend(stream.take_buffered());
    debug!(undispatched = leftovers.len(), "Receive loop finished");
    leftovers
}

/// One dispatch slot
struct Dispatcher {
    slot: usize,
    entity: EntityPath,
    link: Arc<ManagedLink>,
    handler: Arc<dyn MessageHandler>,
    errors: ErrorRouter,
    in_flight: InFlightSet,
}

impl Dispatcher {
    async fn run(self, queue: SharedQueue, cancel: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                message = async { queue.lock().await.recv().await } => message,
            };

            let Some(message) = next else {
                break;
            };
            self.dispatch(message).await;
        }
        debug!(slot = self.slot, entity = %self.entity, "Dispatch slot finished");
    }

    async fn dispatch(&self, message: ReceivedMessage) {
        let delivery_id = message.delivery_id.clone();

        let Some(guard) = self.in_flight.try_insert(delivery_id.clone()) else {
            debug!(
                slot = self.slot,
                delivery_id = %delivery_id,
                "Delivery already in flight, skipping duplicate"
            );
            return;
        };

        debug!(
            slot = self.slot,
            delivery_id = %delivery_id,
            delivery_count = message.delivery_count,
            "Dispatching message"
        );
        let outcome = handler::invoke(self.handler.as_ref(), message).await;

        if !guard.try_settle() {
            debug!(delivery_id = %delivery_id, "Delivery already returned by drain timeout");
            return;
        }

        match outcome {
            Ok(()) => {
                if let Err(e) = self.link.ack(&delivery_id).await {
                    self.report(e.into(), ErrorSource::Complete, &delivery_id)
                        .await;
                }
            }
            Err(handler_error) => {
                if let Err(e) = self.link.nack(&delivery_id, &handler_error.reason).await {
                    self.report(e.into(), ErrorSource::Abandon, &delivery_id)
                        .await;
                }
                self.report(handler_error.into(), ErrorSource::Handler, &delivery_id)
                    .await;
            }
        }

        drop(guard);
    }

    async fn report(
        &self,
        error: ProcessingError,
        source: ErrorSource,
        delivery_id: &DeliveryId,
    ) {
        self.errors
            .report(
                error,
                ErrorContext::new(source, self.entity.clone()).with_delivery(delivery_id.clone()),
            )
            .await;
    }
}
