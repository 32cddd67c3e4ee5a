//! Delivery of background failures to a single user callback.
//!
//! Receive loops, dispatch slots and reconnects run in background tasks where
//! no caller is waiting for a `Result`. Everything they fail at is funnelled
//! through [`ErrorRouter::report`], which logs the failure and hands it to the
//! registered [`ErrorHandler`]. A panicking callback is contained here.

use crate::error::{BusError, HandlerError};
use crate::link::EntityPath;
use crate::message::DeliveryId;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

#[cfg(test)]
#[path = "error_router_tests.rs"]
mod tests;

/// Background activity that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSource {
    /// Pulling messages from the broker
    Receive,
    /// Re-establishing the connection or link
    Reconnect,
    /// The user message handler
    Handler,
    /// Acknowledging a successfully handled delivery
    Complete,
    /// Returning a failed delivery to the broker
    Abandon,
    /// Releasing links during shutdown
    Close,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Receive => "receive",
            Self::Reconnect => "reconnect",
            Self::Handler => "handler",
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::Close => "close",
        };
        write!(f, "{}", name)
    }
}

/// Where a reported failure happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub source: ErrorSource,
    pub entity: EntityPath,
    pub delivery_id: Option<DeliveryId>,
}

impl ErrorContext {
    pub fn new(source: ErrorSource, entity: EntityPath) -> Self {
        Self {
            source,
            entity,
            delivery_id: None,
        }
    }

    pub fn with_delivery(mut self, delivery_id: DeliveryId) -> Self {
        self.delivery_id = Some(delivery_id);
        self
    }
}

/// A failure that reached the error router
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Transport(#[from] BusError),
}

/// Event passed to the error callback
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: ProcessingError,
    pub context: ErrorContext,
}

/// User callback for background failures
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle_error(&self, event: ErrorEvent);
}

#[async_trait]
impl<F, Fut> ErrorHandler for F
where
    F: Fn(ErrorEvent) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle_error(&self, event: ErrorEvent) {
        (self)(event).await
    }
}

struct RouterInner {
    handler: Option<Arc<dyn ErrorHandler>>,
    reported: AtomicU64,
}

/// Routes background failures to the user callback
#[derive(Clone)]
pub struct ErrorRouter {
    inner: Arc<RouterInner>,
}

impl ErrorRouter {
    /// Router invoking `handler` for every report
    pub fn new(handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handler: Some(handler),
                reported: AtomicU64::new(0),
            }),
        }
    }

    /// Router that only logs
    pub fn logging_only() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handler: None,
                reported: AtomicU64::new(0),
            }),
        }
    }

    /// Report one failure; never fails and never panics
    pub async fn report(&self, error: impl Into<ProcessingError>, context: ErrorContext) {
        let error = error.into();
        self.inner.reported.fetch_add(1, Ordering::Relaxed);

        error!(
            source = %context.source,
            entity = %context.entity,
            delivery_id = context.delivery_id.as_ref().map(|d| d.as_str()),
            error = %error,
            "Background operation failed"
        );

        let Some(handler) = &self.inner.handler else {
            return;
        };

        let event = ErrorEvent { error, context };
        let outcome = AssertUnwindSafe(handler.handle_error(event))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            warn!("Error callback panicked; continuing");
        }
    }

    /// Number of failures reported so far
    pub fn reported_count(&self) -> u64 {
        self.inner.reported.load(Ordering::Relaxed)
    }
}

impl Default for ErrorRouter {
    fn default() -> Self {
        Self::logging_only()
    }
}

impl fmt::Debug for ErrorRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorRouter")
            .field("has_handler", &self.inner.handler.is_some())
            .field("reported", &self.reported_count())
            .finish()
    }
}
