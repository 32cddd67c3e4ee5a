//! User message handlers.

use crate::error::HandlerError;
use crate::message::ReceivedMessage;
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Processes one received message.
///
/// Returning `Ok` acknowledges the delivery; returning `Err` returns it to the
/// broker with the error's reason. A panic is treated like an `Err`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: ReceivedMessage) -> Result<(), HandlerError> {
        (self)(message).await
    }
}

/// Run `handler`, converting a panic into a [`HandlerError`]
pub(crate) async fn invoke(
    handler: &dyn MessageHandler,
    message: ReceivedMessage,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(HandlerError::new(format!("handler panicked: {}", detail)))
        }
    }
}
