//! Pull-based stream of received messages over a managed link.
//!
//! Receive and reconnect failures are reported and retried with backoff; the
//! stream only ends when it is cancelled or its link is closed.

use crate::connection::ManagedLink;
use crate::error::BusError;
use crate::error_router::{ErrorContext, ErrorRouter, ErrorSource};
use crate::message::ReceivedMessage;
use crate::retry::{RetryPolicy, RetryState};
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;

pub struct ReceiveStream {
    link: Arc<ManagedLink>,
    errors: ErrorRouter,
    cancel: CancellationToken,
    max_messages: u32,
    wait: Duration,
    backoff: RetryPolicy,
    buffer: VecDeque<ReceivedMessage>,
}

impl ReceiveStream {
    pub fn new(
        link: Arc<ManagedLink>,
        errors: ErrorRouter,
        cancel: CancellationToken,
        max_messages: u32,
        wait: Duration,
    ) -> Self {
        Self {
            link,
            errors,
            cancel,
            max_messages,
            wait,
            backoff: RetryPolicy::new(0, Duration::from_millis(50), Duration::from_secs(5), 2.0),
            buffer: VecDeque::new(),
        }
    }

    /// Next message, or `None` once the stream was cancelled or its link closed.
    ///
    /// Failures never end the stream: they are reported, followed by a backoff,
    /// and the pull is retried until the owner cancels.
    pub async fn next_message(&mut self) -> Option<ReceivedMessage> {
        let mut retry_state = RetryState::new();

        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Some(message);
            }
            if self.cancel.is_cancelled() {
                return None;
            }

            let binding = match self.until_cancelled(self.link.ready_binding()).await? {
                Ok(binding) => binding,
                Err(BusError::Closed) => return None,
                Err(e) => {
                    self.report(e, ErrorSource::Reconnect).await;
                    self.back_off(&mut retry_state).await?;
                    continue;
                }
            };

            let received = self
                .until_cancelled(binding.connection.receive(
                    &binding.link,
                    self.max_messages,
                    self.wait,
                ))
                .await?;

            match received {
                Ok(messages) => {
                    retry_state = RetryState::new();
                    if !messages.is_empty() {
                        debug!(
                            link = %binding.link,
                            count = messages.len(),
                            "Received messages"
                        );
                    }
                    self.buffer.extend(messages);
                }
                Err(BusError::Closed) => return None,
                Err(e) if e.requires_reconnect() => {
                    self.report(e, ErrorSource::Receive).await;
                    match self.until_cancelled(self.link.recover(&binding)).await? {
                        Ok(_) => {}
                        Err(BusError::Closed) => return None,
                        Err(e) => {
                            self.report(e, ErrorSource::Reconnect).await;
                            self.back_off(&mut retry_state).await?;
                        }
                    }
                }
                Err(e) => {
                    self.report(e, ErrorSource::Receive).await;
                    self.back_off(&mut retry_state).await?;
                }
            }
        }
    }

    /// Messages received but not yet handed out
    pub fn take_buffered(&mut self) -> Vec<ReceivedMessage> {
        self.buffer.drain(..).collect()
    }

    /// Adapt into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = ReceivedMessage> + Send {
        stream::unfold(self, |mut receiver| async move {
            receiver
                .next_message()
                .await
                .map(|message| (message, receiver))
        })
    }

    async fn report(&self, error: BusError, source: ErrorSource) {
        if self.cancel.is_cancelled() {
            return;
        }
        warn!(entity = %self.link.spec().entity, error = %error, source = %source, "Receive failed");
        self.errors
            .report(error, ErrorContext::new(source, self.link.spec().entity.clone()))
            .await;
    }

    /// Run `future` unless the stream is cancelled first
    async fn until_cancelled<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }

    /// Sleep for the next backoff step; `None` when cancelled meanwhile
    async fn back_off(&self, retry_state: &mut RetryState) -> Option<()> {
        let delay = retry_state.get_delay(&self.backoff);
        retry_state.next_attempt();
        debug!(
            entity = %self.link.spec().entity,
            delay_ms = delay.as_millis() as u64,
            "Backing off before the next receive"
        );
        self.until_cancelled(tokio::time::sleep(delay)).await
    }
}
