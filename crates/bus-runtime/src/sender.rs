//! Batching sender.
//!
//! A [`MessageBatch`] accumulates messages up to a size and count limit;
//! [`Sender::send`] submits it as one atomic transport call. Adding a message
//! that would exceed a limit is refused without disturbing the batch.

use crate::config::BatchOptions;
use crate::connection::ManagedLink;
use crate::error::BusError;
use crate::link::EntityPath;
use crate::message::Message;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Ordered group of messages sent in one transport call
#[derive(Debug, Clone)]
pub struct MessageBatch {
    max_bytes: usize,
    max_count: usize,
    size_in_bytes: usize,
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(max_bytes: usize, max_count: usize) -> Self {
        Self {
            max_bytes,
            max_count,
            size_in_bytes: 0,
            messages: Vec::new(),
        }
    }

    pub fn with_options(options: BatchOptions) -> Self {
        Self::new(options.max_batch_bytes, options.max_batch_count)
    }

    /// Add `message` if it fits.
    ///
    /// Returns `false` and leaves the batch untouched when either the count or
    /// the byte limit would be exceeded.
    pub fn try_add(&mut self, message: &Message) -> bool {
        if self.messages.len() >= self.max_count {
            return false;
        }

        let size = message.size_in_bytes();
        if self.size_in_bytes + size > self.max_bytes {
            return false;
        }

        self.size_in_bytes += size;
        self.messages.push(message.clone());
        true
    }

    /// Add every message that fits, returning the indices that were refused
    pub fn add_all<'a>(&mut self, messages: impl IntoIterator<Item = &'a Message>) -> Vec<usize> {
        messages
            .into_iter()
            .enumerate()
            .filter_map(|(index, message)| (!self.try_add(message)).then_some(index))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

struct SenderInner {
    entity: EntityPath,
    link: ManagedLink,
    options: BatchOptions,
    outstanding: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

/// Decrements the outstanding-send counter on every exit path
struct OutstandingSend<'a>(&'a SenderInner);

impl<'a> OutstandingSend<'a> {
    fn begin(inner: &'a SenderInner) -> Self {
        inner.outstanding.fetch_add(1, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for OutstandingSend<'_> {
    fn drop(&mut self) {
        if self.0.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Sends messages to one queue or topic
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    pub(crate) fn new(entity: EntityPath, link: ManagedLink, options: BatchOptions) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                entity,
                link,
                options,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn entity(&self) -> &EntityPath {
        &self.inner.entity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Empty batch with this sender's limits
    pub fn create_batch(&self) -> MessageBatch {
        MessageBatch::with_options(self.inner.options)
    }

    /// Submit `batch` atomically.
    ///
    /// On error nothing was committed and the batch is unchanged, so it can be
    /// sent again. An empty batch is a no-op.
    #[instrument(skip(self, batch), fields(entity = %self.inner.entity, count = batch.len()))]
    pub async fn send(&self, batch: &MessageBatch) -> Result<(), BusError> {
        // Registered before the closed check so a concurrent close waits for us
        let _outstanding = OutstandingSend::begin(&self.inner);
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let binding = self.inner.link.ready_binding().await?;

        match binding
            .connection
            .send_batch(&binding.link, batch.messages())
            .await
        {
            Ok(()) => {
                debug!(bytes = batch.size_in_bytes(), "Batch sent");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Batch send failed, nothing committed");
                if e.requires_reconnect() {
                    // Prepare the link for the caller's retry; the send itself
                    // is never replayed here
                    if let Err(recover_error) = self.inner.link.recover(&binding).await {
                        debug!(error = %recover_error, "Link recovery after failed send did not succeed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Send a single message
    pub async fn send_message(&self, message: Message) -> Result<(), BusError> {
        let mut batch = self.create_batch();
        if !batch.try_add(&message) {
            return Err(BusError::MessageTooLarge {
                size: message.size_in_bytes(),
                max_size: batch.max_bytes(),
            });
        }
        self.send(&batch).await
    }

    /// Send `messages` in order, splitting them across as many batches as the
    /// limits require. Returns the number of batches sent.
    ///
    /// Fails with [`BusError::MessageTooLarge`] before sending anything if a
    /// single message cannot fit in an empty batch.
    pub async fn send_messages(&self, messages: Vec<Message>) -> Result<usize, BusError> {
        let limit = self.inner.options.max_batch_bytes;
        if let Some(oversized) = messages.iter().find(|m| m.size_in_bytes() > limit) {
            return Err(BusError::MessageTooLarge {
                size: oversized.size_in_bytes(),
                max_size: limit,
            });
        }

        let mut sent = 0;
        let mut batch = self.create_batch();
        for message in &messages {
            if !batch.try_add(message) {
                self.send(&batch).await?;
                sent += 1;

                batch = self.create_batch();
                if !batch.try_add(message) {
                    return Err(BusError::MessageTooLarge {
                        size: message.size_in_bytes(),
                        max_size: limit,
                    });
                }
            }
        }

        if !batch.is_empty() {
            self.send(&batch).await?;
            sent += 1;
        }

        Ok(sent)
    }

    /// Wait until no send is in progress
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Release the sending link. Subsequent calls are no-ops.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.wait_idle().await;
        self.inner.link.close().await?;
        info!(entity = %self.inner.entity, "Sender closed");
        Ok(())
    }
}
