//! # Bus Runtime
//!
//! Protocol-agnostic message broker client core: connection lifecycle,
//! batched sends, concurrent receive and dispatch, error routing and graceful
//! shutdown drain.
//!
//! This library provides:
//! - A [`Transport`]/[`Connection`] abstraction any broker protocol can implement
//! - A batching [`Sender`] with all-or-nothing batch submission
//! - A [`Processor`] that dispatches to a handler with bounded concurrency and
//!   never runs two handlers on the same delivery at once
//! - An [`ErrorRouter`] that delivers background failures to one callback
//! - Transparent reconnects with exponential backoff
//! - An in-memory broker for tests and local development
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`message`] - Message structures and identifiers
//! - [`link`] - Entity paths and links
//! - [`transport`] - Transport and connection traits
//! - [`sender`] - Batches and the sender
//! - [`processor`] - Dispatching processor and its lifecycle
//! - [`client`] - Client entry point and shutdown coordination
//!
//! ## Example
//!
//! ```rust,no_run
//! use bus_runtime::{BusClient, BusConfig, EntityName, EntityPath, ErrorRouter, HandlerError, Message, ReceivedMessage};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, _broker) = BusClient::in_memory(&BusConfig::default()).await?;
//! let queue = EntityPath::queue(EntityName::new("orders".to_string())?);
//!
//! let sender = client.create_sender(queue.clone()).await?;
//! let mut batch = sender.create_batch();
//! batch.try_add(&Message::from("hello"));
//! sender.send(&batch).await?;
//!
//! let processor = client.create_processor(queue, Default::default()).await?;
//! processor
//!     .start(
//!         Arc::new(|message: ReceivedMessage| async move {
//!             println!("{}", message.body_text());
//!             Ok::<(), HandlerError>(())
//!         }),
//!         ErrorRouter::logging_only(),
//!     )
//!     .await?;
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod error_router;
pub mod handler;
pub mod in_flight;
pub mod link;
pub mod message;
pub mod processor;
pub mod providers;
pub mod retry;
pub mod sender;
pub mod stream;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use client::BusClient;
pub use config::{BatchOptions, BusConfig, ClientOptions, InMemoryConfig, ProcessorOptions};
pub use error::{BusError, ConfigurationError, HandlerError, ValidationError};
pub use error_router::{
    ErrorContext, ErrorEvent, ErrorHandler, ErrorRouter, ErrorSource, ProcessingError,
};
pub use handler::MessageHandler;
pub use in_flight::InFlightSet;
pub use link::{EntityPath, Link, LinkDirection, LinkId, LinkSpec};
pub use message::{DeliveryId, EntityName, Message, MessageId, ReceivedMessage, Timestamp};
pub use processor::{Processor, ProcessorState};
pub use providers::InMemoryTransport;
pub use retry::RetryPolicy;
pub use sender::{MessageBatch, Sender};
pub use transport::{Connection, Credentials, Endpoint, Transport};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
