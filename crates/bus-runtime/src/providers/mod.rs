//! Transport implementations.
//!
//! This module contains concrete implementations of the `Transport` and
//! `Connection` traits. Wire-protocol transports live in their own crates;
//! the in-memory broker ships here for tests and local development.

pub mod memory;

pub use memory::InMemoryTransport;
