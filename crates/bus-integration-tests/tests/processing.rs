//! Integration tests for the processor over a scripted transport
//!
//! These tests verify:
//! - Handler failures become one nack plus one error report
//! - A delivery id is never handled twice at the same time
//! - stop() waits for handlers that are mid-flight
//! - stop() is idempotent and safe to call concurrently

mod common;

use bus_runtime::{
    ErrorSource, HandlerError, ProcessingError, ProcessorOptions, ProcessorState, ReceivedMessage,
};
use common::{delivery, queue, wait_for, RecordedErrors, ScriptedTransport};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn options(concurrency: usize) -> ProcessorOptions {
    ProcessorOptions::default()
        .with_concurrency_limit(concurrency)
        .with_receive_wait(Duration::from_millis(10))
}

/// Verify that a failing handler produces exactly one abandon and one report
#[tokio::test]
async fn test_handler_failure_is_abandoned_and_reported() {
    // Arrange
    let transport = ScriptedTransport::new();
    transport.deliver(delivery("42", "poison"));
    let client = transport.client().await;
    let errors = RecordedErrors::new();

    let processor = client.create_processor(queue("orders"), options(1)).await.unwrap();

    // Act
    processor
        .start(
            Arc::new(|_message: ReceivedMessage| async move {
                Err::<(), HandlerError>(HandlerError::new("boom"))
            }),
            errors.router(),
        )
        .await
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || !errors.events().is_empty()).await);
    processor.stop().await.unwrap();

    // Assert
    let nacks = transport.nacks();
    assert_eq!(nacks.len(), 1);
    assert_eq!(nacks[0].0.as_str(), "42");
    assert_eq!(nacks[0].1, "boom");
    assert!(transport.acks().is_empty());

    let handler_errors = errors.from_source(ErrorSource::Handler);
    assert_eq!(handler_errors.len(), 1);
    assert_eq!(
        handler_errors[0].context.delivery_id.as_ref().map(|id| id.as_str()),
        Some("42")
    );
    assert!(matches!(handler_errors[0].error, ProcessingError::Handler(_)));
    assert_eq!(errors.events().len(), 1);
}

/// Verify that a redelivered id is skipped while the first copy is in flight
#[tokio::test]
async fn test_duplicate_delivery_is_not_dispatched_twice() {
    let transport = ScriptedTransport::new();
    let client = transport.client().await;
    let processor = client.create_processor(queue("orders"), options(4)).await.unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let handler = {
        let invocations = invocations.clone();
        let release = release.clone();
        move |_message: ReceivedMessage| {
            let invocations = invocations.clone();
            let release = release.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                release.notified().await;
                Ok::<(), HandlerError>(())
            }
        }
    };
    processor
        .start(Arc::new(handler), RecordedErrors::new().router())
        .await
        .unwrap();

    transport.deliver(delivery("7", "first copy"));
    assert!(wait_for(Duration::from_secs(5), || invocations.load(Ordering::SeqCst) == 1).await);
    transport.deliver(delivery("7", "second copy"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(processor.in_flight().snapshot().len(), 1);

    release.notify_waiters();
    processor.stop().await.unwrap();

    assert_eq!(transport.acks().len(), 1);
    assert!(transport.nacks().is_empty());
}

/// Verify that stop() returns only after the running handler finished and settled
#[tokio::test]
async fn test_stop_waits_for_running_handler() {
    let transport = ScriptedTransport::new();
    transport.deliver(delivery("1", "slow"));
    let client = transport.client().await;
    let processor = client
        .create_processor(
            queue("orders"),
            options(1).with_drain_timeout(Duration::ZERO),
        )
        .await
        .unwrap();

    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = started.clone();
        let finished = finished.clone();
        move |_message: ReceivedMessage| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }
    };
    processor
        .start(Arc::new(handler), RecordedErrors::new().router())
        .await
        .unwrap();
    started.notified().await;

    processor.stop().await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(transport.acks().len(), 1);
    assert!(processor.in_flight().is_empty());
    assert_eq!(processor.state(), ProcessorState::Stopped);
}

/// Verify that stopping twice, or concurrently, is harmless
#[tokio::test]
async fn test_stop_is_idempotent() {
    let transport = ScriptedTransport::new();
    let client = transport.client().await;
    let processor = client.create_processor(queue("orders"), options(1)).await.unwrap();
    processor
        .start(
            Arc::new(|_message: ReceivedMessage| async move { Ok::<(), HandlerError>(()) }),
            RecordedErrors::new().router(),
        )
        .await
        .unwrap();

    let (first, second) = futures::future::join(processor.stop(), processor.stop()).await;
    first.unwrap();
    second.unwrap();
    processor.stop().await.unwrap();

    assert_eq!(processor.state(), ProcessorState::Stopped);
}

/// Verify that client close drains processors and closes the connection
#[tokio::test]
async fn test_client_close_stops_processors() {
    let transport = ScriptedTransport::new();
    let client = transport.client().await;
    let processor = client.create_processor(queue("orders"), options(1)).await.unwrap();
    processor
        .start(
            Arc::new(|_message: ReceivedMessage| async move { Ok::<(), HandlerError>(()) }),
            RecordedErrors::new().router(),
        )
        .await
        .unwrap();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(processor.state(), ProcessorState::Stopped);
    assert!(transport.is_closed());
}
