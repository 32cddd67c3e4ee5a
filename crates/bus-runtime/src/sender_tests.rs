//! Tests for message batches and the sender.

use super::*;
use crate::connection::ConnectionHandle;
use crate::link::LinkSpec;
use crate::message::EntityName;
use crate::providers::InMemoryTransport;
use crate::retry::RetryPolicy;
use crate::transport::{Credentials, Endpoint};
use std::time::Duration;

fn orders() -> EntityPath {
    EntityPath::queue(EntityName::new("orders".to_string()).unwrap())
}

async fn sender_for(transport: &InMemoryTransport, options: BatchOptions) -> Sender {
    sender_with_reconnect(
        transport,
        options,
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5), 2.0),
    )
    .await
}

async fn sender_with_reconnect(
    transport: &InMemoryTransport,
    options: BatchOptions,
    reconnect: RetryPolicy,
) -> Sender {
    let handle = ConnectionHandle::connect(
        Arc::new(transport.clone()),
        Endpoint::new("memory://test").unwrap(),
        Credentials::anonymous(),
        reconnect,
    )
    .await
    .unwrap();
    let link = ManagedLink::open(Arc::new(handle), LinkSpec::sender(orders()))
        .await
        .unwrap();
    Sender::new(orders(), link, options)
}

mod message_batch {
    use super::*;

    #[test]
    fn test_count_limit_refuses_extra_message() {
        let mut batch = MessageBatch::new(1024 * 1024, 3);

        let results: Vec<bool> = (0..4)
            .map(|i| batch.try_add(&Message::from(format!("This a message - {}", i))))
            .collect();

        assert_eq!(results, vec![true, true, true, false]);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_byte_limit_refuses_without_side_effects() {
        let small = Message::from("tiny");
        let limit = small.size_in_bytes() * 2;
        let mut batch = MessageBatch::new(limit, 100);

        assert!(batch.try_add(&small));
        let before = batch.size_in_bytes();

        let large = Message::from("x".repeat(limit));
        assert!(!batch.try_add(&large));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.size_in_bytes(), before);
    }

    #[test]
    fn test_add_all_reports_refused_indices() {
        let mut batch = MessageBatch::new(1024, 2);
        let messages: Vec<Message> = ["a", "b", "c", "d"]
            .iter()
            .map(|body| Message::from(*body))
            .collect();

        let refused = batch.add_all(&messages);

        assert_eq!(refused, vec![2, 3]);
        assert_eq!(batch.messages()[0].body, messages[0].body);
        assert_eq!(batch.messages()[1].body, messages[1].body);
    }
}

mod sending {
    use super::*;

    #[tokio::test]
    async fn test_send_batch_commits_exactly_accepted_messages() {
        // Arrange
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::new(1024 * 1024, 3)).await;
        let mut batch = sender.create_batch();
        for i in 0..4 {
            batch.try_add(&Message::from(format!("This a message - {}", i)));
        }

        // Act
        sender.send(&batch).await.unwrap();

        // Assert
        let bodies: Vec<String> = transport
            .active_bodies(&orders())
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        assert_eq!(
            bodies,
            vec![
                "This a message - 0",
                "This a message - 1",
                "This a message - 2"
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_send_commits_nothing_and_batch_is_reusable() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::default()).await;
        let mut batch = sender.create_batch();
        for i in 0..4 {
            assert!(batch.try_add(&Message::from(format!("m{}", i))));
        }
        transport.fail_send_at_index(2);

        let result = sender.send(&batch).await;

        assert!(matches!(result, Err(BusError::Network { .. })));
        assert_eq!(transport.active_count(&orders()), 0);
        assert_eq!(batch.len(), 4);

        // The link was recovered, so a retry of the same batch goes through
        sender.send(&batch).await.unwrap();
        assert_eq!(transport.active_count(&orders()), 4);
    }

    #[tokio::test]
    async fn test_send_recovers_after_disconnect() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::default()).await;
        transport.disconnect_all();

        sender.send_message(Message::from("after")).await.unwrap();

        assert_eq!(transport.active_count(&orders()), 1);
    }

    #[tokio::test]
    async fn test_send_messages_splits_into_batches() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::new(1024 * 1024, 3)).await;
        let messages: Vec<Message> = (0..7).map(|i| Message::from(format!("m{}", i))).collect();

        let batches = sender.send_messages(messages).await.unwrap();

        assert_eq!(batches, 3);
        assert_eq!(transport.active_count(&orders()), 7);
        assert_eq!(transport.active_bodies(&orders())[6], bytes::Bytes::from("m6"));
    }

    #[tokio::test]
    async fn test_send_messages_rejects_oversized_message_up_front() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::new(64, 10)).await;
        let messages = vec![Message::from("fine"), Message::from("y".repeat(100))];

        let result = sender.send_messages(messages).await;

        assert!(matches!(result, Err(BusError::MessageTooLarge { .. })));
        assert_eq!(transport.active_count(&orders()), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::default()).await;

        sender.send(&sender.create_batch()).await.unwrap();

        assert_eq!(transport.committed_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_sender_rejects_sends() {
        let transport = InMemoryTransport::default();
        let sender = sender_for(&transport, BatchOptions::default()).await;

        sender.close().await.unwrap();
        sender.close().await.unwrap();

        assert!(sender.is_closed());
        assert!(matches!(
            sender.send_message(Message::from("late")).await,
            Err(BusError::Closed)
        ));
        assert_eq!(transport.open_link_count(), 0);
    }

    #[tokio::test]
    async fn test_close_waits_for_send_in_progress() {
        let transport = InMemoryTransport::default();
        let sender = sender_with_reconnect(
            &transport,
            BatchOptions::default(),
            RetryPolicy::new(5, Duration::from_millis(20), Duration::from_millis(20), 1.0)
                .without_jitter(),
        )
        .await;
        transport.set_unreachable(true);

        let sending = {
            let sender = sender.clone();
            tokio::spawn(async move { sender.send_message(Message::from("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        sender.close().await.unwrap();

        assert!(sending.is_finished());
        let result = sending.await.unwrap();
        assert!(matches!(result, Err(BusError::Network { .. })));
    }
}
