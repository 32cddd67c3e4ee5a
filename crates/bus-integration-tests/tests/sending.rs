//! Integration tests for batched sends against the in-memory broker
//!
//! These tests verify:
//! - Batches refuse messages beyond the count limit
//! - A batch that fails mid-submission leaves nothing visible
//! - Sends fan out from topics to subscriptions

mod common;

use bus_runtime::{BusClient, BusConfig, BusError, EntityName, EntityPath, Message};
use common::{queue, ScriptedTransport};

fn config_with_batch_count(max_batch_count: usize) -> BusConfig {
    let mut config = BusConfig::default();
    config.client.batch.max_batch_count = max_batch_count;
    config
}

/// Verify that the fourth message is refused by a batch capped at three
#[tokio::test]
async fn test_batch_refuses_messages_over_count_limit() {
    // Arrange
    let (client, broker) = BusClient::in_memory(&config_with_batch_count(3))
        .await
        .unwrap();
    let orders = queue("orders");
    let sender = client.create_sender(orders.clone()).await.unwrap();
    let messages: Vec<Message> = (0..4)
        .map(|i| Message::from(format!("This a message - {}", i)))
        .collect();

    // Act
    let mut batch = sender.create_batch();
    let accepted: Vec<bool> = messages.iter().map(|m| batch.try_add(m)).collect();
    sender.send(&batch).await.unwrap();

    // Assert
    assert_eq!(accepted, vec![true, true, true, false]);
    let bodies: Vec<String> = broker
        .active_bodies(&orders)
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect();
    assert_eq!(
        bodies,
        vec!["This a message - 0", "This a message - 1", "This a message - 2"]
    );

    client.close().await.unwrap();
}

/// Verify that a connection drop mid-batch commits nothing and a retry commits everything
#[tokio::test]
async fn test_failed_batch_is_all_or_nothing() {
    let (client, broker) = BusClient::in_memory(&BusConfig::default()).await.unwrap();
    let orders = queue("orders");
    let sender = client.create_sender(orders.clone()).await.unwrap();

    let mut batch = sender.create_batch();
    for i in 0..5 {
        assert!(batch.try_add(&Message::from(format!("m{}", i))));
    }

    broker.fail_send_at_index(2);
    let result = sender.send(&batch).await;

    assert!(matches!(result, Err(BusError::Network { .. })));
    assert_eq!(broker.active_count(&orders), 0);

    sender.send(&batch).await.unwrap();
    assert_eq!(broker.active_count(&orders), 5);
    assert_eq!(broker.connect_attempts(), 2);

    client.close().await.unwrap();
}

/// Verify that topic sends reach every subscription
#[tokio::test]
async fn test_topic_send_fans_out_to_subscriptions() {
    let (client, broker) = BusClient::in_memory(&BusConfig::default()).await.unwrap();
    let topic = EntityName::new("events".to_string()).unwrap();
    let audit = EntityName::new("audit".to_string()).unwrap();
    let billing = EntityName::new("billing".to_string()).unwrap();
    broker.create_subscription(topic.clone(), audit.clone());
    broker.create_subscription(topic.clone(), billing.clone());

    let sender = client
        .create_sender(EntityPath::topic(topic.clone()))
        .await
        .unwrap();
    let batches = sender
        .send_messages(vec![Message::from("a"), Message::from("b")])
        .await
        .unwrap();

    assert_eq!(batches, 1);
    assert_eq!(
        broker.active_count(&EntityPath::subscription(topic.clone(), audit)),
        2
    );
    assert_eq!(
        broker.active_count(&EntityPath::subscription(topic, billing)),
        2
    );

    client.close().await.unwrap();
}

/// Verify that a transport send failure reaches the caller unchanged
#[tokio::test]
async fn test_send_failure_surfaces_to_caller() {
    let transport = ScriptedTransport::new();
    transport.fail_sends(BusError::Transport {
        operation: "send".to_string(),
        message: "rejected".to_string(),
    });
    let client = transport.client().await;
    let sender = client.create_sender(queue("orders")).await.unwrap();

    let result = sender.send_message(Message::from("x")).await;

    assert!(matches!(result, Err(BusError::Transport { .. })));
    assert!(transport.sent_batches().is_empty());
}

/// Verify that sends after close are refused
#[tokio::test]
async fn test_send_after_close_is_refused() {
    let transport = ScriptedTransport::new();
    let client = transport.client().await;
    let sender = client.create_sender(queue("orders")).await.unwrap();

    client.close().await.unwrap();
    let result = sender.send_message(Message::from("late")).await;

    assert!(matches!(result, Err(BusError::Closed)));
}
