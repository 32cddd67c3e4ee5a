//! Tests for the in-flight delivery set.

use super::*;
use std::time::Duration;

#[test]
fn test_duplicate_insert_rejected() {
    let set = InFlightSet::new();

    let guard = set.try_insert(DeliveryId::new("42"));
    assert!(guard.is_some());
    assert!(set.try_insert(DeliveryId::new("42")).is_none());
    assert!(set.contains(&DeliveryId::new("42")));
    assert_eq!(set.len(), 1);

    drop(guard);
    assert!(set.is_empty());
    assert!(set.try_insert(DeliveryId::new("42")).is_some());
}

#[test]
fn test_distinct_ids_coexist() {
    let set = InFlightSet::new();

    let _a = set.try_insert(DeliveryId::new("1")).unwrap();
    let _b = set.try_insert(DeliveryId::new("2")).unwrap();

    let mut ids: Vec<String> = set.snapshot().iter().map(|d| d.to_string()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2"]);
}

#[test]
fn test_revoke_all_marks_guards() {
    let set = InFlightSet::new();
    let guard = set.try_insert(DeliveryId::new("7")).unwrap();
    assert!(!guard.is_revoked());

    let revoked = set.revoke_all();

    assert_eq!(revoked, vec![DeliveryId::new("7")]);
    assert!(guard.is_revoked());
    // Already revoked entries are not returned twice
    assert!(set.revoke_all().is_empty());
    // Revoked entries still block duplicates until the handler finishes
    assert!(set.try_insert(DeliveryId::new("7")).is_none());
}

#[test]
fn test_settling_entry_is_not_revoked() {
    let set = InFlightSet::new();
    let settling = set.try_insert(DeliveryId::new("1")).unwrap();
    let running = set.try_insert(DeliveryId::new("2")).unwrap();

    assert!(settling.try_settle());
    let revoked = set.revoke_all();

    assert_eq!(revoked, vec![DeliveryId::new("2")]);
    assert!(!settling.is_revoked());
    assert!(running.is_revoked());
    assert!(!running.try_settle());
}

#[test]
fn test_settle_claim_is_taken_once() {
    let set = InFlightSet::new();
    let guard = set.try_insert(DeliveryId::new("9")).unwrap();

    assert!(guard.try_settle());
    assert!(!guard.try_settle());
    assert!(set.revoke_all().is_empty());
}

#[test]
fn test_revoke_and_settle_race_has_one_winner() {
    for _ in 0..200 {
        let set = InFlightSet::new();
        let guard = set.try_insert(DeliveryId::new("x")).unwrap();

        let revoker = {
            let set = set.clone();
            std::thread::spawn(move || set.revoke_all().len())
        };
        let settled = guard.try_settle();
        let revoked = revoker.join().unwrap();

        assert_eq!(usize::from(settled) + revoked, 1);
    }
}

#[tokio::test]
async fn test_wait_empty_returns_immediately_when_empty() {
    let set = InFlightSet::new();

    tokio::time::timeout(Duration::from_millis(100), set.wait_empty())
        .await
        .expect("empty set should not block");
}

#[tokio::test]
async fn test_wait_empty_resolves_after_last_guard_drops() {
    let set = InFlightSet::new();
    let first = set.try_insert(DeliveryId::new("a")).unwrap();
    let second = set.try_insert(DeliveryId::new("b")).unwrap();

    let waiter = {
        let set = set.clone();
        tokio::spawn(async move { set.wait_empty().await })
    };

    drop(first);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!waiter.is_finished());

    drop(second);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should finish")
        .unwrap();
}
