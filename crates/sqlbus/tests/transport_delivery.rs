//! Delivery-order and transactionality scenarios against a live MySQL.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use sqlbus::config::TransportConfig;
use sqlbus::headers::{HEADER_DEFERRED_UNTIL, HEADER_MESSAGE_ID, HEADER_PRIORITY};
use sqlbus::scope::TransactionScope;
use sqlbus::table::TableName;
use sqlbus::transport::MySqlTransport;

async fn transport_on(dsn: &str, queue: &TableName) -> MySqlTransport {
    let config = TransportConfig {
        input_queue: Some(queue.clone()),
        auto_delete_queue: true,
        ..TransportConfig::new(dsn)
    };
    MySqlTransport::new(config)
        .await
        .expect("transport should start")
}

#[tokio::test]
async fn deferred_messages_deliver_in_ascending_visible_order() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("defer");
    let transport = transport_on(&dsn, &queue).await;

    let m1 = common::message("M1", &[]);
    let minus_one = (Utc::now() - ChronoDuration::minutes(1)).to_rfc3339();
    let m2 = common::message("M2", &[(HEADER_DEFERRED_UNTIL, minus_one.as_str())]);
    let minus_two = (Utc::now() - ChronoDuration::minutes(2)).to_rfc3339();
    let m3 = common::message("M3", &[(HEADER_DEFERRED_UNTIL, minus_two.as_str())]);

    let scope = TransactionScope::new();
    for m in [m1, m2, m3] {
        transport.send(&queue.name, m, &scope).await.unwrap();
    }
    scope.complete().await.unwrap();

    let cancel = CancellationToken::new();
    let mut received = Vec::new();
    for _ in 0..3 {
        let scope = TransactionScope::new();
        let message = transport
            .receive(&scope, &cancel)
            .await
            .unwrap()
            .expect("a message should be deliverable");
        received.push(common::body_text(&message));
        // The deferred-until header never survives into the queue.
        assert!(!message.headers.contains_key(HEADER_DEFERRED_UNTIL));
        scope.complete().await.unwrap();
    }

    assert_eq!(received, ["M3", "M2", "M1"]);
    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn priorities_dominate_insertion_order() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("priority");
    let transport = transport_on(&dsn, &queue).await;

    // Insert priorities 0..20 in a scrambled order (stride 7 is coprime
    // with 20, so every priority appears exactly once).
    let scope = TransactionScope::new();
    for i in 0..20 {
        let priority = (i * 7) % 20;
        let message = common::message(
            &format!("p{priority}"),
            &[(HEADER_PRIORITY, &priority.to_string())],
        );
        transport.send(&queue.name, message, &scope).await.unwrap();
    }
    scope.complete().await.unwrap();

    let cancel = CancellationToken::new();
    let mut received = Vec::new();
    for _ in 0..20 {
        let scope = TransactionScope::new();
        let message = transport.receive(&scope, &cancel).await.unwrap().unwrap();
        received.push(common::body_text(&message));
        scope.complete().await.unwrap();
    }

    let expected: Vec<String> = (0..20).rev().map(|p| format!("p{p}")).collect();
    assert_eq!(received, expected);
    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn uncommitted_sends_are_invisible_until_the_scope_completes() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("isolation");
    let transport = transport_on(&dsn, &queue).await;
    let cancel = CancellationToken::new();

    let sender_scope = TransactionScope::new();
    transport
        .send(
            &queue.name,
            common::message("M", &[(HEADER_MESSAGE_ID, "msg-iso-1")]),
            &sender_scope,
        )
        .await
        .unwrap();

    // Nothing flushed yet: a concurrent receiver sees an empty queue.
    let receive_scope = TransactionScope::new();
    assert!(transport
        .receive(&receive_scope, &cancel)
        .await
        .unwrap()
        .is_none());
    receive_scope.complete().await.unwrap();

    sender_scope.complete().await.unwrap();

    let receive_scope = TransactionScope::new();
    let message = transport
        .receive(&receive_scope, &cancel)
        .await
        .unwrap()
        .expect("message should be visible after the sender committed");
    assert_eq!(message.message_id(), Some("msg-iso-1"));
    receive_scope.complete().await.unwrap();

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn aborted_sender_scope_flushes_nothing() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("abort");
    let transport = transport_on(&dsn, &queue).await;
    let cancel = CancellationToken::new();

    let scope = TransactionScope::new();
    transport
        .send(&queue.name, common::message("doomed", &[]), &scope)
        .await
        .unwrap();
    scope.abort().await;

    let receive_scope = TransactionScope::new();
    assert!(transport
        .receive(&receive_scope, &cancel)
        .await
        .unwrap()
        .is_none());
    receive_scope.complete().await.unwrap();

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn acked_messages_are_never_redelivered() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("ack");
    let transport = transport_on(&dsn, &queue).await;
    let cancel = CancellationToken::new();

    let scope = TransactionScope::new();
    transport
        .send(&queue.name, common::message("once", &[]), &scope)
        .await
        .unwrap();
    scope.complete().await.unwrap();

    let scope = TransactionScope::new();
    assert!(transport.receive(&scope, &cancel).await.unwrap().is_some());
    scope.complete().await.unwrap();

    let scope = TransactionScope::new();
    assert!(transport.receive(&scope, &cancel).await.unwrap().is_none());
    scope.complete().await.unwrap();

    transport.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_receive_surfaces_cancellation() {
    let Some(dsn) = common::test_dsn() else { return };
    let queue = common::unique_table("cancel");
    let transport = transport_on(&dsn, &queue).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let scope = TransactionScope::new();
    let err = transport.receive(&scope, &cancel).await.unwrap_err();
    assert!(matches!(err, sqlbus::BusError::Cancelled { .. }));

    transport.shutdown().await.unwrap();
}
