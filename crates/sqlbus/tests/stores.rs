//! Saga, subscription, timeout and data-bus store behavior.

mod common;

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use sqlbus::stores::databus::{MySqlDataBusStore, METADATA_LENGTH};
use sqlbus::stores::saga::{CorrelationProperty, MySqlSagaStore, SagaData, SagaStore};
use sqlbus::stores::subscription::{MySqlSubscriptionStore, SubscriptionStore};
use sqlbus::stores::timeout::MySqlTimeoutStore;
use sqlbus::BusError;

#[tokio::test]
async fn saga_insert_find_update_delete_with_optimistic_concurrency() {
    let Some(provider) = common::test_provider().await else { return };
    let data_table = common::unique_table("saga_data");
    let index_table = common::unique_table("saga_index");
    let store = MySqlSagaStore::new(
        provider.clone(),
        data_table.clone(),
        index_table.clone(),
        true,
    )
    .await
    .unwrap();

    let id = Uuid::new_v4();
    let saga = SagaData {
        id,
        revision: 0,
        data: b"state-v0".to_vec(),
    };
    let correlation = [CorrelationProperty::new("order_id", "o-42")];
    store.insert("OrderSaga", &saga, &correlation).await.unwrap();

    // Duplicate insert conflicts.
    let err = store
        .insert("OrderSaga", &saga, &correlation)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Conflict { .. }));

    // Find by correlation property and by id.
    let found = store
        .find("OrderSaga", "order_id", "o-42")
        .await
        .unwrap()
        .expect("saga should be indexed");
    assert_eq!(found.id, id);
    assert_eq!(found.revision, 0);
    assert_eq!(found.data, b"state-v0");

    let by_id = store
        .find("OrderSaga", "id", &id.to_string())
        .await
        .unwrap()
        .expect("saga should be findable by id");
    assert_eq!(by_id.id, id);

    assert!(store
        .find("OrderSaga", "order_id", "o-missing")
        .await
        .unwrap()
        .is_none());

    // Update bumps the revision; a stale revision conflicts.
    let updated = SagaData {
        id,
        revision: 0,
        data: b"state-v1".to_vec(),
    };
    let new_revision = store
        .update("OrderSaga", &updated, &correlation)
        .await
        .unwrap();
    assert_eq!(new_revision, 1);

    let stale = SagaData {
        id,
        revision: 0,
        data: b"stale".to_vec(),
    };
    let err = store
        .update("OrderSaga", &stale, &correlation)
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Conflict { .. }));

    // Delete needs the current revision too.
    let err = store.delete(&stale).await.unwrap_err();
    assert!(matches!(err, BusError::Conflict { .. }));

    let current = SagaData {
        id,
        revision: 1,
        data: Vec::new(),
    };
    store.delete(&current).await.unwrap();
    assert!(store
        .find("OrderSaga", "order_id", "o-42")
        .await
        .unwrap()
        .is_none());

    common::drop_table(&provider, &data_table).await;
    common::drop_table(&provider, &index_table).await;
}

#[tokio::test]
async fn subscriptions_are_idempotent_per_topic_and_address() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("subs");
    let store = MySqlSubscriptionStore::new(provider.clone(), table.clone(), true)
        .await
        .unwrap();

    store
        .register_subscriber("orders", "queue-a")
        .await
        .unwrap();
    store
        .register_subscriber("orders", "queue-a")
        .await
        .unwrap();
    store
        .register_subscriber("orders", "queue-b")
        .await
        .unwrap();
    store
        .register_subscriber("invoices", "queue-a")
        .await
        .unwrap();

    let mut addresses = store.subscriber_addresses("orders").await.unwrap();
    addresses.sort();
    assert_eq!(addresses, ["queue-a", "queue-b"]);

    store
        .unregister_subscriber("orders", "queue-a")
        .await
        .unwrap();
    assert_eq!(
        store.subscriber_addresses("orders").await.unwrap(),
        ["queue-b"]
    );

    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn due_timeouts_are_consumed_exactly_once() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("timeouts");
    let store = MySqlTimeoutStore::new(provider.clone(), table.clone(), true)
        .await
        .unwrap();

    let mut headers = HashMap::new();
    headers.insert("tag".to_string(), "due".to_string());
    store
        .defer(Utc::now() - ChronoDuration::seconds(5), &headers, b"due-now")
        .await
        .unwrap();
    store
        .defer(
            Utc::now() + ChronoDuration::hours(1),
            &HashMap::new(),
            b"due-later",
        )
        .await
        .unwrap();

    let batch = store.due_timeouts().await.unwrap();
    assert_eq!(batch.due.len(), 1);
    assert_eq!(batch.due[0].body, b"due-now");
    assert_eq!(batch.due[0].headers.get("tag").map(String::as_str), Some("due"));
    batch.complete().await.unwrap();

    // The consumed timeout is gone; the future one still parked.
    let batch = store.due_timeouts().await.unwrap();
    assert!(batch.due.is_empty());
    batch.complete().await.unwrap();

    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn dropped_timeout_batch_rolls_back() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("timeouts_rb");
    let store = MySqlTimeoutStore::new(provider.clone(), table.clone(), true)
        .await
        .unwrap();

    store
        .defer(Utc::now() - ChronoDuration::seconds(1), &HashMap::new(), b"x")
        .await
        .unwrap();

    {
        let batch = store.due_timeouts().await.unwrap();
        assert_eq!(batch.due.len(), 1);
        // Dropped without complete(): the locked rows roll back.
    }

    let batch = store.due_timeouts().await.unwrap();
    assert_eq!(batch.due.len(), 1);
    batch.complete().await.unwrap();

    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn databus_round_trips_large_attachments() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("databus");
    let store = MySqlDataBusStore::new(provider.clone(), table.clone(), true)
        .await
        .unwrap();

    // Larger than one read chunk, so the read loops.
    let payload: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
    let mut meta = HashMap::new();
    meta.insert("content-type".to_string(), "application/octet-stream".to_string());

    store.save("att-1", &meta, &payload).await.unwrap();

    let err = store.save("att-1", &meta, b"again").await.unwrap_err();
    assert!(matches!(err, BusError::Conflict { .. }));

    let read_back = store.read("att-1").await.unwrap();
    assert_eq!(read_back.len(), payload.len());
    assert_eq!(read_back, payload);

    let meta_back = store.meta("att-1").await.unwrap();
    assert_eq!(
        meta_back.get("content-type").map(String::as_str),
        Some("application/octet-stream")
    );
    assert_eq!(
        meta_back.get(METADATA_LENGTH).map(String::as_str),
        Some(payload.len().to_string().as_str())
    );

    let err = store.read("att-missing").await.unwrap_err();
    assert!(matches!(err, BusError::Persistence { .. }));

    common::drop_table(&provider, &table).await;
}
