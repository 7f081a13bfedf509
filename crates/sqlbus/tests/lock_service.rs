//! Exclusive-access lock acquire/release semantics and the TTL sweeper.

mod common;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sqlbus::config::LockConfig;
use sqlbus::lock::ExclusiveAccessLock;
use sqlbus::BusError;

#[tokio::test]
async fn acquire_is_exclusive_until_released() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("locks");
    let lock = ExclusiveAccessLock::new(provider.clone(), LockConfig::new(table.clone()))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(lock.acquire("k", &cancel).await.unwrap());
    assert!(!lock.acquire("k", &cancel).await.unwrap());
    assert!(lock.is_held("k").await.unwrap());

    assert!(lock.release("k").await.unwrap());
    assert!(!lock.is_held("k").await.unwrap());
    // Releasing again finds nothing.
    assert!(!lock.release("k").await.unwrap());

    assert!(lock.acquire("k", &cancel).await.unwrap());
    assert!(lock.release("k").await.unwrap());

    lock.shutdown().await;
    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn distinct_keys_do_not_contend() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("locks_multi");
    let lock = ExclusiveAccessLock::new(provider.clone(), LockConfig::new(table.clone()))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(lock.acquire("saga/order/1", &cancel).await.unwrap());
    assert!(lock.acquire("saga/order/2", &cancel).await.unwrap());
    assert!(lock.release("saga/order/1").await.unwrap());
    assert!(lock.release("saga/order/2").await.unwrap());

    lock.shutdown().await;
    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn sweeper_reclaims_expired_locks() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("locks_ttl");
    let config = LockConfig {
        ttl: Duration::from_secs(1),
        ..LockConfig::new(table.clone())
    };
    let lock = ExclusiveAccessLock::new(provider.clone(), config)
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(lock.acquire("abandoned", &cancel).await.unwrap());
    // Holder "dies" without releasing; the TTL lapses.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(lock.sweep_once().await.unwrap(), 1);
    assert!(!lock.is_held("abandoned").await.unwrap());
    assert!(lock.acquire("abandoned", &cancel).await.unwrap());

    lock.shutdown().await;
    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn oversize_keys_are_rejected() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("locks_len");
    let lock = ExclusiveAccessLock::new(provider.clone(), LockConfig::new(table.clone()))
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let err = lock.acquire(&"k".repeat(256), &cancel).await.unwrap_err();
    assert!(matches!(err, BusError::MalformedMessage { .. }));

    lock.shutdown().await;
    common::drop_table(&provider, &table).await;
}

#[tokio::test]
async fn cancelled_acquire_surfaces_cancellation() {
    let Some(provider) = common::test_provider().await else { return };
    let table = common::unique_table("locks_cancel");
    let lock = ExclusiveAccessLock::new(provider.clone(), LockConfig::new(table.clone()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = lock.acquire("k", &cancel).await.unwrap_err();
    assert!(matches!(err, BusError::Cancelled { .. }));

    lock.shutdown().await;
    common::drop_table(&provider, &table).await;
}
