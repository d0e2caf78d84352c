//! Lifecycle and failure-path behavior that must hold with no broker
//! reachable at all: pool shutdown ordering, publisher state transitions,
//! and the one-notification-per-letter guarantee on the failure side.

use std::collections::HashSet;
use std::time::Duration;

use hutch::{ChannelPool, ConnectionPool, Envelope, Error, Letter, Publisher};
use hutch_test::unreachable_seasoning;
use tokio::time::sleep;

fn letter(id: u64) -> Letter {
    Letter::new(id, &b"payload"[..], Envelope::direct("nowhere"))
}

#[tokio::test]
async fn get_after_shutdown_is_rejected() {
    let pool = ConnectionPool::new(&unreachable_seasoning());
    pool.shutdown().await;

    assert!(pool.is_shut_down());
    assert!(matches!(pool.get().await, Err(Error::PoolShutdown)));
}

#[tokio::test]
async fn channel_get_after_shutdown_is_rejected() {
    let pool = ChannelPool::new(&unreachable_seasoning());
    pool.shutdown().await;

    assert!(matches!(pool.get_channel().await, Err(Error::PoolShutdown)));
    assert!(matches!(
        pool.get_confirm_channel().await,
        Err(Error::PoolShutdown)
    ));
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let pool = ChannelPool::new(&unreachable_seasoning());
    pool.shutdown().await;
    pool.shutdown().await;
    assert!(pool.is_shut_down());
}

#[tokio::test]
async fn get_times_out_against_unreachable_broker() {
    let pool = ConnectionPool::new(&unreachable_seasoning());

    let err = pool.get().await.expect_err("no broker is listening");
    assert!(matches!(
        err,
        Error::PoolExhausted | Error::ConnectionOpenFailed(_)
    ));

    // The failed acquire must not leak its slot.
    assert_eq!(pool.size(), 0);
    pool.shutdown().await;
}

#[tokio::test]
async fn warm_up_fails_fast_without_broker() {
    let pool = ConnectionPool::new(&unreachable_seasoning());

    let err = pool.warm_up().await.expect_err("no broker is listening");
    assert!(matches!(err, Error::ConnectionOpenFailed(_)));
    pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_wakes_a_blocked_acquirer() {
    let seasoning = unreachable_seasoning().acquire_timeout(Duration::from_secs(30));
    let pool = ConnectionPool::new(&seasoning);

    let pool_for_waiter = pool.clone();
    let waiter = tokio::spawn(async move { pool_for_waiter.get().await });

    // Let the waiter settle into its reconnect-backoff loop.
    sleep(Duration::from_millis(100)).await;

    pool.shutdown().await;

    let res = waiter.await.expect("waiter task panicked");
    assert!(matches!(res, Err(Error::PoolShutdown)));
}

#[tokio::test]
async fn publish_failure_still_produces_exactly_one_notification() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    publisher
        .publish(letter(7))
        .await
        .expect("letter is accepted even though the broker is down");

    let notification = notifications.recv_async().await.unwrap();
    assert_eq!(notification.letter_id, 7);
    assert!(!notification.success);
    assert!(notification.error.is_some());
    let failed = notification.failed_letter.expect("letter handed back");
    assert_eq!(failed.id, 7);

    assert!(notifications.try_recv().is_err(), "exactly one notification");
    pool.shutdown().await;
}

#[tokio::test]
async fn confirmation_failure_also_notifies_exactly_once() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    publisher
        .publish_with_confirmation(letter(13).with_retries(1))
        .await
        .unwrap();

    let notification = notifications.recv_async().await.unwrap();
    assert_eq!(notification.letter_id, 13);
    assert!(!notification.success);
    assert!(notifications.try_recv().is_err());
    pool.shutdown().await;
}

#[tokio::test]
async fn concurrent_failed_publishes_each_notify_once() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    let mut handles = Vec::new();
    for id in 0..10u64 {
        let publisher = publisher.clone();
        handles.push(tokio::spawn(async move { publisher.publish(letter(id)).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..10 {
        let notification = notifications.recv_async().await.unwrap();
        assert!(!notification.success);
        assert!(
            seen.insert(notification.letter_id),
            "duplicate notification for letter {}",
            notification.letter_id
        );
    }
    assert_eq!(seen, (0..10).collect::<HashSet<_>>());
    assert!(notifications.try_recv().is_err());
    pool.shutdown().await;
}

#[tokio::test]
async fn stopped_publisher_rejects_submissions() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());

    publisher.start_auto_publish();
    publisher.stop_auto_publish().await;

    assert!(matches!(
        publisher.publish(letter(1)).await,
        Err(Error::PublisherStopped)
    ));
    assert!(matches!(
        publisher.publish_with_confirmation(letter(2)).await,
        Err(Error::PublisherStopped)
    ));
    assert!(matches!(
        publisher.queue_letter(letter(3)).await,
        Err(Error::PublisherStopped)
    ));
    pool.shutdown().await;
}

#[tokio::test]
async fn stopped_publisher_can_be_restarted() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    publisher.start_auto_publish();
    publisher.stop_auto_publish().await;

    publisher.start_auto_publish();
    publisher.queue_letter(letter(21)).await.unwrap();
    publisher.stop_auto_publish().await;

    let notification = notifications.recv_async().await.unwrap();
    assert_eq!(notification.letter_id, 21);
    assert!(notifications.try_recv().is_err());
    pool.shutdown().await;
}

#[tokio::test]
async fn auto_publish_drains_the_queue_on_stop() {
    let seasoning = unreachable_seasoning().workers(2);
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    for id in 0..5u64 {
        publisher.queue_letter(letter(id)).await.unwrap();
    }
    publisher.start_auto_publish();
    publisher.stop_auto_publish().await;

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let notification = notifications.recv_async().await.unwrap();
        assert!(seen.insert(notification.letter_id));
    }
    assert_eq!(seen, (0..5).collect::<HashSet<_>>());
    assert!(notifications.try_recv().is_err());
    pool.shutdown().await;
}

#[tokio::test]
async fn start_auto_publish_is_idempotent() {
    let seasoning = unreachable_seasoning();
    let pool = ChannelPool::new(&seasoning);
    let publisher = Publisher::new(&seasoning, pool.clone());
    let notifications = publisher.notifications();

    publisher.start_auto_publish();
    publisher.start_auto_publish();

    publisher.queue_letter(letter(5)).await.unwrap();
    publisher.stop_auto_publish().await;

    let notification = notifications.recv_async().await.unwrap();
    assert_eq!(notification.letter_id, 5);
    assert!(
        notifications.try_recv().is_err(),
        "a second worker fleet would have double-published"
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn channel_pool_shutdown_cascades_only_when_owned() {
    let seasoning = unreachable_seasoning();

    let shared = ConnectionPool::new(&seasoning);
    let borrowing = ChannelPool::with_connection_pool(&seasoning, shared.clone());
    borrowing.shutdown().await;
    assert!(borrowing.is_shut_down());
    assert!(
        !shared.is_shut_down(),
        "a borrowed connection pool outlives the channel pool"
    );
    shared.shutdown().await;

    let owning = ChannelPool::new(&seasoning);
    owning.shutdown().await;
    assert!(owning.connection_pool().is_shut_down());
}
