//! Integration tests for `RedisCapacityStore`.
//!
//! # Requirements
//!
//! Docker must be running. Each test starts its own Redis container through
//! testcontainers.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use boxoffice_core::capacity::{CapacityStore, Release, ReserveOutcome, ResizeOutcome, RestoreOutcome};
use boxoffice_core::{AttemptId, BookingError, Event, EventId, RequestId, TicketCount, UserId};
use boxoffice_redis::RedisCapacityStore;
use boxoffice_runtime::{BookingCoordinator, BookingRequest};
use boxoffice_testing::helpers::next_request_id;
use boxoffice_testing::mocks::{test_clock, test_epoch};
use boxoffice_testing::{InMemoryLedgerStore, InMemoryReconciliationLog};
use std::sync::Arc;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;

async fn setup_redis() -> (ContainerAsync<Redis>, RedisCapacityStore) {
    let container = Redis::default()
        .start()
        .await
        .expect("Failed to start redis container");

    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("Failed to get redis port");

    let redis_url = format!("redis://127.0.0.1:{port}");

    let mut retries = 0;
    let max_retries = 30;
    loop {
        if let Ok(store) = RedisCapacityStore::new(&redis_url).await {
            return (container, store);
        }

        assert!(retries < max_retries, "Failed to connect after {max_retries} retries");
        retries += 1;
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }
}

async fn event(store: &RedisCapacityStore, total: u32) -> Event {
    let event = Event::new(EventId::new(), total, test_epoch() + chrono::Duration::days(30)).unwrap();
    store.register_event(&event).await.unwrap();
    event
}

fn tickets(n: u32) -> TicketCount {
    TicketCount::new(n).unwrap()
}

fn request_id() -> RequestId {
    RequestId::new(next_request_id()).unwrap()
}

/// Reserve under a fresh request id and attempt.
async fn take(store: &RedisCapacityStore, event_id: EventId, n: u32) -> ReserveOutcome {
    store
        .reserve(event_id, tickets(n), &request_id(), AttemptId::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_register_and_get() {
    let (_container, store) = setup_redis().await;
    let registered = event(&store, 25).await;

    let loaded = store.get(registered.id).await.unwrap().unwrap();

    assert_eq!(loaded, registered);
    assert!(store.get(EventId::new()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reserve_is_conditional() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 5).await;

    assert_eq!(take(&store, event.id, 3).await, ReserveOutcome::Reserved { available: 2 });
    assert_eq!(take(&store, event.id, 3).await, ReserveOutcome::Insufficient { available: 2 });
    assert_eq!(take(&store, event.id, 2).await, ReserveOutcome::Reserved { available: 0 });
    assert_eq!(take(&store, EventId::new(), 1).await, ReserveOutcome::NotFound);
}

#[tokio::test]
async fn test_reserve_is_idempotent_per_attempt() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 10).await;
    let key = request_id();
    let attempt = AttemptId::new();

    for _ in 0..3 {
        assert_eq!(
            store.reserve(event.id, tickets(3), &key, attempt).await.unwrap(),
            ReserveOutcome::Reserved { available: 7 }
        );
    }
    assert_eq!(
        store.reserve(event.id, tickets(3), &key, AttemptId::new()).await.unwrap(),
        ReserveOutcome::HeldByOtherAttempt
    );
    assert_eq!(store.get(event.id).await.unwrap().unwrap().available, 7);
}

#[tokio::test]
async fn test_restore_is_clamped_to_total() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 10).await;
    take(&store, event.id, 4).await;

    let booking = |request_id| Release::Booking { request_id };
    assert_eq!(
        store.restore(event.id, tickets(3), &booking(request_id())).await.unwrap(),
        RestoreOutcome::Restored { available: 9 }
    );
    assert_eq!(
        store.restore(event.id, tickets(5), &booking(request_id())).await.unwrap(),
        RestoreOutcome::Restored { available: 10 }
    );
    assert_eq!(
        store.restore(EventId::new(), tickets(1), &booking(request_id())).await.unwrap(),
        RestoreOutcome::NotFound
    );
}

#[tokio::test]
async fn test_restore_gives_a_hold_back_once() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 10).await;
    take(&store, event.id, 5).await;
    let key = request_id();
    let attempt = AttemptId::new();
    store.reserve(event.id, tickets(3), &key, attempt).await.unwrap();

    let stranger = Release::Attempt {
        request_id: key.clone(),
        attempt: AttemptId::new(),
    };
    assert_eq!(
        store.restore(event.id, tickets(3), &stranger).await.unwrap(),
        RestoreOutcome::AlreadyRestored { available: 2 }
    );

    let compensation = Release::Attempt {
        request_id: key.clone(),
        attempt,
    };
    assert_eq!(
        store.restore(event.id, tickets(3), &compensation).await.unwrap(),
        RestoreOutcome::Restored { available: 5 }
    );
    assert_eq!(
        store.restore(event.id, tickets(3), &compensation).await.unwrap(),
        RestoreOutcome::AlreadyRestored { available: 5 }
    );
    assert_eq!(
        store
            .restore(event.id, tickets(3), &Release::Booking { request_id: key })
            .await
            .unwrap(),
        RestoreOutcome::AlreadyRestored { available: 5 }
    );
}

#[tokio::test]
async fn test_resize_keeps_sold_tickets_sold() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 10).await;
    take(&store, event.id, 6).await;

    let ResizeOutcome::Resized(grown) = store.resize(event.id, 20).await.unwrap() else {
        panic!("expected resize to succeed");
    };
    assert_eq!((grown.total, grown.available), (20, 14));
    assert_eq!(grown.date, event.date);

    assert_eq!(
        store.resize(event.id, 5).await.unwrap(),
        ResizeOutcome::BelowSold { sold: 6 }
    );
    assert_eq!(store.resize(EventId::new(), 5).await.unwrap(), ResizeOutcome::NotFound);

    let loaded = store.get(event.id).await.unwrap().unwrap();
    assert_eq!((loaded.total, loaded.available), (20, 14));
}

#[tokio::test]
async fn test_concurrent_reservations_never_oversell() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 30).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .reserve(event.id, tickets(1), &request_id(), AttemptId::new())
                .await
        }));
    }

    let mut reserved = 0;
    for handle in handles {
        if let ReserveOutcome::Reserved { .. } = handle.await.unwrap().unwrap() {
            reserved += 1;
        }
    }

    assert_eq!(reserved, 30);
    assert_eq!(store.get(event.id).await.unwrap().unwrap().available, 0);
}

#[tokio::test]
async fn test_coordinator_against_redis() {
    let (_container, store) = setup_redis().await;
    let event = event(&store, 5).await;
    let ledger = InMemoryLedgerStore::new();
    let coordinator = BookingCoordinator::new(
        Arc::new(store.clone()),
        Arc::new(ledger.clone()),
        Arc::new(InMemoryReconciliationLog::new()),
        Arc::new(test_clock()),
    );
    let request = |tickets| BookingRequest {
        event_id: event.id,
        user_id: UserId::new(),
        tickets,
        request_id: next_request_id(),
    };

    let receipt = coordinator.book_tickets(request(3)).await.unwrap();
    assert_eq!(receipt.event.available, 2);

    let error = coordinator.book_tickets(request(3)).await.unwrap_err();
    assert_eq!(
        error,
        BookingError::InsufficientCapacity {
            event_id: event.id,
            requested: 3,
            available: 2,
        }
    );

    ledger.faults().create_booking.fail_next(boxoffice_testing::faults::unavailable("disk full"));
    assert!(coordinator.book_tickets(request(2)).await.is_err());
    assert_eq!(store.get(event.id).await.unwrap().unwrap().available, 2);
}
