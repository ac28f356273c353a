//! Behaviour every backend must share.
//!
//! Each check takes a fresh [`Stores`] bundle whose stores all read time from
//! the same [`ManualClock`], so leases and TTLs expire by advancing it.

use std::collections::HashSet;
use std::time::Duration;

use chrono::TimeDelta;
use futures_util::future::join_all;
use storage::{
    Clock, CustomerId, IdempotencyStatus, IdempotencyStore, ManualClock, Order, OrderId,
    OrderItem, OrderStatus, OrderStore, OutboxMessage, OutboxStatus, OutboxStore, StoreError,
    Version, sweep_expired,
};
use tokio_util::sync::CancellationToken;

pub struct Stores {
    pub orders: Box<dyn OrderStore>,
    pub outbox: Box<dyn OutboxStore>,
    pub idempotency: Box<dyn IdempotencyStore>,
    pub clock: ManualClock,
}

fn order_for(customer: &str, id: &str) -> Order {
    let mut order = Order::new(
        CustomerId::new(customer),
        "EUR",
        vec![OrderItem::new("SKU-1", 2, 1500)],
    );
    order.id = OrderId::new(id);
    order
}

fn message(aggregate_id: &str, event_type: &str) -> OutboxMessage {
    OutboxMessage::new("order", aggregate_id, event_type, b"{}".to_vec())
}

// ---- orders ----

pub async fn order_create_then_get(stores: &Stores) {
    let mut order = order_for("c-1", "o-1");
    let t0 = stores.clock.now();
    let mut late = OrderItem::new("SKU-late", 1, 100);
    late.id = "item-a".to_string();
    late.created_at = t0 + TimeDelta::seconds(5);
    let mut early_b = OrderItem::new("SKU-b", 1, 200);
    early_b.id = "item-b".to_string();
    early_b.created_at = t0;
    let mut early_a = OrderItem::new("SKU-a", 1, 300);
    early_a.id = "item-a0".to_string();
    early_a.created_at = t0;
    order.items = vec![late, early_b, early_a];
    order.amount_minor = order.items_total();

    stores.orders.create(&order).await.unwrap();

    let loaded = stores.orders.get(&order.id).await.unwrap();
    let item_ids: Vec<_> = loaded.items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(item_ids, vec!["item-a0", "item-b", "item-a"]);
    assert_eq!(loaded.version, Version::first());
    assert_eq!(loaded.amount_minor, 600);
    assert_eq!(loaded.customer_id, order.customer_id);
    assert_eq!(loaded.created_at, order.created_at);
}

pub async fn order_duplicate_create_fails(stores: &Stores) {
    let order = order_for("c-1", "o-dup");
    stores.orders.create(&order).await.unwrap();

    let mut again = order_for("c-2", "o-dup");
    again.currency = "USD".to_string();
    let err = stores.orders.create(&again).await.unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { entity: "order", .. }));
    assert!(err.is_conflict());

    let stored = stores.orders.get(&order.id).await.unwrap();
    assert_eq!(stored.customer_id, CustomerId::new("c-1"));
    assert_eq!(stored.currency, "EUR");
}

pub async fn order_get_missing_is_not_found(stores: &Stores) {
    let err = stores.orders.get(&OrderId::new("missing")).await.unwrap_err();
    assert!(err.is_not_found());
}

pub async fn order_save_bumps_version_by_one(stores: &Stores) {
    let order = order_for("c-1", "o-save");
    stores.orders.create(&order).await.unwrap();

    stores.clock.advance(TimeDelta::minutes(1));
    let mut changed = stores.orders.get(&order.id).await.unwrap();
    changed.status = OrderStatus::Paid;
    changed.items.push(OrderItem::new("SKU-2", 1, 400));
    changed.amount_minor = changed.items_total();

    let version = stores.orders.save(&changed).await.unwrap();
    assert_eq!(version, Version::new(2));

    let stored = stores.orders.get(&order.id).await.unwrap();
    assert_eq!(stored.version, Version::new(2));
    assert_eq!(stored.status, OrderStatus::Paid);
    assert_eq!(stored.items.len(), 2);
    assert_eq!(stored.amount_minor, 3400);
    assert_eq!(stored.updated_at, stores.clock.now());
    assert_eq!(stored.created_at, order.created_at);
    assert_eq!(stored.currency, order.currency);
}

pub async fn order_stale_save_conflicts(stores: &Stores) {
    let order = order_for("c-1", "o-stale");
    stores.orders.create(&order).await.unwrap();

    let mut first = order.clone();
    first.status = OrderStatus::Reserved;
    stores.orders.save(&first).await.unwrap();
    let before = stores.orders.get(&order.id).await.unwrap();

    let mut stale = order.clone();
    stale.status = OrderStatus::Canceled;
    let err = stores.orders.save(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict { expected, .. } if expected == Version::first()
    ));

    let after = stores.orders.get(&order.id).await.unwrap();
    assert_eq!(after, before);
}

pub async fn order_save_keeps_created_at(stores: &Stores) {
    let order = order_for("c-1", "o-created");
    stores.orders.create(&order).await.unwrap();

    let mut rewritten = order.clone();
    rewritten.created_at = order.created_at - TimeDelta::days(10);
    stores.orders.save(&rewritten).await.unwrap();

    let stored = stores.orders.get(&order.id).await.unwrap();
    assert_eq!(stored.created_at, order.created_at);
    let listed = stores
        .orders
        .list_by_customer(&order.customer_id, 0)
        .await
        .unwrap();
    assert_eq!(listed[0].created_at, order.created_at);
}

pub async fn order_item_ids_scoped_per_order(stores: &Stores) {
    let mut a = order_for("c-1", "o-items-a");
    a.items[0].id = "line-1".to_string();
    let mut b = order_for("c-2", "o-items-b");
    b.items[0].id = "line-1".to_string();
    b.items[0].sku = "SKU-B".to_string();

    stores.orders.create(&a).await.unwrap();
    stores.orders.create(&b).await.unwrap();

    b.items[0].qty = 5;
    b.amount_minor = b.items_total();
    stores.orders.save(&b).await.unwrap();

    let a = stores.orders.get(&a.id).await.unwrap();
    let b = stores.orders.get(&b.id).await.unwrap();
    assert_eq!(a.items.len(), 1);
    assert_eq!((a.items[0].id.as_str(), a.items[0].sku.as_str(), a.items[0].qty), ("line-1", "SKU-1", 2));
    assert_eq!((b.items[0].id.as_str(), b.items[0].sku.as_str(), b.items[0].qty), ("line-1", "SKU-B", 5));
}

pub async fn order_reads_never_mix_versions(stores: &Stores) {
    let order = order_for("c-snap", "o-snap");
    stores.orders.create(&order).await.unwrap();

    // Every save changes items and amount together
    let writer = async {
        let mut current = order.clone();
        for i in 0..30i64 {
            current
                .items
                .push(OrderItem::new(format!("SKU-{i}"), 1, 100 + i));
            current.amount_minor = current.items_total();
            current.version = stores.orders.save(&current).await.unwrap();
        }
    };
    let reader = async {
        for _ in 0..60 {
            let seen = stores.orders.get(&order.id).await.unwrap();
            assert_eq!(seen.amount_minor, seen.items_total());
            assert_eq!(seen.items.len() as i64, seen.version.as_i64());

            let listed = stores
                .orders
                .list_by_customer(&order.customer_id, 0)
                .await
                .unwrap();
            for seen in listed {
                assert_eq!(seen.amount_minor, seen.items_total());
                assert_eq!(seen.items.len() as i64, seen.version.as_i64());
            }
            tokio::task::yield_now().await;
        }
    };
    tokio::join!(writer, reader);

    let last = stores.orders.get(&order.id).await.unwrap();
    assert_eq!(last.version, Version::new(31));
    assert_eq!(last.items.len(), 31);
}

pub async fn order_save_missing_is_not_found(stores: &Stores) {
    let order = order_for("c-1", "o-never-created");
    let err = stores.orders.save(&order).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { entity: "order", .. }));
}

pub async fn order_list_newest_first(stores: &Stores) {
    let t0 = stores.clock.now();
    let mut a = order_for("c-list", "o-a");
    a.created_at = t0;
    let mut b = order_for("c-list", "o-b");
    b.created_at = t0 + TimeDelta::seconds(1);
    // Same instant as b: the greater ID sorts first
    let mut c = order_for("c-list", "o-c");
    c.created_at = b.created_at;
    let other = order_for("c-other", "o-x");

    for order in [&a, &b, &c, &other] {
        stores.orders.create(order).await.unwrap();
    }

    let customer = CustomerId::new("c-list");
    let ids = |orders: Vec<Order>| -> Vec<String> {
        orders.into_iter().map(|o| o.id.to_string()).collect()
    };

    let latest = stores.orders.list_by_customer(&customer, 1).await.unwrap();
    assert_eq!(ids(latest), vec!["o-c"]);

    let all = stores.orders.list_by_customer(&customer, 0).await.unwrap();
    assert_eq!(ids(all), vec!["o-c", "o-b", "o-a"]);

    let none = stores
        .orders
        .list_by_customer(&CustomerId::new("c-nobody"), 10)
        .await
        .unwrap();
    assert!(none.is_empty());
}

// ---- outbox ----

pub async fn outbox_enqueue_assigns_id(stores: &Stores) {
    let stored = stores.outbox.enqueue(message("o-1", "OrderCreated")).await.unwrap();
    assert!(!stored.id.is_empty());
    assert_eq!(stored.event_type, "OrderCreated");

    let explicit = stores
        .outbox
        .enqueue(message("o-1", "OrderPaid").with_id("evt-1"))
        .await
        .unwrap();
    assert_eq!(explicit.id, "evt-1");

    let err = stores
        .outbox
        .enqueue(message("o-1", "OrderPaid").with_id("evt-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));
}

pub async fn outbox_claim_hides_until_lease_expires(stores: &Stores) {
    let stored = stores.outbox.enqueue(message("o-1", "OrderCreated")).await.unwrap();

    let claimed = stores.outbox.pull_pending(10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].message.id, stored.id);
    assert_eq!(claimed[0].status, OutboxStatus::Processing);
    assert_eq!(claimed[0].attempt_count, 0);

    // Still leased
    assert!(stores.outbox.pull_pending(10).await.unwrap().is_empty());
    stores.clock.advance(TimeDelta::seconds(30));
    assert!(stores.outbox.pull_pending(10).await.unwrap().is_empty());

    // Lease expired: reclaimed exactly once
    stores.clock.advance(TimeDelta::seconds(31));
    let reclaimed = stores.outbox.pull_pending(10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message.id, stored.id);
    assert_eq!(reclaimed[0].updated_at, stores.clock.now());
    assert!(stores.outbox.pull_pending(10).await.unwrap().is_empty());
}

pub async fn outbox_terminal_records_never_reclaimed(stores: &Stores) {
    let sent = stores.outbox.enqueue(message("o-1", "OrderCreated")).await.unwrap();
    let failed = stores.outbox.enqueue(message("o-2", "OrderCreated")).await.unwrap();
    assert_eq!(stores.outbox.pull_pending(0).await.unwrap().len(), 2);

    stores.outbox.mark_sent(&sent.id).await.unwrap();
    stores.outbox.mark_failed(&failed.id).await.unwrap();

    stores.clock.advance(TimeDelta::hours(1));
    assert!(stores.outbox.pull_pending(0).await.unwrap().is_empty());
}

pub async fn outbox_claims_oldest_first(stores: &Stores) {
    let first = stores
        .outbox
        .enqueue(message("o-1", "A").with_id("b-first"))
        .await
        .unwrap();
    stores.clock.advance(TimeDelta::seconds(1));
    // Same instant: ID breaks the tie
    let second = stores
        .outbox
        .enqueue(message("o-1", "B").with_id("a-second"))
        .await
        .unwrap();
    let third = stores
        .outbox
        .enqueue(message("o-1", "C").with_id("c-third"))
        .await
        .unwrap();

    let batch = stores.outbox.pull_pending(2).await.unwrap();
    let ids: Vec<_> = batch.iter().map(|r| r.message.id.as_str()).collect();
    assert_eq!(ids, vec![first.id.as_str(), second.id.as_str()]);

    let rest = stores.outbox.pull_pending(2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].message.id, third.id);
}

pub async fn outbox_concurrent_claims_are_disjoint(stores: &Stores) {
    for i in 0..20 {
        stores
            .outbox
            .enqueue(message(&format!("o-{i}"), "OrderCreated"))
            .await
            .unwrap();
    }

    let batches = join_all((0..4).map(|_| stores.outbox.pull_pending(5))).await;

    let mut seen = HashSet::new();
    for batch in batches {
        for record in batch.unwrap() {
            assert!(seen.insert(record.message.id), "claimed twice");
        }
    }
    for record in stores.outbox.pull_pending(0).await.unwrap() {
        assert!(seen.insert(record.message.id), "claimed twice");
    }
    assert_eq!(seen.len(), 20);
}

pub async fn outbox_unknown_id_fails(stores: &Stores) {
    let err = stores.outbox.mark_sent("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::PublishFailed { ref message_id } if message_id == "nope"));
    let err = stores.outbox.mark_failed("nope").await.unwrap_err();
    assert!(matches!(err, StoreError::PublishFailed { .. }));
}

pub async fn outbox_sent_message_leaves_backlog(stores: &Stores) {
    let created_at = stores.clock.now();
    let stored = stores.outbox.enqueue(message("o-1", "OrderCreated")).await.unwrap();

    let stats = stores.outbox.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.oldest_pending, Some(created_at));

    let claimed = stores.outbox.pull_pending(1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    // Processing still counts as backlog
    assert_eq!(stores.outbox.stats().await.unwrap().pending, 1);

    stores.clock.advance(TimeDelta::minutes(2));
    let stats = stores.outbox.stats().await.unwrap();
    assert_eq!(stats.oldest_age(stores.clock.now()), Some(TimeDelta::minutes(2)));

    stores.outbox.mark_sent(&stored.id).await.unwrap();
    let stats = stores.outbox.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.oldest_pending, None);
}

// ---- idempotency ----

pub async fn idempotency_requires_key_and_hash(stores: &Stores) {
    let err = stores
        .idempotency
        .create_processing("", "hash", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::KeyRequired));

    let err = stores
        .idempotency
        .create_processing("key", "", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::RequestHashRequired));
}

pub async fn idempotency_default_ttl(stores: &Stores) {
    let record = stores
        .idempotency
        .create_processing("k-ttl", "hash-a", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Processing);
    assert_eq!(record.status_code, 0);
    assert!(record.response_body.is_empty());
    assert_eq!(record.created_at, stores.clock.now());
    assert_eq!(record.ttl_at, record.created_at + TimeDelta::hours(24));

    let custom = stores
        .idempotency
        .create_processing("k-ttl-2", "hash-a", Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(custom.ttl_at, custom.created_at + TimeDelta::minutes(10));
}

pub async fn idempotency_reuse_keeps_original(stores: &Stores) {
    let original = stores
        .idempotency
        .create_processing("k-1", "hash-a", Duration::ZERO)
        .await
        .unwrap();

    stores.clock.advance(TimeDelta::seconds(5));
    let err = stores
        .idempotency
        .create_processing("k-1", "hash-a", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyExists { .. }));

    let err = stores
        .idempotency
        .create_processing("k-1", "hash-b", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::HashMismatch { ref key } if key == "k-1"));

    assert_eq!(stores.idempotency.get("k-1").await.unwrap(), original);
}

pub async fn idempotency_completes_once(stores: &Stores) {
    stores
        .idempotency
        .create_processing("k-done", "hash-a", Duration::ZERO)
        .await
        .unwrap();

    stores.clock.advance(TimeDelta::seconds(1));
    stores
        .idempotency
        .mark_done("k-done", b"{\"id\":\"o-1\"}".to_vec(), 201)
        .await
        .unwrap();

    let record = stores.idempotency.get("k-done").await.unwrap();
    assert!(record.is_complete());
    assert_eq!(record.status, IdempotencyStatus::Done);
    assert_eq!(record.status_code, 201);
    assert_eq!(record.response_body, b"{\"id\":\"o-1\"}".to_vec());
    assert_eq!(record.updated_at, stores.clock.now());

    let err = stores
        .idempotency
        .mark_failed("k-done", Vec::new(), 500)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyCompleted { status: "done", .. }));
    assert_eq!(stores.idempotency.get("k-done").await.unwrap(), record);

    stores
        .idempotency
        .create_processing("k-failed", "hash-a", Duration::ZERO)
        .await
        .unwrap();
    stores
        .idempotency
        .mark_failed("k-failed", b"boom".to_vec(), 502)
        .await
        .unwrap();
    let failed = stores.idempotency.get("k-failed").await.unwrap();
    assert_eq!(failed.status, IdempotencyStatus::Failed);
    assert_eq!(failed.status_code, 502);
}

pub async fn idempotency_unknown_key_is_not_found(stores: &Stores) {
    assert!(stores.idempotency.get("ghost").await.unwrap_err().is_not_found());
    assert!(
        stores
            .idempotency
            .mark_done("ghost", Vec::new(), 200)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

async fn seed_expiring(stores: &Stores, expired: usize) {
    for i in 0..expired {
        stores
            .idempotency
            .create_processing(&format!("old-{i}"), "hash", Duration::from_secs(3600))
            .await
            .unwrap();
    }
    stores
        .idempotency
        .create_processing("active", "hash", Duration::from_secs(48 * 3600))
        .await
        .unwrap();
    stores.clock.advance(TimeDelta::hours(2));
}

pub async fn idempotency_delete_expired_in_batches(stores: &Stores) {
    seed_expiring(stores, 3).await;
    let now = Some(stores.clock.now());

    assert_eq!(stores.idempotency.delete_expired(now, 2).await.unwrap(), 2);
    assert_eq!(stores.idempotency.delete_expired(now, 2).await.unwrap(), 1);
    assert_eq!(stores.idempotency.delete_expired(now, 2).await.unwrap(), 0);
    assert!(stores.idempotency.get("active").await.is_ok());
}

pub async fn idempotency_delete_expired_defaults(stores: &Stores) {
    seed_expiring(stores, 3).await;

    // Defaults to the store's clock and an unbounded pass
    assert_eq!(stores.idempotency.delete_expired(None, 0).await.unwrap(), 3);
    assert!(stores.idempotency.get("active").await.is_ok());
}

pub async fn idempotency_sweep_until_short_batch(stores: &Stores) {
    seed_expiring(stores, 5).await;

    let cancel = CancellationToken::new();
    let deleted = sweep_expired(stores.idempotency.as_ref(), None, 2, &cancel)
        .await
        .unwrap();
    assert_eq!(deleted, 5);
    assert!(stores.idempotency.get("active").await.is_ok());

    cancel.cancel();
    let err = sweep_expired(stores.idempotency.as_ref(), None, 2, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Cancelled { completed: 0 }));
}

pub async fn order_concurrent_saves_one_wins(stores: &Stores) {
    let order = order_for("c-1", "o-race");
    stores.orders.create(&order).await.unwrap();

    let writers: Vec<Order> = [OrderStatus::Paid, OrderStatus::Canceled, OrderStatus::Reserved]
        .into_iter()
        .map(|status| {
            let mut copy = order.clone();
            copy.status = status;
            copy
        })
        .collect();
    let results = join_all(writers.iter().map(|o| stores.orders.save(o))).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(StoreError::is_conflict)
    );
    assert_eq!(
        stores.orders.get(&order.id).await.unwrap().version,
        Version::new(2)
    );
}
