use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use storage::{
    CustomerId, IdempotencyStore, InMemoryIdempotencyStore, InMemoryOrderStore,
    InMemoryOutboxStore, Order, OrderItem, OrderStatus, OrderStore, OutboxMessage, OutboxStore,
};

fn make_order(customer: &str) -> Order {
    Order::new(
        CustomerId::new(customer),
        "EUR",
        vec![
            OrderItem::new("SKU-1", 2, 1500),
            OrderItem::new("SKU-2", 1, 250),
        ],
    )
}

fn make_message(aggregate_id: &str) -> OutboxMessage {
    OutboxMessage::new(
        "order",
        aggregate_id,
        "OrderCreated",
        serde_json::to_vec(&serde_json::json!({
            "order_id": aggregate_id,
            "customer_id": "c-1"
        }))
        .unwrap(),
    )
}

fn bench_create_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("orders/create", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryOrderStore::new();
                store.create(&make_order("c-1")).await.unwrap();
            });
        });
    });
}

fn bench_save_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryOrderStore::new();
    let mut order = make_order("c-1");
    rt.block_on(async {
        store.create(&order).await.unwrap();
    });

    c.bench_function("orders/save", |b| {
        b.iter(|| {
            rt.block_on(async {
                order.status = OrderStatus::Paid;
                order.version = store.save(&order).await.unwrap();
            });
        });
    });
}

fn bench_list_by_customer(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryOrderStore::new();
    let customer = CustomerId::new("c-1");

    // 100 orders for the customer among 900 for others
    rt.block_on(async {
        for i in 0..1000 {
            let owner = if i % 10 == 0 { "c-1" } else { "c-other" };
            store.create(&make_order(owner)).await.unwrap();
        }
    });

    c.bench_function("orders/list_by_customer_limit_20", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.list_by_customer(&customer, 20).await.unwrap();
            });
        });
    });
}

fn bench_outbox_enqueue_and_claim(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox/enqueue_claim_send_batch_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryOutboxStore::new();
                for i in 0..100 {
                    store.enqueue(make_message(&format!("o-{i}"))).await.unwrap();
                }
                for record in store.pull_pending(0).await.unwrap() {
                    store.mark_sent(&record.message.id).await.unwrap();
                }
            });
        });
    });
}

fn bench_idempotency_create(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryIdempotencyStore::new();
    let mut n = 0u64;

    c.bench_function("idempotency/create_processing", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(async {
                store
                    .create_processing(&format!("key-{n}"), "hash", Duration::ZERO)
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create_order,
    bench_save_order,
    bench_list_by_customer,
    bench_outbox_enqueue_and_claim,
    bench_idempotency_create,
);
criterion_main!(benches);
