//! Write-path stores for the order backend.
//!
//! Three stores, each behind an async trait with an in-memory and a
//! PostgreSQL implementation:
//! - [`OrderStore`]: order aggregates with compare-and-swap saves
//! - [`OutboxStore`]: domain events awaiting publication, claimed by lease
//! - [`IdempotencyStore`]: idempotency keys and the responses they replay

pub mod config;
pub mod error;
pub mod idempotency;
pub mod order;
pub mod outbox;
pub mod unit_of_work;

pub use common::{Clock, IdGenerator, ManualClock, SystemClock, UuidGenerator, Version};
pub use config::{IdempotencyOptions, OutboxOptions, StorageConfig};
pub use error::{Result, StoreError};
pub use idempotency::memory::InMemoryIdempotencyStore;
pub use idempotency::postgres::PostgresIdempotencyStore;
pub use idempotency::sweep::sweep_expired;
pub use idempotency::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore};
pub use order::memory::InMemoryOrderStore;
pub use order::postgres::PostgresOrderStore;
pub use order::{CustomerId, Order, OrderId, OrderItem, OrderStatus, OrderStore};
pub use outbox::memory::InMemoryOutboxStore;
pub use outbox::postgres::PostgresOutboxStore;
pub use outbox::{OutboxMessage, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore};
pub use unit_of_work::create_order_with_event;
