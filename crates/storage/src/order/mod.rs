//! Order aggregate storage with optimistic-concurrency updates.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, SystemClock, Version};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Result, StoreError};

/// Unique identifier for an order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Creates an order ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a new random order ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the order ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the customer owning an order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    /// Creates a customer ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the customer ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CustomerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The status of an order in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Reserved,
    Paid,
    Confirmed,
    Canceled,
    Refunded,
}

impl OrderStatus {
    /// Returns the persisted name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Reserved => "reserved",
            OrderStatus::Paid => "paid",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OrderStatus::Pending),
            "reserved" => Ok(OrderStatus::Reserved),
            "paid" => Ok(OrderStatus::Paid),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "canceled" => Ok(OrderStatus::Canceled),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(StoreError::Decode {
                column: "orders.status",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A line item on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    /// Unique within its order; two orders may reuse the same item ID.
    pub id: String,
    pub sku: String,
    pub qty: i32,
    /// Unit price in minor currency units.
    pub price_minor: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderItem {
    /// Creates a line item with a fresh ID, stamped by the system clock.
    pub fn new(sku: impl Into<String>, qty: i32, price_minor: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sku: sku.into(),
            qty,
            price_minor,
            created_at: SystemClock.now(),
        }
    }

    /// Returns qty × unit price.
    pub fn line_total(&self) -> i64 {
        i64::from(self.qty) * self.price_minor
    }
}

/// The order aggregate root.
///
/// Stores never validate business invariants such as `amount_minor` matching
/// the item totals; that is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: CustomerId,
    pub status: OrderStatus,
    pub currency: String,
    /// Total amount in minor currency units.
    pub amount_minor: i64,
    pub items: Vec<OrderItem>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order at version 1 with a fresh ID.
    pub fn new(customer_id: CustomerId, currency: impl Into<String>, items: Vec<OrderItem>) -> Self {
        let now = SystemClock.now();
        let amount_minor = items.iter().map(OrderItem::line_total).sum();
        Self {
            id: OrderId::generate(),
            customer_id,
            status: OrderStatus::Pending,
            currency: currency.into(),
            amount_minor,
            items,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of qty × unit price over all items.
    pub fn items_total(&self) -> i64 {
        self.items.iter().map(OrderItem::line_total).sum()
    }

    /// Sorts items by creation time, then ID.
    pub(crate) fn sort_items(&mut self) {
        self.items
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }
}

/// Storage for order aggregates.
///
/// All implementations must be thread-safe and make every mutation atomic:
/// the order row and its item rows are written together or not at all.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Stores a new order and its items.
    ///
    /// Fails with `AlreadyExists` if an order with the same ID is stored.
    async fn create(&self, order: &Order) -> Result<()>;

    /// Loads an order with its items ordered by creation time, then item ID.
    ///
    /// Fails with `NotFound` if absent.
    async fn get(&self, id: &OrderId) -> Result<Order>;

    /// Lists a customer's orders, newest first (ties broken by ID descending).
    ///
    /// `limit <= 0` means unbounded.
    async fn list_by_customer(&self, customer_id: &CustomerId, limit: i64) -> Result<Vec<Order>>;

    /// Replaces the stored aggregate if its version still equals `order.version`.
    ///
    /// Returns the new stored version, which is exactly one more than the
    /// supplied one. `created_at` keeps its stored value and `updated_at` is
    /// stamped from the store's clock. Fails with `VersionConflict` on a stale
    /// version and with `NotFound` if the order does not exist.
    async fn save(&self, order: &Order) -> Result<Version>;
}
