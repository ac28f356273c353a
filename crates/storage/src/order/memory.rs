use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{Clock, SystemClock, Version};
use tokio::sync::RwLock;

use super::{CustomerId, Order, OrderId, OrderStore};
use crate::{Result, StoreError};

/// In-memory order store.
///
/// Orders live in a map keyed by ID behind one reader/writer lock, so every
/// mutation is trivially atomic.
#[derive(Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryOrderStore {
    /// Creates a new empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a new empty store stamping writes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            orders: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Returns the number of stored orders.
    pub async fn order_count(&self) -> usize {
        self.orders.read().await.len()
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    #[tracing::instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create(&self, order: &Order) -> Result<()> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(&order.id) {
            return Err(StoreError::AlreadyExists {
                entity: "order",
                id: order.id.to_string(),
            });
        }

        let mut stored = order.clone();
        stored.sort_items();
        orders.insert(stored.id.clone(), stored);
        metrics::counter!("orders_created_total").increment(1);
        Ok(())
    }

    async fn get(&self, id: &OrderId) -> Result<Order> {
        let orders = self.orders.read().await;
        orders.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            entity: "order",
            id: id.to_string(),
        })
    }

    async fn list_by_customer(&self, customer_id: &CustomerId, limit: i64) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|o| &o.customer_id == customer_id)
            .cloned()
            .collect();

        // Newest first, ID descending on ties
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        if limit > 0 {
            matching.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(matching)
    }

    #[tracing::instrument(skip(self, order), fields(order_id = %order.id, expected = %order.version))]
    async fn save(&self, order: &Order) -> Result<Version> {
        let mut orders = self.orders.write().await;
        let stored = orders
            .get_mut(&order.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "order",
                id: order.id.to_string(),
            })?;

        if stored.version != order.version {
            metrics::counter!("orders_version_conflicts_total").increment(1);
            return Err(StoreError::VersionConflict {
                order_id: order.id.clone(),
                expected: order.version,
            });
        }

        let mut next = order.clone();
        next.version = order.version.next();
        next.created_at = stored.created_at;
        next.updated_at = self.clock.now();
        next.sort_items();
        let version = next.version;
        *stored = next;
        Ok(version)
    }
}
