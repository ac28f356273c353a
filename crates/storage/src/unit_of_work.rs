//! Writes that span the order and outbox tables in one transaction.

use crate::Result;
use crate::error::DbContext;
use crate::order::Order;
use crate::order::postgres::{PostgresOrderStore, insert_order};
use crate::outbox::OutboxMessage;
use crate::outbox::postgres::PostgresOutboxStore;

/// Creates an order and enqueues the event announcing it atomically.
///
/// Either the order, its items and the outbox message all commit, or none
/// of them do. Returns the stored message with its assigned ID.
#[tracing::instrument(skip_all, fields(order_id = %order.id, event_type = %message.event_type))]
pub async fn create_order_with_event(
    orders: &PostgresOrderStore,
    outbox: &PostgresOutboxStore,
    order: &Order,
    message: OutboxMessage,
) -> Result<OutboxMessage> {
    let mut tx = orders
        .pool()
        .begin()
        .await
        .context("unit_of_work.begin")?;

    insert_order(&mut tx, order).await?;
    let message = outbox.enqueue_in(&mut tx, message).await?;

    tx.commit().await.context("unit_of_work.commit")?;
    metrics::counter!("orders_created_total").increment(1);
    Ok(message)
}
