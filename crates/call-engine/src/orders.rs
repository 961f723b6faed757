//! Order service boundary
//!
//! The engine reads an order's phone number and language/voice preference and
//! writes its confirmation status. [`SqliteOrderService`] keeps orders in the
//! engine database; other deployments plug in their own [`OrderService`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::database::{from_millis, parse_column, to_millis, CallEngineDatabase};
use crate::error::{CallEngineError, Result};
use crate::types::{ConfirmationStatus, OrderId};

/// Line item as read out to the customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub price: f64,
}

/// What the engine needs to know about an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Order number the customer recognises
    pub external_order_id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub language: Option<String>,
    pub voice_id: Option<String>,
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
    pub currency: String,
    pub confirmation_status: ConfirmationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        external_order_id: impl Into<String>,
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(id),
            external_order_id: external_order_id.into(),
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            language: None,
            voice_id: None,
            items: Vec::new(),
            total_amount: 0.0,
            currency: "USD".to_string(),
            confirmation_status: ConfirmationStatus::Unconfirmed,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait OrderService: Send + Sync {
    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>>;

    /// Set the status to `to` only if it is currently `from`
    async fn transition_status(
        &self,
        order_id: &OrderId,
        from: ConfirmationStatus,
        to: ConfirmationStatus,
    ) -> Result<bool>;
}

/// Orders stored alongside the call engine tables
#[derive(Clone, Debug)]
pub struct SqliteOrderService {
    db: CallEngineDatabase,
    clock: SharedClock,
}

impl SqliteOrderService {
    pub fn new(db: CallEngineDatabase, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    /// Insert or replace an order's descriptive fields; the status of an existing order is kept
    pub async fn upsert(&self, order: &Order) -> Result<()> {
        let items = serde_json::to_string(&order.items)
            .map_err(|e| CallEngineError::validation(format!("Invalid order items: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO orders
                (id, external_order_id, customer_name, customer_phone, language, voice_id, items,
                 total_amount, currency, confirmation_status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (id) DO UPDATE SET
                external_order_id = excluded.external_order_id,
                customer_name = excluded.customer_name,
                customer_phone = excluded.customer_phone,
                language = excluded.language,
                voice_id = excluded.voice_id,
                items = excluded.items,
                total_amount = excluded.total_amount,
                currency = excluded.currency,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(order.id.as_str())
        .bind(&order.external_order_id)
        .bind(&order.customer_name)
        .bind(&order.customer_phone)
        .bind(order.language.as_deref())
        .bind(order.voice_id.as_deref())
        .bind(items)
        .bind(order.total_amount)
        .bind(&order.currency)
        .bind(order.confirmation_status.as_str())
        .bind(to_millis(order.created_at))
        .bind(to_millis(self.clock.now()))
        .execute(self.db.pool())
        .await?;

        debug!(order_id = %order.id, "Order stored");
        Ok(())
    }
}

#[async_trait]
impl OrderService for SqliteOrderService {
    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT id, external_order_id, customer_name, customer_phone, language, voice_id, items,
                    total_amount, currency, confirmation_status, created_at, updated_at
             FROM orders WHERE id = ?1",
        )
        .bind(order_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let items: String = row.try_get("items")?;
        let status: String = row.try_get("confirmation_status")?;
        Ok(Some(Order {
            id: OrderId(row.try_get("id")?),
            external_order_id: row.try_get("external_order_id")?,
            customer_name: row.try_get("customer_name")?,
            customer_phone: row.try_get("customer_phone")?,
            language: row.try_get("language")?,
            voice_id: row.try_get("voice_id")?,
            items: serde_json::from_str(&items)
                .map_err(|e| CallEngineError::internal(format!("Corrupt items column: {}", e)))?,
            total_amount: row.try_get("total_amount")?,
            currency: row.try_get("currency")?,
            confirmation_status: parse_column(&status, "confirmation_status")?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        }))
    }

    async fn transition_status(
        &self,
        order_id: &OrderId,
        from: ConfirmationStatus,
        to: ConfirmationStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET confirmation_status = ?1, updated_at = ?2
             WHERE id = ?3 AND confirmation_status = ?4",
        )
        .bind(to.as_str())
        .bind(to_millis(self.clock.now()))
        .bind(order_id.as_str())
        .bind(from.as_str())
        .execute(self.db.pool())
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!(order_id = %order_id, from = %from, to = %to, "📦 Order confirmation status changed");
        }
        Ok(changed)
    }
}
