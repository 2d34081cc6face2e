use crate::database::error::{DatabaseError, DatabaseResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "processing" => Ok(OrderStatus::Processing),
            "shipped" => Ok(OrderStatus::Shipped),
            "delivered" | "completed" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(DatabaseError::decode(format!("unknown order status '{}'", other))),
        }
    }
}

/// The part of an order owed to a single seller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub seller_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub total_amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub lines: Vec<OrderLine>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub seller_id: Uuid,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub buyer_id: Uuid,
    pub currency: String,
    pub lines: Vec<NewOrderLine>,
}

impl NewOrder {
    pub fn total_amount(&self) -> i64 {
        self.lines.iter().map(|l| l.amount).sum()
    }
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn create_order(&self, new: NewOrder) -> DatabaseResult<Order>;

    async fn find_order(&self, id: Uuid) -> DatabaseResult<Option<Order>>;

    /// Moves a pending order to paid. Returns `None` if it was not pending,
    /// so only one caller ever sees the transition.
    async fn mark_order_paid(&self, id: Uuid) -> DatabaseResult<Option<Order>>;
}

#[derive(Debug, FromRow)]
struct OrderRow {
    id: Uuid,
    buyer_id: Uuid,
    total_amount: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, lines: Vec<OrderLine>) -> DatabaseResult<Order> {
        Ok(Order {
            id: self.id,
            buyer_id: self.buyer_id,
            total_amount: self.total_amount,
            currency: self.currency,
            status: OrderStatus::from_str(&self.status)?,
            lines,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_lines(&self, order_id: Uuid) -> DatabaseResult<Vec<OrderLine>> {
        sqlx::query_as::<_, OrderLine>(
            "SELECT id, order_id, seller_id, amount FROM order_lines
             WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn create_order(&self, new: NewOrder) -> DatabaseResult<Order> {
        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;

        let row = sqlx::query_as::<_, OrderRow>(
            "INSERT INTO orders (id, buyer_id, total_amount, currency, status)
             VALUES ($1, $2, $3, $4, 'pending')
             RETURNING id, buyer_id, total_amount, currency, status, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.buyer_id)
        .bind(new.total_amount())
        .bind(&new.currency)
        .fetch_one(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let mut lines = Vec::with_capacity(new.lines.len());
        for line in &new.lines {
            let inserted = sqlx::query_as::<_, OrderLine>(
                "INSERT INTO order_lines (id, order_id, seller_id, amount)
                 VALUES ($1, $2, $3, $4)
                 RETURNING id, order_id, seller_id, amount",
            )
            .bind(Uuid::new_v4())
            .bind(row.id)
            .bind(line.seller_id)
            .bind(line.amount)
            .fetch_one(&mut *tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            lines.push(inserted);
        }

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        row.into_order(lines)
    }

    async fn find_order(&self, id: Uuid) -> DatabaseResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "SELECT id, buyer_id, total_amount, currency, status, created_at, updated_at
             FROM orders WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => {
                let lines = self.load_lines(row.id).await?;
                row.into_order(lines).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn mark_order_paid(&self, id: Uuid) -> DatabaseResult<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(
            "UPDATE orders SET status = 'paid', updated_at = NOW()
             WHERE id = $1 AND status = 'pending'
             RETURNING id, buyer_id, total_amount, currency, status, created_at, updated_at",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => {
                let lines = self.load_lines(row.id).await?;
                row.into_order(lines).map(Some)
            }
            None => Ok(None),
        }
    }
}
