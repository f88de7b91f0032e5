//! Database models for purchase entitlements (access to a bought sheet).

use crate::types::{OrderId, ProductId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct EntitlementCreateDBRequest {
    pub user_id: UserId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub price_paid: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Entitlement {
    pub id: i64,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub price_paid: i64,
    pub granted_at: DateTime<Utc>,
}
