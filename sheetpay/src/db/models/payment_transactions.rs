//! Database models for the provider interaction audit log.

use crate::db::models::orders::{PaymentMethod, PaymentStatus};
use crate::types::{Amount, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One row per provider interaction attempt. Never read by business logic.
#[derive(Debug, Clone)]
pub struct PaymentTransactionCreateDBRequest {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub method: PaymentMethod,
    pub provider: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub provider_transaction_id: Option<String>,
    pub raw_request: Option<Value>,
    pub raw_response: Option<Value>,
    pub error_message: Option<String>,
}

/// Terminal status written onto the latest log row of an order.
#[derive(Debug, Clone)]
pub struct PaymentTransactionStatusUpdate {
    pub status: PaymentStatus,
    pub provider_transaction_id: Option<String>,
    pub raw_response: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct PaymentTransactionLog {
    pub id: Uuid,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub method: PaymentMethod,
    pub provider: String,
    pub amount: Amount,
    pub status: PaymentStatus,
    pub provider_transaction_id: Option<String>,
    pub raw_request: Option<Value>,
    pub raw_response: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
