//! Database models for the durable outbox.
//!
//! Work that must eventually happen after a partial failure (settlement side effects,
//! compensation of a ledger purchase) is written here before it is attempted. A task
//! is completed once the work has succeeded; otherwise the outbox worker retries it.

use crate::types::{OrderId, OutboxTaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxTaskKind {
    /// Re-run settlement effects for an order; payload is the confirmation
    Settlement,
    /// Undo a ledger debit whose purchase could not be written
    LedgerRollback,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxTaskStatus {
    Pending,
    Completed,
    /// Gave up after the configured attempts; needs an operator
    Dead,
}

#[derive(Debug, Clone)]
pub struct OutboxTaskCreateDBRequest {
    pub kind: OutboxTaskKind,
    pub order_id: OrderId,
    pub payload: Value,
    /// First time the worker may pick the task up
    pub run_after: DateTime<Utc>,
}

/// How a failed attempt is recorded.
#[derive(Debug, Clone)]
pub enum OutboxTaskFailure {
    Retry { next_attempt_at: DateTime<Utc> },
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct OutboxTask {
    pub id: OutboxTaskId,
    pub kind: OutboxTaskKind,
    pub order_id: OrderId,
    pub payload: Value,
    pub status: OutboxTaskStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
