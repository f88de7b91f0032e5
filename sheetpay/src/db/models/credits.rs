//! Database models for the credit ledger.

use crate::types::{Amount, OrderId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ledger entry kind stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditEntryKind {
    /// Top-up settled (positive amount, optional bonus)
    Charge,
    /// Spent on a ledger purchase (negative amount)
    Use,
    /// Admin refund of a settled order (either sign)
    Refund,
    /// Compensation for a `use` whose purchase could not be completed
    Reversal,
}

impl CreditEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditEntryKind::Charge => "charge",
            CreditEntryKind::Use => "use",
            CreditEntryKind::Refund => "refund",
            CreditEntryKind::Reversal => "reversal",
        }
    }
}

/// Database request for appending a ledger entry and moving the balance with it
#[derive(Debug, Clone)]
pub struct CreditEntryCreateDBRequest {
    pub user_id: UserId,
    pub kind: CreditEntryKind,
    /// Signed amount applied to the balance
    pub amount: Amount,
    /// Signed bonus applied on top of `amount`
    pub bonus_amount: Amount,
    /// With an order id the entry is unique per `(order_id, kind)`
    pub order_id: Option<OrderId>,
    pub description: Option<String>,
    pub created_by: Option<UserId>,
}

impl CreditEntryCreateDBRequest {
    pub fn charge(user_id: UserId, order_id: OrderId, amount: Amount, bonus_amount: Amount) -> Self {
        Self {
            user_id,
            kind: CreditEntryKind::Charge,
            amount,
            bonus_amount,
            order_id: Some(order_id),
            description: Some(format!("Credit top-up {amount} + bonus {bonus_amount}")),
            created_by: None,
        }
    }

    pub fn spend(user_id: UserId, order_id: OrderId, amount: Amount, description: Option<String>) -> Self {
        Self {
            user_id,
            kind: CreditEntryKind::Use,
            amount: -amount,
            bonus_amount: 0,
            order_id: Some(order_id),
            description,
            created_by: Some(user_id),
        }
    }

    pub fn reversal(user_id: UserId, order_id: OrderId, amount: Amount) -> Self {
        Self {
            user_id,
            kind: CreditEntryKind::Reversal,
            amount,
            bonus_amount: 0,
            order_id: Some(order_id),
            description: Some("Reversal of failed ledger purchase".to_string()),
            created_by: None,
        }
    }

    /// Net effect on the balance, or `None` when it does not fit in an amount.
    pub fn delta(&self) -> Option<Amount> {
        self.amount.checked_add(self.bonus_amount)
    }
}

/// A persisted ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct CreditLedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub kind: CreditEntryKind,
    pub amount: Amount,
    pub bonus_amount: Amount,
    pub balance_after: Amount,
    pub order_id: Option<OrderId>,
    pub description: Option<String>,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

impl CreditLedgerEntry {
    /// Net effect on the balance. Stored entries were bounded when applied.
    pub fn delta(&self) -> Amount {
        self.amount.saturating_add(self.bonus_amount)
    }
}

/// Result of an atomic balance movement
#[derive(Debug, Clone, PartialEq)]
pub enum CreditApplyOutcome {
    /// Balance moved and the entry was appended
    Applied(CreditLedgerEntry),
    /// An entry for the same `(order_id, kind)` already exists; nothing changed
    Duplicate(CreditLedgerEntry),
    /// The movement would take the balance below zero; nothing changed
    Insufficient { current_balance: Amount },
}
