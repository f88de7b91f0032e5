use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::credits::{CreditEntryKind, CreditLedgerEntry};
use crate::types::{Amount, OrderId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalanceResponse {
    pub user_id: UserId,
    pub balance: Amount,
}

/// One ledger entry as shown to its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditEntryResponse {
    pub id: i64,
    pub kind: CreditEntryKind,
    /// Signed balance movement of this entry, bonus included
    pub delta: Amount,
    pub amount: Amount,
    pub bonus_amount: Amount,
    pub balance_after: Amount,
    pub order_id: Option<OrderId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditLedgerEntry> for CreditEntryResponse {
    fn from(entry: CreditLedgerEntry) -> Self {
        Self {
            id: entry.id,
            kind: entry.kind,
            delta: entry.delta(),
            amount: entry.amount,
            bonus_amount: entry.bonus_amount,
            balance_after: entry.balance_after,
            order_id: entry.order_id,
            description: entry.description,
            created_at: entry.created_at,
        }
    }
}
