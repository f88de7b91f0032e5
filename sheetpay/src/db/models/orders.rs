//! Database models for orders and order line items.

use crate::types::{Amount, OrderId, ProductId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Metadata key holding the purchase kind.
pub const METADATA_TYPE: &str = "type";
/// Metadata key holding the top-up bonus.
pub const METADATA_BONUS_AMOUNT: &str = "bonusAmount";

/// Order lifecycle status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Failed,
    Cancelled,
    Completed,
}

/// Payment status stored as TEXT in database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    AwaitingDeposit,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::AwaitingDeposit => "awaiting_deposit",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// How the buyer pays for an order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    #[serde(alias = "redirect_wallet")]
    WalletRedirect,
    ManualBankTransfer,
    VirtualAccount,
    /// Internal credit balance
    Ledger,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::WalletRedirect => "wallet_redirect",
            PaymentMethod::ManualBankTransfer => "manual_bank_transfer",
            PaymentMethod::VirtualAccount => "virtual_account",
            PaymentMethod::Ledger => "ledger",
        }
    }

    /// Methods where the buyer pays by depositing into a bank account, so the
    /// order waits in `awaiting_deposit` rather than `pending`.
    pub fn awaits_deposit(&self) -> bool {
        matches!(self, PaymentMethod::ManualBankTransfer | PaymentMethod::VirtualAccount)
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an order buys. Drives the settlement side effect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    /// Credit top-up: settles into a ledger `charge`.
    CashCharge,
    /// Product purchase: settles into one entitlement per item.
    SheetPurchase,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseKind::CashCharge => "cash_charge",
            PurchaseKind::SheetPurchase => "sheet_purchase",
        }
    }
}

/// Bank account descriptor the buyer deposits into.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VirtualAccountInfo {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_depositor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When the details were attached to the order. Set by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
}

impl VirtualAccountInfo {
    /// Copy of these details stamped as attached at `at`.
    pub fn issued(&self, at: DateTime<Utc>) -> Self {
        Self {
            issued_at: Some(at),
            ..self.clone()
        }
    }
}

/// Database request for creating a new order
#[derive(Debug, Clone)]
pub struct OrderCreateDBRequest {
    pub id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub total_amount: Amount,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub metadata: Map<String, Value>,
    pub transaction_id: Option<String>,
    pub depositor_name: Option<String>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
}

/// Database request for creating an order line item
#[derive(Debug, Clone, PartialEq)]
pub struct OrderItemCreateDBRequest {
    pub product_id: ProductId,
    pub title: String,
    pub price: Amount,
}

/// Fields written when an order settles.
#[derive(Debug, Clone)]
pub struct OrderFinalization {
    pub transaction_id: String,
    pub confirmed_at: DateTime<Utc>,
    /// Merged over the existing metadata object.
    pub metadata: Map<String, Value>,
    pub depositor_name: Option<String>,
}

/// A persisted order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub user_id: UserId,
    pub total_amount: Amount,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: PaymentMethod,
    pub metadata: Value,
    pub transaction_id: Option<String>,
    pub depositor_name: Option<String>,
    pub virtual_account_info: Option<VirtualAccountInfo>,
    pub payment_confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Settled orders are never settled again.
    pub fn is_settled(&self) -> bool {
        matches!(self.payment_status, PaymentStatus::Paid | PaymentStatus::Refunded) || self.status == OrderStatus::Completed
    }

    /// Kind recorded in metadata at creation time.
    pub fn recorded_kind(&self) -> Option<PurchaseKind> {
        match self.metadata.get(METADATA_TYPE).and_then(Value::as_str) {
            Some("cash_charge") => Some(PurchaseKind::CashCharge),
            Some("sheet_purchase") => Some(PurchaseKind::SheetPurchase),
            _ => None,
        }
    }

    /// Settlement kind: a top-up only when the metadata says so and there are no items.
    pub fn purchase_kind(&self, item_count: usize) -> Option<PurchaseKind> {
        if item_count > 0 {
            return Some(PurchaseKind::SheetPurchase);
        }
        match self.recorded_kind() {
            Some(PurchaseKind::CashCharge) => Some(PurchaseKind::CashCharge),
            _ => None,
        }
    }

    pub fn bonus_amount(&self) -> Amount {
        self.metadata.get(METADATA_BONUS_AMOUNT).and_then(Value::as_i64).unwrap_or(0)
    }
}

/// A persisted order line item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub title: String,
    pub price: Amount,
}

/// Merge `patch` into `base`, turning a non-object base into an object.
pub fn merge_metadata(base: &Value, patch: &Map<String, Value>) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    Value::Object(merged)
}
