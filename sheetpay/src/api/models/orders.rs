use serde::{Deserialize, Serialize};

use crate::db::models::orders::{Order, OrderItem, VirtualAccountInfo};
use crate::types::OrderId;

/// An order with its line items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

/// Query for the push-based wait on one order.
#[derive(Debug, Default, Deserialize)]
pub struct AwaitDetailQuery {
    /// Defaults to, and is capped at, `settlement.awaiter.push_timeout`
    pub timeout_ms: Option<u64>,
}

/// Query for the bounded poll over the caller's newest order.
#[derive(Debug, Default, Deserialize)]
pub struct PollDetailQuery {
    pub freshness_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub interval_ms: Option<u64>,
}

/// Deposit details of an order, once the provider has issued them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountDetailResponse {
    pub order_id: OrderId,
    pub order_number: String,
    pub account: VirtualAccountInfo,
}

impl AccountDetailResponse {
    /// `None` for orders that carry no details.
    pub fn from_order(order: Order) -> Option<Self> {
        let account = order.virtual_account_info?;
        Some(Self {
            order_id: order.id,
            order_number: order.order_number,
            account,
        })
    }
}
