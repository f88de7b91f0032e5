use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    checkout::orchestrator::{PurchaseItem, PurchaseRequest},
    db::models::orders::PaymentMethod,
    payment_providers::Buyer,
    types::{Amount, UserId},
};

/// Body of `POST /purchases`. An empty `items` list buys credits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseCreate {
    #[serde(default)]
    pub items: Vec<PurchaseItem>,
    pub amount: Amount,
    pub method: Option<PaymentMethod>,
    /// Bonus shown to the buyer; checked against the configured tiers
    #[serde(default)]
    pub bonus_amount: Option<Amount>,
    pub return_url: Option<String>,
    #[serde(default)]
    pub buyer: Buyer,
    pub depositor_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PurchaseCreate {
    pub fn into_request(self, user_id: UserId) -> PurchaseRequest {
        PurchaseRequest {
            user_id,
            items: self.items,
            amount: self.amount,
            method: self.method,
            quoted_bonus: self.bonus_amount,
            buyer: self.buyer,
            depositor_name: self.depositor_name,
            description: self.description,
            metadata: self.metadata,
            return_url: self.return_url,
        }
    }
}
