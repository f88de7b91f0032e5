use serde::{Deserialize, Serialize};

use crate::{
    checkout::reconciler::{ReturnOutcome, SettlementOutcome},
    db::models::orders::Order,
};

/// Result of a provider return or an operator confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResponse {
    /// `settled`, `already_settled` or `awaiting_deposit`
    pub outcome: String,
    pub order: Order,
}

impl From<SettlementOutcome> for SettlementResponse {
    fn from(outcome: SettlementOutcome) -> Self {
        match outcome {
            SettlementOutcome::Settled(order) => Self {
                outcome: "settled".to_string(),
                order,
            },
            SettlementOutcome::AlreadySettled(order) => Self {
                outcome: "already_settled".to_string(),
                order,
            },
        }
    }
}

impl From<ReturnOutcome> for SettlementResponse {
    fn from(outcome: ReturnOutcome) -> Self {
        match outcome {
            ReturnOutcome::Settled(settlement) => settlement.into(),
            ReturnOutcome::AwaitingDeposit(order) => Self {
                outcome: "awaiting_deposit".to_string(),
                order,
            },
        }
    }
}

/// Body of `POST /admin/orders/{id}/confirm`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmOrderRequest {
    /// Bank reference of the deposit; one is generated when absent
    pub transaction_id: Option<String>,
    pub depositor_name: Option<String>,
    pub note: Option<String>,
}

/// Acknowledgement returned to webhook senders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
}
