//! Dummy payment provider implementation
//!
//! This provider approves every payment without talking to anyone: the checkout "form" points
//! straight back at the return URL with a dummy session id, and approval captures the full
//! order total. Useful for testing and development purposes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::json;

use crate::{
    db::models::orders::Order,
    payment_providers::{
        Approval, ApprovalRequest, Capture, IntentAction, IntentRequest, PaymentError, PaymentIntent, PaymentProvider,
        ProviderKind, RedirectForm, Result, WebhookEvent, confirmation_str,
    },
};

const SESSION_PREFIX: &str = "dummy_session_";

/// Dummy payment provider that approves everything
#[derive(Debug, Default)]
pub struct DummyProvider;

#[async_trait]
impl PaymentProvider for DummyProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Dummy
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent> {
        // Session id carries the order id so approval can check it belongs to the order
        let session_id = format!("{SESSION_PREFIX}{}_{}", request.order_id, uuid::Uuid::new_v4());

        tracing::info!("Dummy provider created session {} for user {}", session_id, request.user_id);

        let mut fields = BTreeMap::new();
        fields.insert("session_id".to_string(), session_id.clone());

        Ok(PaymentIntent {
            action: IntentAction::Redirect {
                form: RedirectForm {
                    action: request.return_url.clone(),
                    method: "GET".to_string(),
                    fields,
                },
            },
            provider_ref: Some(session_id.clone()),
            raw_request: json!({ "session_id": session_id, "amount": request.amount }),
            raw_response: None,
        })
    }

    async fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Approval> {
        let session_id = confirmation_str(request.raw_confirmation, "session_id")
            .ok_or_else(|| PaymentError::InvalidData("Missing session_id".to_string()))?;

        let expected_prefix = format!("{SESSION_PREFIX}{}_", request.order.id);
        if !session_id.starts_with(&expected_prefix) {
            return Err(PaymentError::InvalidData("Invalid dummy session ID format".to_string()));
        }

        Ok(Approval::Captured(Capture {
            approved_amount: request.order.total_amount,
            provider_transaction_id: session_id.to_string(),
            raw_response: json!({ "session_id": session_id, "is_paid": true }),
        }))
    }

    async fn cancel(&self, order: &Order, reason: &str) -> Result<()> {
        tracing::info!("Dummy provider cancelled order {}: {}", order.order_number, reason);
        Ok(())
    }

    async fn validate_webhook(&self, _headers: &HeaderMap, _body: &str) -> Result<Option<WebhookEvent>> {
        // Dummy provider doesn't use webhooks
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::orders::PaymentMethod;
    use crate::payment_providers::Buyer;
    use crate::test_utils::sample_order;
    use serde_json::{Map, Value};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_dummy_full_payment_flow() {
        let provider = DummyProvider;
        let order = sample_order(Uuid::new_v4(), 7_000, PaymentMethod::Card);

        let intent = provider
            .create_intent(&IntentRequest {
                user_id: order.user_id,
                order_id: order.id,
                order_number: order.order_number.clone(),
                amount: order.total_amount,
                method: PaymentMethod::Card,
                return_url: "http://localhost:3001/api/v1/payments/dummy/return?order_id=x".to_string(),
                buyer: Buyer::default(),
                goods_name: "Sheet".to_string(),
                depositor_name: None,
            })
            .await
            .unwrap();

        let IntentAction::Redirect { form } = intent.action else {
            panic!("expected a redirect");
        };
        assert!(form.action.contains("/payments/dummy/return"));

        // Simulate the buyer being sent back with the session id
        let raw: Map<String, Value> = form.fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        let approval = provider
            .approve(&ApprovalRequest {
                order: &order,
                raw_confirmation: &raw,
            })
            .await
            .unwrap();

        let Approval::Captured(capture) = approval else {
            panic!("expected a capture");
        };
        assert_eq!(capture.approved_amount, 7_000);
        assert!(capture.provider_transaction_id.starts_with("dummy_session_"));
    }

    #[tokio::test]
    async fn test_dummy_rejects_session_for_other_order() {
        let order = sample_order(Uuid::new_v4(), 7_000, PaymentMethod::Card);
        let raw: Map<String, Value> = [(
            "session_id".to_string(),
            json!(format!("dummy_session_{}_abc", Uuid::new_v4())),
        )]
        .into_iter()
        .collect();

        let result = DummyProvider
            .approve(&ApprovalRequest {
                order: &order,
                raw_confirmation: &raw,
            })
            .await;
        assert!(matches!(result, Err(PaymentError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_dummy_webhook_not_supported() {
        let result = DummyProvider.validate_webhook(&HeaderMap::new(), "{}").await;
        assert!(matches!(result, Ok(None)));
    }
}
