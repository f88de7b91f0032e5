//! Manual bank transfer: the buyer deposits into a static account and an operator confirms.
//!
//! No network calls. Confirmation only happens through the admin confirm endpoint, so
//! `approve` and webhooks are not supported.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use crate::{
    config::ManualTransferConfig,
    db::models::orders::{Order, VirtualAccountInfo},
    payment_providers::{
        Approval, ApprovalRequest, IntentAction, IntentRequest, PaymentError, PaymentIntent, PaymentProvider, ProviderKind,
        Result, WebhookEvent,
    },
};

pub struct ManualTransferProvider {
    config: ManualTransferConfig,
}

impl From<ManualTransferConfig> for ManualTransferProvider {
    fn from(config: ManualTransferConfig) -> Self {
        Self { config }
    }
}

impl ManualTransferProvider {
    fn account_for(&self, request: &IntentRequest) -> VirtualAccountInfo {
        let expires_at = self
            .config
            .deposit_window
            .and_then(|window| ChronoDuration::from_std(window).ok())
            .map(|window| Utc::now() + window);
        VirtualAccountInfo {
            bank_name: self.config.bank_name.clone(),
            account_number: self.config.account_number.clone(),
            account_holder: self.config.account_holder.clone(),
            expected_depositor: request.depositor_name.clone(),
            amount: Some(request.amount),
            expires_at,
            issued_at: None,
        }
    }
}

#[async_trait]
impl PaymentProvider for ManualTransferProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ManualTransfer
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent> {
        let depositor = request.depositor_name.as_deref().map(str::trim).unwrap_or_default();
        if depositor.is_empty() {
            return Err(PaymentError::InvalidData(
                "Depositor name is required for bank transfer".to_string(),
            ));
        }

        let account = self.account_for(request);
        Ok(PaymentIntent {
            raw_request: json!({
                "depositor_name": depositor,
                "amount": request.amount,
            }),
            raw_response: Some(json!(account)),
            action: IntentAction::Deposit { account },
            provider_ref: None,
        })
    }

    async fn approve(&self, _request: &ApprovalRequest<'_>) -> Result<Approval> {
        Err(PaymentError::InvalidData(
            "Bank transfers are confirmed by an operator".to_string(),
        ))
    }

    async fn cancel(&self, order: &Order, reason: &str) -> Result<()> {
        // Nothing to cancel remotely; any refund of a deposit is paid out by hand.
        tracing::info!("Manual transfer order {} cancelled: {}", order.order_number, reason);
        Ok(())
    }

    async fn validate_webhook(&self, _headers: &HeaderMap, _body: &str) -> Result<Option<WebhookEvent>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::orders::PaymentMethod;
    use crate::payment_providers::Buyer;
    use std::time::Duration;
    use uuid::Uuid;

    fn request(depositor_name: Option<&str>) -> IntentRequest {
        IntentRequest {
            user_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            order_number: "ORD20250101120000-1234".to_string(),
            amount: 25_000,
            method: PaymentMethod::ManualBankTransfer,
            return_url: "https://shop.example.com/return".to_string(),
            buyer: Buyer::default(),
            goods_name: "Credits".to_string(),
            depositor_name: depositor_name.map(str::to_string),
        }
    }

    fn provider(deposit_window: Option<Duration>) -> ManualTransferProvider {
        ManualTransferProvider::from(ManualTransferConfig {
            enabled: true,
            bank_name: "Shinhan".to_string(),
            account_number: "110-000-000000".to_string(),
            account_holder: "Sheet Shop".to_string(),
            deposit_window,
        })
    }

    #[tokio::test]
    async fn test_returns_static_account_with_expiry() {
        let before = Utc::now();
        let intent = provider(Some(Duration::from_secs(3600)))
            .create_intent(&request(Some("Hong Gildong")))
            .await
            .unwrap();

        let IntentAction::Deposit { account } = intent.action else {
            panic!("expected deposit instructions");
        };
        assert_eq!(account.account_number, "110-000-000000");
        assert_eq!(account.expected_depositor.as_deref(), Some("Hong Gildong"));
        assert_eq!(account.amount, Some(25_000));
        let expires_at = account.expires_at.unwrap();
        assert!(expires_at >= before + ChronoDuration::seconds(3600));
    }

    #[tokio::test]
    async fn test_no_window_means_no_deadline() {
        let intent = provider(None).create_intent(&request(Some("Kim"))).await.unwrap();
        let IntentAction::Deposit { account } = intent.action else {
            panic!("expected deposit instructions");
        };
        assert!(account.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_depositor_name_is_required() {
        for name in [None, Some("   ")] {
            let err = provider(None).create_intent(&request(name)).await.unwrap_err();
            assert!(matches!(err, PaymentError::InvalidData(_)));
        }
    }
}
