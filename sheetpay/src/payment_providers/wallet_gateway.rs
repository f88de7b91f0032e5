//! Redirect wallet gateway ("Provider B").
//!
//! The wallet charges in its own currency (`wallet_gateway.currency`, amounts in cents).
//! Intent creation pre-registers the converted amount so the client SDK cannot alter it,
//! and approval re-reads the payment from the gateway API before trusting the return.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    config::WalletGatewayConfig,
    db::models::orders::Order,
    payment_providers::{
        Approval, ApprovalRequest, Capture, IntentAction, IntentRequest, PaymentError, PaymentIntent, PaymentProvider,
        ProviderKind, RedirectForm, Result, WebhookEvent, WebhookEventType, confirmation_str, required_header,
        signing::verify_webhook,
    },
    types::{Amount, OrderId, abbrev_uuid},
};

pub const SIGNATURE_HEADER: &str = "x-wallet-gateway-signature";
pub const TIMESTAMP_HEADER: &str = "x-wallet-gateway-timestamp";

const STATUS_PAID: &str = "PAID";

/// Convert wallet cents into the order currency: `cents / 100 * rate`, rounded half away from zero.
pub fn to_order_amount(cents: i64, exchange_rate: Decimal) -> Option<Amount> {
    (Decimal::from(cents) / Decimal::ONE_HUNDRED * exchange_rate)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Convert an order amount into wallet cents: `amount / rate * 100`, rounded half away from zero.
pub fn to_wallet_cents(amount: Amount, exchange_rate: Decimal) -> Option<i64> {
    if exchange_rate <= Decimal::ZERO {
        return None;
    }
    (Decimal::from(amount) / exchange_rate * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Gateway payment id for an order. Deterministic so a retried intent re-registers the same payment.
fn payment_id_for(order_id: &OrderId) -> String {
    format!("pay-{order_id}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAmount {
    total: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletPayment {
    id: String,
    status: String,
    amount: WalletAmount,
    order_id: String,
    #[serde(default)]
    fail_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WalletWebhookBody {
    #[serde(rename = "type")]
    event_type: String,
    data: WalletWebhookData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletWebhookData {
    payment_id: String,
    order_id: OrderId,
    #[serde(default)]
    amount: Option<WalletAmount>,
    #[serde(default)]
    reason: Option<String>,
}

/// Redirect wallet payment provider
pub struct WalletGatewayProvider {
    config: WalletGatewayConfig,
    client: reqwest::Client,
}

impl WalletGatewayProvider {
    pub fn new(config: WalletGatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.as_str().trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::ProviderApi(format!("HTTP {status}: {body}")));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| PaymentError::ProviderApi(format!("Malformed gateway response: {e}")))
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<(WalletPayment, Value)> {
        let response = self
            .client
            .get(self.endpoint(&format!("payments/{payment_id}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        let raw = Self::check(response).await?;
        let payment: WalletPayment = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::ProviderApi(format!("Unexpected payment payload: {e}")))?;
        Ok((payment, raw))
    }

    fn convert(&self, cents: i64) -> Result<Amount> {
        to_order_amount(cents, self.config.exchange_rate)
            .ok_or_else(|| PaymentError::InvalidData(format!("Amount {cents} cannot be converted")))
    }
}

#[async_trait]
impl PaymentProvider for WalletGatewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::WalletGateway
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent> {
        let total_cents = to_wallet_cents(request.amount, self.config.exchange_rate)
            .ok_or_else(|| PaymentError::InvalidData("Amount cannot be converted to wallet currency".to_string()))?;
        let payment_id = payment_id_for(&request.order_id);

        let prepare = json!({
            "paymentId": payment_id,
            "orderId": request.order_id,
            "totalAmount": total_cents,
            "currency": self.config.currency,
            "channelKey": self.config.channel_key,
        });
        let response = self
            .client
            .post(self.endpoint("payments/prepare"))
            .bearer_auth(&self.config.api_key)
            .json(&prepare)
            .send()
            .await?;
        let raw_response = Self::check(response).await?;

        tracing::info!(
            "Wallet payment {} pre-registered for order {} ({} {} cents)",
            payment_id,
            abbrev_uuid(&request.order_id),
            total_cents,
            self.config.currency
        );

        let mut fields = BTreeMap::new();
        fields.insert("paymentId".to_string(), payment_id.clone());
        fields.insert("orderId".to_string(), request.order_id.to_string());
        fields.insert("orderName".to_string(), request.goods_name.clone());
        fields.insert("totalAmount".to_string(), total_cents.to_string());
        fields.insert("currency".to_string(), self.config.currency.clone());
        fields.insert("channelKey".to_string(), self.config.channel_key.clone());
        fields.insert("redirectUrl".to_string(), request.return_url.clone());
        if let Some(email) = &request.buyer.email {
            fields.insert("customerEmail".to_string(), email.clone());
        }
        if let Some(name) = &request.buyer.name {
            fields.insert("customerName".to_string(), name.clone());
        }

        Ok(PaymentIntent {
            action: IntentAction::Redirect {
                form: RedirectForm {
                    action: self.config.checkout_url.to_string(),
                    method: "GET".to_string(),
                    fields,
                },
            },
            provider_ref: Some(payment_id),
            raw_request: prepare,
            raw_response: Some(raw_response),
        })
    }

    async fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Approval> {
        let raw = request.raw_confirmation;
        if let Some(code) = confirmation_str(raw, "code") {
            let message = confirmation_str(raw, "message").unwrap_or("payment failed");
            return Err(PaymentError::NotApproved(format!("{code} {message}")));
        }
        let payment_id = confirmation_str(raw, "paymentId")
            .map(str::to_string)
            .unwrap_or_else(|| payment_id_for(&request.order.id));

        let (payment, raw_response) = self.fetch_payment(&payment_id).await?;

        if payment.status != STATUS_PAID {
            let reason = payment.fail_reason.unwrap_or_else(|| payment.status.clone());
            return Err(PaymentError::NotApproved(format!("Payment status is {reason}")));
        }
        if payment.order_id != request.order.id.to_string() {
            tracing::error!(
                "Wallet payment {} belongs to order {}, not {}",
                payment.id,
                payment.order_id,
                request.order.id
            );
            return Err(PaymentError::InvalidData("Payment belongs to a different order".to_string()));
        }

        Ok(Approval::Captured(Capture {
            approved_amount: self.convert(payment.amount.total)?,
            provider_transaction_id: payment.id,
            raw_response,
        }))
    }

    async fn cancel(&self, order: &Order, reason: &str) -> Result<()> {
        let payment_id = order
            .transaction_id
            .clone()
            .unwrap_or_else(|| payment_id_for(&order.id));
        let response = self
            .client
            .post(self.endpoint(&format!("payments/{payment_id}/cancel")))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "reason": reason }))
            .send()
            .await?;
        Self::check(response).await?;

        tracing::info!("Wallet payment {} cancelled for order {}", payment_id, abbrev_uuid(&order.id));
        Ok(())
    }

    async fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let signature = required_header(headers, SIGNATURE_HEADER)?;
        let timestamp = required_header(headers, TIMESTAMP_HEADER)?;
        verify_webhook(&self.config.webhook_secret, timestamp, body, signature, Utc::now())?;

        let raw: Value =
            serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed webhook body: {e}")))?;
        let parsed: WalletWebhookBody = serde_json::from_value(raw.clone())
            .map_err(|e| PaymentError::InvalidData(format!("Malformed webhook body: {e}")))?;

        let approved_amount = parsed.data.amount.map(|a| self.convert(a.total)).transpose()?;
        Ok(Some(WebhookEvent {
            event_type: WebhookEventType::parse(&parsed.event_type),
            order_id: parsed.data.order_id,
            provider_transaction_id: Some(parsed.data.payment_id),
            approved_amount,
            account: None,
            reason: parsed.data.reason,
            raw,
        }))
    }
}
