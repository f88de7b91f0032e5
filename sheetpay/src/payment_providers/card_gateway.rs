//! Card and virtual-account gateway ("Provider A").
//!
//! Checkout is a signed form the client posts to the gateway's hosted page. When the buyer
//! returns, the gateway hands us a one-time `authToken`; approval exchanges it server to server
//! at the configured approval URL. The `authUrl` the gateway includes in the return request
//! is client-controlled and is never used.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    config::CardGatewayConfig,
    db::models::orders::{Order, PaymentMethod, VirtualAccountInfo},
    payment_providers::{
        Approval, ApprovalRequest, Capture, IntentAction, IntentRequest, PaymentError, PaymentIntent, PaymentProvider,
        ProviderKind, RedirectForm, Result, WebhookEvent, WebhookEventType, confirmation_str, parse_amount, required_header,
        signing::{sha256_hex, verify_webhook},
    },
    types::{OrderId, abbrev_uuid},
};

pub const SIGNATURE_HEADER: &str = "x-card-gateway-signature";
pub const TIMESTAMP_HEADER: &str = "x-card-gateway-timestamp";

/// Gateway result code for an approved request.
const RESULT_APPROVED: &str = "0000";
/// Gateway result code for a successful refund.
const RESULT_REFUNDED: &str = "00";

/// Card gateway payment provider
pub struct CardGatewayProvider {
    config: CardGatewayConfig,
    client: reqwest::Client,
}

impl CardGatewayProvider {
    pub fn new(config: CardGatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Fields of the signed checkout form
    fn checkout_fields(&self, request: &IntentRequest, timestamp: i64) -> BTreeMap<String, String> {
        let oid = request.order_id.to_string();
        let price = request.amount.to_string();
        let signature = sha256_hex(&format!("oid={oid}&price={price}&timestamp={timestamp}"));
        let verification = sha256_hex(&format!(
            "oid={oid}&price={price}&signKey={}&timestamp={timestamp}",
            self.config.sign_key
        ));
        let gopaymethod = match request.method {
            PaymentMethod::VirtualAccount => "VBank",
            _ => "Card",
        };

        let mut fields = BTreeMap::new();
        fields.insert("version".to_string(), "1.0".to_string());
        fields.insert("mid".to_string(), self.config.mid.clone());
        fields.insert("oid".to_string(), oid);
        fields.insert("price".to_string(), price);
        fields.insert("goodname".to_string(), request.goods_name.clone());
        fields.insert("gopaymethod".to_string(), gopaymethod.to_string());
        fields.insert("timestamp".to_string(), timestamp.to_string());
        fields.insert("signature".to_string(), signature);
        fields.insert("verification".to_string(), verification);
        fields.insert("mKey".to_string(), sha256_hex(&self.config.sign_key));
        fields.insert("returnUrl".to_string(), request.return_url.clone());
        fields.insert("merchantData".to_string(), request.order_number.clone());
        fields.insert("charset".to_string(), "UTF-8".to_string());
        if let Some(name) = &request.buyer.name {
            fields.insert("buyername".to_string(), name.clone());
        }
        if let Some(email) = &request.buyer.email {
            fields.insert("buyeremail".to_string(), email.clone());
        }
        if let Some(phone) = &request.buyer.phone {
            fields.insert("buyertel".to_string(), phone.clone());
        }
        fields
    }

    async fn post_form(&self, url: &url::Url, form: &[(&str, String)]) -> Result<Value> {
        let response = self.client.post(url.clone()).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::ProviderApi(format!("HTTP {status}: {body}")));
        }
        Ok(response.json::<Value>().await?)
    }
}

/// Account details in an approval response for a virtual-account payment
fn issued_account(response: &Value, amount: Option<i64>) -> Option<VirtualAccountInfo> {
    let field = |key: &str| response.get(key).and_then(Value::as_str).map(str::to_string);
    let expires_at = match (field("VACT_Date"), field("VACT_Time")) {
        (Some(date), Some(time)) => NaiveDateTime::parse_from_str(&format!("{date}{time}"), "%Y%m%d%H%M%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive)),
        _ => None,
    };
    Some(VirtualAccountInfo {
        bank_name: field("vactBankName")?,
        account_number: field("VACT_Num")?,
        account_holder: field("VACT_Name")?,
        expected_depositor: field("VACT_InputName"),
        amount,
        expires_at,
        issued_at: None,
    })
}

#[derive(Debug, Deserialize)]
struct CardWebhookBody {
    #[serde(rename = "type")]
    event_type: String,
    data: CardWebhookData,
}

#[derive(Debug, Deserialize)]
struct CardWebhookData {
    oid: OrderId,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    price: Option<Value>,
    #[serde(default)]
    vbank: Option<VirtualAccountInfo>,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl PaymentProvider for CardGatewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CardGateway
    }

    async fn create_intent(&self, request: &IntentRequest) -> Result<PaymentIntent> {
        let timestamp = Utc::now().timestamp_millis();
        let fields = self.checkout_fields(request, timestamp);

        tracing::info!(
            "Card gateway checkout form created for order {} ({})",
            abbrev_uuid(&request.order_id),
            request.method
        );

        let mut raw_request = json!(fields);
        // Keep the signing key digest out of the audit log
        if let Some(obj) = raw_request.as_object_mut() {
            obj.remove("mKey");
        }

        Ok(PaymentIntent {
            action: IntentAction::Redirect {
                form: RedirectForm {
                    action: self.config.checkout_url.to_string(),
                    method: "POST".to_string(),
                    fields,
                },
            },
            provider_ref: None,
            raw_request,
            raw_response: None,
        })
    }

    async fn approve(&self, request: &ApprovalRequest<'_>) -> Result<Approval> {
        let raw = request.raw_confirmation;
        let result_code = confirmation_str(raw, "resultCode").unwrap_or_default();
        if result_code != RESULT_APPROVED {
            let message = confirmation_str(raw, "resultMsg").unwrap_or("authentication failed");
            return Err(PaymentError::NotApproved(format!("{result_code} {message}")));
        }
        if let Some(oid) = confirmation_str(raw, "oid").or_else(|| confirmation_str(raw, "orderNumber")) {
            if oid != request.order.id.to_string() {
                return Err(PaymentError::InvalidData(format!("Return is for a different order: {oid}")));
            }
        }
        let auth_token = confirmation_str(raw, "authToken")
            .ok_or_else(|| PaymentError::InvalidData("Missing authToken".to_string()))?;

        let timestamp = Utc::now().timestamp_millis();
        let form = [
            ("mid", self.config.mid.clone()),
            ("authToken", auth_token.to_string()),
            ("timestamp", timestamp.to_string()),
            ("signature", sha256_hex(&format!("authToken={auth_token}&timestamp={timestamp}"))),
            (
                "verification",
                sha256_hex(&format!(
                    "authToken={auth_token}&signKey={}&timestamp={timestamp}",
                    self.config.sign_key
                )),
            ),
            ("charset", "UTF-8".to_string()),
            ("format", "JSON".to_string()),
        ];

        let response = self.post_form(&self.config.approve_url, &form).await?;
        let code = response.get("resultCode").and_then(Value::as_str).unwrap_or_default();
        if code != RESULT_APPROVED {
            let message = response.get("resultMsg").and_then(Value::as_str).unwrap_or("unknown");
            tracing::warn!(
                "Card gateway declined approval for order {}: {} {}",
                abbrev_uuid(&request.order.id),
                code,
                message
            );
            return Err(PaymentError::NotApproved(format!("{code} {message}")));
        }

        let tid = response
            .get("tid")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymentError::ProviderApi("Approval response missing tid".to_string()))?
            .to_string();
        let approved_amount = response.get("TotPrice").and_then(parse_amount);

        let pay_method = response.get("payMethod").and_then(Value::as_str).unwrap_or_default();
        if pay_method.eq_ignore_ascii_case("VBank") {
            let account = issued_account(&response, approved_amount);
            return Ok(Approval::DepositPending {
                account,
                provider_transaction_id: Some(tid),
                raw_response: response,
            });
        }

        let approved_amount =
            approved_amount.ok_or_else(|| PaymentError::ProviderApi("Approval response missing TotPrice".to_string()))?;

        Ok(Approval::Captured(Capture {
            approved_amount,
            provider_transaction_id: tid,
            raw_response: response,
        }))
    }

    async fn cancel(&self, order: &Order, reason: &str) -> Result<()> {
        let Some(tid) = order.transaction_id.as_deref() else {
            tracing::debug!("Order {} has no gateway transaction, nothing to cancel", abbrev_uuid(&order.id));
            return Ok(());
        };

        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let hash_data = sha256_hex(&format!("{}Refund{timestamp}{}{tid}", self.config.sign_key, self.config.mid));
        let form = [
            ("type", "Refund".to_string()),
            ("mid", self.config.mid.clone()),
            ("tid", tid.to_string()),
            ("msg", reason.to_string()),
            ("timestamp", timestamp),
            ("hashData", hash_data),
        ];

        let response = self.post_form(&self.config.cancel_url, &form).await?;
        let code = response.get("resultCode").and_then(Value::as_str).unwrap_or_default();
        if code != RESULT_REFUNDED && code != RESULT_APPROVED {
            let message = response.get("resultMsg").and_then(Value::as_str).unwrap_or("unknown");
            return Err(PaymentError::ProviderApi(format!("Cancel rejected: {code} {message}")));
        }

        tracing::info!("Card gateway cancelled transaction {} for order {}", tid, abbrev_uuid(&order.id));
        Ok(())
    }

    async fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let signature = required_header(headers, SIGNATURE_HEADER)?;
        let timestamp = required_header(headers, TIMESTAMP_HEADER)?;
        verify_webhook(&self.config.webhook_secret, timestamp, body, signature, Utc::now())?;

        let parsed: CardWebhookBody =
            serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed webhook body: {e}")))?;
        let raw: Value =
            serde_json::from_str(body).map_err(|e| PaymentError::InvalidData(format!("Malformed webhook body: {e}")))?;

        let approved_amount = parsed.data.price.as_ref().and_then(parse_amount);
        Ok(Some(WebhookEvent {
            event_type: WebhookEventType::parse(&parsed.event_type),
            order_id: parsed.data.oid,
            provider_transaction_id: parsed.data.tid,
            approved_amount,
            account: parsed.data.vbank,
            reason: parsed.data.reason,
            raw,
        }))
    }
}
