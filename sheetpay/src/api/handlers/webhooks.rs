//! HTTP handler for provider webhooks.
//!
//! The body is taken as a raw string because signatures are computed over the exact bytes
//! the provider sent. A delivery that fails verification is answered with 400 and never
//! touches an order. A verified delivery whose processing fails is answered with 500 so the
//! provider redelivers; settlement is idempotent, so a redelivery cannot apply effects twice.

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use tracing::{error, info};

use crate::{
    AppState,
    api::models::payments::WebhookAck,
    errors::{Error, Result},
    payment_providers::ProviderKind,
    types::abbrev_uuid,
};

#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>> {
    let kind: ProviderKind = provider.parse()?;
    let adapter = state.providers.get(kind).ok_or_else(|| Error::NotFound {
        resource: "Payment provider".to_string(),
        id: kind.to_string(),
    })?;

    let Some(event) = adapter.validate_webhook(&headers, &body).await? else {
        info!("Provider does not use webhooks, ignoring delivery");
        return Ok(Json(WebhookAck { received: true }));
    };

    let order_id = event.order_id;
    match state.reconciler.apply_webhook(event).await {
        Ok(disposition) => {
            info!(order_id = %abbrev_uuid(&order_id), ?disposition, "Webhook processed");
            Ok(Json(WebhookAck { received: true }))
        }
        Err(e) => {
            error!(order_id = %order_id, error = %e, "Webhook processing failed, asking provider to redeliver");
            Err(Error::Internal {
                operation: "process webhook".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CardGatewayConfig;
    use crate::db::models::orders::{PaymentMethod, PaymentStatus};
    use crate::db::store::Store;
    use crate::db::store::in_memory::Fault;
    use crate::payment_providers::card_gateway::{SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use crate::payment_providers::signing::sign_webhook;
    use crate::test_utils::{create_test_app_with_config, create_test_config, insert_pending_order, insert_top_up_order};
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    const SECRET: &str = "hook-secret";

    fn config() -> crate::Config {
        let mut config = create_test_config();
        config.payment.card_gateway = Some(CardGatewayConfig {
            mid: "MID001".to_string(),
            sign_key: "sign-key".to_string(),
            webhook_secret: SECRET.to_string(),
            checkout_url: "https://pay.example.com/checkout".parse().unwrap(),
            approve_url: "http://127.0.0.1:9/approve".parse().unwrap(),
            cancel_url: "http://127.0.0.1:9/refund".parse().unwrap(),
            timeout: Duration::from_secs(1),
        });
        config
    }

    async fn deliver(server: &axum_test::TestServer, body: &str, secret: &str) -> axum_test::TestResponse {
        let ts = Utc::now().timestamp();
        server
            .post("/api/v1/webhooks/card_gateway")
            .add_header(TIMESTAMP_HEADER, ts.to_string().as_str())
            .add_header(SIGNATURE_HEADER, sign_webhook(secret, ts, body).unwrap().as_str())
            .text(body)
            .await
    }

    #[tokio::test]
    async fn test_paid_webhook_settles_once() {
        let (server, _bg, store) = create_test_app_with_config(config()).await;
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 8_000, 500).await;
        let body = json!({
            "type": "payment.paid",
            "data": { "oid": order.id, "tid": "T-1", "price": 8000 }
        })
        .to_string();

        let response = deliver(&server, &body, SECRET).await;
        response.assert_status_ok();
        assert_eq!(response.json::<serde_json::Value>()["received"], true);

        // Redelivery is acknowledged without a second credit
        deliver(&server, &body, SECRET).await.assert_status_ok();
        assert_eq!(store.get_balance(user).await.unwrap(), 8_500);
        let settled = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(settled.payment_status, PaymentStatus::Paid);
        assert_eq!(settled.transaction_id.as_deref(), Some("T-1"));
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_without_effects() {
        let (server, _bg, store) = create_test_app_with_config(config()).await;
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 8_000, 0).await;
        let body = json!({
            "type": "payment.paid",
            "data": { "oid": order.id, "tid": "T-2", "price": 8000 }
        })
        .to_string();

        deliver(&server, &body, "wrong-secret")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(store.get_balance(user).await.unwrap(), 0);
        let current = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_and_account_events() {
        let (server, _bg, store) = create_test_app_with_config(config()).await;
        let user = Uuid::new_v4();
        let card = insert_pending_order(&store, user, PaymentMethod::Card, &[1_000]).await;
        let vbank = insert_pending_order(&store, user, PaymentMethod::VirtualAccount, &[5_000]).await;

        let failed = json!({
            "type": "payment.failed",
            "data": { "oid": card.id, "reason": "card declined" }
        })
        .to_string();
        deliver(&server, &failed, SECRET).await.assert_status_ok();
        let current = store.get_order(card.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Failed);

        let issued = json!({
            "type": "vbank.issued",
            "data": {
                "oid": vbank.id,
                "tid": "T-3",
                "vbank": { "bank_name": "Hana", "account_number": "999", "account_holder": "Sheet Shop" }
            }
        })
        .to_string();
        deliver(&server, &issued, SECRET).await.assert_status_ok();
        let current = store.get_order(vbank.id).await.unwrap().unwrap();
        assert_eq!(current.virtual_account_info.unwrap().account_number, "999");
    }

    #[tokio::test]
    async fn test_unknown_order_is_acknowledged() {
        let (server, _bg, _store) = create_test_app_with_config(config()).await;
        let body = json!({
            "type": "payment.paid",
            "data": { "oid": Uuid::new_v4(), "tid": "T-4", "price": 100 }
        })
        .to_string();

        deliver(&server, &body, SECRET).await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_processing_failure_asks_for_redelivery() {
        let (server, _bg, store) = create_test_app_with_config(config()).await;
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 3_000, 0).await;
        let body = json!({
            "type": "payment.paid",
            "data": { "oid": order.id, "tid": "T-5", "price": 3000 }
        })
        .to_string();

        store.fail_next(Fault::FinalizeOrder);
        deliver(&server, &body, SECRET)
            .await
            .assert_status(StatusCode::INTERNAL_SERVER_ERROR);

        // The redelivery finishes the job without charging twice
        deliver(&server, &body, SECRET).await.assert_status_ok();
        assert_eq!(store.get_balance(user).await.unwrap(), 3_000);
        let settled = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(settled.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_provider_without_webhooks_is_acknowledged() {
        let (server, _bg, _store) = create_test_app_with_config(create_test_config()).await;

        server
            .post("/api/v1/webhooks/dummy")
            .text("{}")
            .await
            .assert_status_ok();
        server
            .post("/api/v1/webhooks/card_gateway")
            .text("{}")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
