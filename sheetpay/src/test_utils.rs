//! Fixtures shared by unit and HTTP tests.

use axum_test::TestServer;
use chrono::Utc;
use serde_json::{Map, json};
use uuid::Uuid;

use crate::checkout::order_number::generate_order_number;
use crate::checkout::orchestrator::PurchaseItem;
use crate::config::{Config, DatabaseConfig, DummyConfig, ManualTransferConfig};
use crate::db::models::{
    credits::{CreditApplyOutcome, CreditEntryCreateDBRequest},
    orders::{
        Order, OrderCreateDBRequest, OrderItemCreateDBRequest, OrderStatus, PaymentMethod, PaymentStatus,
        VirtualAccountInfo,
    },
};
use crate::db::store::{InMemoryStore, Store};
use crate::types::{Amount, UserId};

pub const TEST_ADMIN_TOKEN: &str = "test-admin-token";

pub fn create_test_config() -> Config {
    let mut config = Config {
        database: DatabaseConfig::InMemory,
        ..Default::default()
    };
    config.auth.admin_token = TEST_ADMIN_TOKEN.to_string();
    config.payment.return_url_base = "http://localhost:3001".to_string();
    config.payment.dummy = DummyConfig { enabled: true };
    config.payment.manual_transfer = ManualTransferConfig {
        enabled: true,
        bank_name: "Kookmin".to_string(),
        account_number: "123-45-6789".to_string(),
        account_holder: "Sheet Shop".to_string(),
        deposit_window: None,
    };
    config.settlement.outbox.enabled = false;
    config.settlement.sweeper.enabled = false;
    config
}

/// Server over a fresh in-memory store. The store handle lets tests inspect and seed state.
pub async fn create_test_app() -> (TestServer, crate::BackgroundServices, InMemoryStore) {
    create_test_app_with_config(create_test_config()).await
}

pub async fn create_test_app_with_config(config: Config) -> (TestServer, crate::BackgroundServices, InMemoryStore) {
    let store = InMemoryStore::new();
    let app = crate::Application::new_with_store(config, std::sync::Arc::new(store.clone()))
        .await
        .expect("Failed to create application");
    let (server, bg_services) = app.into_test_server();
    (server, bg_services, store)
}

pub fn user_headers(config: &Config, user_id: UserId) -> (String, String) {
    (config.auth.user_header.clone(), user_id.to_string())
}

pub fn sample_items(prices: &[Amount]) -> Vec<OrderItemCreateDBRequest> {
    prices
        .iter()
        .enumerate()
        .map(|(i, price)| OrderItemCreateDBRequest {
            product_id: Uuid::new_v4(),
            title: format!("Nocturne No. {}", i + 1),
            price: *price,
        })
        .collect()
}

pub fn purchase_items(prices: &[Amount]) -> Vec<PurchaseItem> {
    sample_items(prices)
        .into_iter()
        .map(|item| PurchaseItem {
            product_id: item.product_id,
            title: item.title,
            price: item.price,
        })
        .collect()
}

pub fn sample_account() -> VirtualAccountInfo {
    VirtualAccountInfo {
        bank_name: "Woori".to_string(),
        account_number: "1002-123-456789".to_string(),
        account_holder: "Sheet Shop".to_string(),
        expected_depositor: None,
        amount: None,
        expires_at: None,
        issued_at: None,
    }
}

/// A pending sheet-purchase order request with a unique order number.
pub fn sample_order_request(user_id: UserId, amount: Amount, method: PaymentMethod) -> OrderCreateDBRequest {
    let mut metadata = Map::new();
    metadata.insert("type".to_string(), json!("sheet_purchase"));
    OrderCreateDBRequest {
        id: Uuid::new_v4(),
        order_number: format!("{}-{}", generate_order_number(Utc::now()), Uuid::new_v4().simple()),
        user_id,
        total_amount: amount,
        status: OrderStatus::Pending,
        payment_status: if method.awaits_deposit() {
            PaymentStatus::AwaitingDeposit
        } else {
            PaymentStatus::Pending
        },
        payment_method: method,
        metadata,
        transaction_id: None,
        depositor_name: None,
        payment_confirmed_at: None,
    }
}

/// An order value that was never stored, for provider tests.
pub fn sample_order(user_id: UserId, amount: Amount, method: PaymentMethod) -> Order {
    let request = sample_order_request(user_id, amount, method);
    let now = Utc::now();
    Order {
        id: request.id,
        order_number: request.order_number,
        user_id,
        total_amount: amount,
        status: request.status,
        payment_status: request.payment_status,
        payment_method: method,
        metadata: serde_json::Value::Object(request.metadata),
        transaction_id: None,
        depositor_name: None,
        virtual_account_info: None,
        payment_confirmed_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Insert an unpaid sheet purchase with one item per price.
pub async fn insert_pending_order(store: &InMemoryStore, user_id: UserId, method: PaymentMethod, prices: &[Amount]) -> Order {
    let order = store
        .insert_order(&sample_order_request(user_id, prices.iter().sum(), method))
        .await
        .unwrap();
    store.insert_order_items(order.id, &sample_items(prices)).await.unwrap();
    order
}

/// Insert an unpaid credit top-up.
pub async fn insert_top_up_order(store: &InMemoryStore, user_id: UserId, amount: Amount, bonus: Amount) -> Order {
    let mut request = sample_order_request(user_id, amount, PaymentMethod::Card);
    request.metadata.insert("type".to_string(), json!("cash_charge"));
    request.metadata.insert("bonusAmount".to_string(), json!(bonus));
    store.insert_order(&request).await.unwrap()
}

/// Give a user credits through a ledger entry, so replay audits stay consistent.
pub async fn charge_credits(store: &InMemoryStore, user_id: UserId, amount: Amount) {
    let outcome = store
        .apply_credit_entry(&CreditEntryCreateDBRequest::charge(user_id, Uuid::new_v4(), amount, 0))
        .await
        .unwrap();
    assert!(matches!(outcome, CreditApplyOutcome::Applied(_)));
}
