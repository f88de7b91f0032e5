//! Purchase entry point.
//!
//! Validates the request, then either pays it from the credit balance in one call or
//! writes an unpaid order and asks the rail's provider for an intent. Nothing is written
//! for a request that fails validation.
//!
//! Every amount is bounded by `payment.max_amount`. Top-up bonuses come from the configured
//! tier table; a bonus quoted by the client is only checked against it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    checkout::{
        insert_order_with_fresh_number,
        ledger::{CreditLedger, LedgerPurchase},
        order_number::generate_order_number,
        record_transaction,
    },
    db::{
        models::{
            orders::{
                METADATA_BONUS_AMOUNT, METADATA_TYPE, OrderCreateDBRequest, OrderItemCreateDBRequest, OrderStatus,
                PaymentMethod, PaymentStatus, PurchaseKind, VirtualAccountInfo,
            },
            payment_transactions::PaymentTransactionCreateDBRequest,
        },
        store::Store,
    },
    config::PaymentConfig,
    errors::{Error, Result},
    payment_providers::{Buyer, IntentAction, IntentRequest, ProviderKind, ProviderRegistry, RedirectForm},
    types::{Amount, OrderId, ProductId, UserId, abbrev_uuid},
};

/// One product in a purchase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PurchaseItem {
    pub product_id: ProductId,
    pub title: String,
    pub price: Amount,
}

impl From<&PurchaseItem> for OrderItemCreateDBRequest {
    fn from(item: &PurchaseItem) -> Self {
        Self {
            product_id: item.product_id,
            title: item.title.clone(),
            price: item.price,
        }
    }
}

/// A purchase as requested by a buyer. An empty item list means a credit top-up.
#[derive(Debug, Clone, Default)]
pub struct PurchaseRequest {
    pub user_id: UserId,
    pub items: Vec<PurchaseItem>,
    pub amount: Amount,
    pub method: Option<PaymentMethod>,
    /// Bonus the client displayed to the buyer; must match the configured tier
    pub quoted_bonus: Option<Amount>,
    pub buyer: Buyer,
    pub depositor_name: Option<String>,
    pub description: Option<String>,
    pub metadata: Map<String, Value>,
    /// Where the client wants the buyer to land afterwards
    pub return_url: Option<String>,
}

/// What the client does after starting a purchase.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextAction {
    Redirect { form: RedirectForm },
    Deposit { account: VirtualAccountInfo },
    /// Paid from the credit balance; nothing left to do
    Completed { new_balance: Amount },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PurchaseHandle {
    pub order_id: OrderId,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub amount: Amount,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    pub next_action: NextAction,
}

#[derive(Clone)]
pub struct PurchaseOrchestrator {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    ledger: CreditLedger,
    payment: PaymentConfig,
}

impl PurchaseOrchestrator {
    pub fn new(store: Arc<dyn Store>, providers: ProviderRegistry, ledger: CreditLedger, payment: PaymentConfig) -> Self {
        Self {
            store,
            providers,
            ledger,
            payment,
        }
    }

    fn provider_return_url(&self, kind: ProviderKind, order_id: OrderId) -> String {
        format!(
            "{}/api/v1/payments/{kind}/return?order_id={order_id}",
            self.payment.return_url_base.trim_end_matches('/')
        )
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id), amount = request.amount), err)]
    pub async fn start_purchase(&self, request: PurchaseRequest) -> Result<PurchaseHandle> {
        let ValidPurchase { method, bonus } = validate(&request, &self.payment)?;
        let kind = if request.items.is_empty() {
            PurchaseKind::CashCharge
        } else {
            PurchaseKind::SheetPurchase
        };
        let metadata = build_metadata(&request, kind, bonus);
        let items: Vec<OrderItemCreateDBRequest> = request.items.iter().map(Into::into).collect();

        if method == PaymentMethod::Ledger {
            let receipt = self
                .ledger
                .purchase_with_ledger(LedgerPurchase {
                    user_id: request.user_id,
                    total: request.amount,
                    items,
                    metadata,
                    description: request.description.clone(),
                })
                .await?;
            return Ok(PurchaseHandle {
                order_id: receipt.order.id,
                order_number: receipt.order.order_number,
                status: receipt.order.status,
                payment_status: receipt.order.payment_status,
                amount: receipt.order.total_amount,
                provider: None,
                next_action: NextAction::Completed {
                    new_balance: receipt.new_balance,
                },
            });
        }

        let provider = self
            .providers
            .for_method(method)
            .map_err(|e| Error::validation(e.to_string()))?;

        let initial_status = if method.awaits_deposit() {
            PaymentStatus::AwaitingDeposit
        } else {
            PaymentStatus::Pending
        };
        let depositor_name = request.depositor_name.as_deref().map(str::trim).map(str::to_string);
        let order = insert_order_with_fresh_number(
            self.store.as_ref(),
            OrderCreateDBRequest {
                id: Uuid::new_v4(),
                order_number: generate_order_number(Utc::now()),
                user_id: request.user_id,
                total_amount: request.amount,
                status: OrderStatus::Pending,
                payment_status: initial_status,
                payment_method: method,
                metadata,
                transaction_id: None,
                depositor_name: depositor_name.clone(),
                payment_confirmed_at: None,
            },
        )
        .await?;

        if !items.is_empty() {
            if let Err(e) = self.store.insert_order_items(order.id, &items).await {
                // No payment was started, so the order simply goes away
                if let Err(cleanup) = self.store.delete_order(order.id).await {
                    error!(order_id = %order.id, error = %cleanup, "Failed to delete order after item insert failure");
                }
                return Err(e.into());
            }
        }

        let intent_request = IntentRequest {
            user_id: order.user_id,
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: order.total_amount,
            method,
            return_url: self.provider_return_url(provider.kind(), order.id),
            buyer: request.buyer.clone(),
            goods_name: goods_name(&request),
            depositor_name,
        };

        let intent = match provider.create_intent(&intent_request).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(order_id = %abbrev_uuid(&order.id), provider = provider.kind().as_str(), error = %e, "Payment intent failed");
                if let Err(fail) = self
                    .store
                    .transition_order(order.id, &[initial_status], OrderStatus::Failed, PaymentStatus::Failed)
                    .await
                {
                    warn!(order_id = %abbrev_uuid(&order.id), error = %fail, "Failed to mark order failed");
                }
                record_transaction(
                    self.store.as_ref(),
                    &PaymentTransactionCreateDBRequest {
                        order_id: order.id,
                        user_id: order.user_id,
                        method,
                        provider: provider.kind().to_string(),
                        amount: order.total_amount,
                        status: PaymentStatus::Failed,
                        provider_transaction_id: None,
                        raw_request: None,
                        raw_response: None,
                        error_message: Some(e.to_string()),
                    },
                )
                .await;
                return Err(e.into());
            }
        };

        let (order, next_action, log_status) = match intent.action {
            IntentAction::Redirect { form } => (order, NextAction::Redirect { form }, PaymentStatus::Pending),
            IntentAction::Deposit { account } => {
                // The intent already exists at the provider; the buyer gets the account either way
                let order = match self.store.set_order_account_info(order.id, &account).await {
                    Ok(updated) => updated.unwrap_or(order),
                    Err(e) => {
                        warn!(order_id = %abbrev_uuid(&order.id), error = %e, "Failed to store account details");
                        order
                    }
                };
                (order, NextAction::Deposit { account }, PaymentStatus::AwaitingDeposit)
            }
        };

        record_transaction(
            self.store.as_ref(),
            &PaymentTransactionCreateDBRequest {
                order_id: order.id,
                user_id: order.user_id,
                method,
                provider: provider.kind().to_string(),
                amount: order.total_amount,
                status: log_status,
                provider_transaction_id: intent.provider_ref,
                raw_request: Some(intent.raw_request),
                raw_response: intent.raw_response,
                error_message: None,
            },
        )
        .await;

        info!(
            order_id = %abbrev_uuid(&order.id),
            order_number = %order.order_number,
            method = method.as_str(),
            kind = kind.as_str(),
            "Purchase started"
        );

        Ok(PurchaseHandle {
            order_id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_status: order.payment_status,
            amount: order.total_amount,
            provider: Some(provider.kind()),
            next_action,
        })
    }
}

/// What validation settled on for a purchase.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ValidPurchase {
    method: PaymentMethod,
    /// Server-side bonus; zero for product purchases
    bonus: Amount,
}

/// Reject malformed purchases before anything is written.
fn validate(request: &PurchaseRequest, payment: &PaymentConfig) -> Result<ValidPurchase> {
    let method = request
        .method
        .ok_or_else(|| Error::validation("Payment method is required"))?;

    if request.amount < 0 {
        return Err(Error::validation("Amount must not be negative"));
    }
    if request.amount > payment.max_amount {
        return Err(Error::validation(format!(
            "Amount {} exceeds the maximum of {}",
            request.amount, payment.max_amount
        )));
    }

    let bonus = if request.items.is_empty() {
        if request.amount == 0 {
            return Err(Error::validation("Top-up amount must be positive"));
        }
        if method == PaymentMethod::Ledger {
            return Err(Error::validation("Credits cannot be topped up with credits"));
        }
        payment.top_up_bonus_for(request.amount)
    } else {
        if request.quoted_bonus.is_some_and(|bonus| bonus != 0) {
            return Err(Error::validation("Bonus credits only apply to top-ups"));
        }
        if request.items.iter().any(|item| item.price < 0) {
            return Err(Error::validation("Item prices must not be negative"));
        }
        if request.items.iter().any(|item| item.price > payment.max_amount) {
            return Err(Error::validation(format!(
                "Item prices cannot exceed {}",
                payment.max_amount
            )));
        }
        let mut seen = HashSet::new();
        if !request.items.iter().all(|item| seen.insert(item.product_id)) {
            return Err(Error::validation("Each product may appear only once"));
        }
        let sum = request
            .items
            .iter()
            .try_fold(0 as Amount, |sum, item| sum.checked_add(item.price))
            .ok_or_else(|| Error::validation("Item prices add up to more than can be charged"))?;
        if sum != request.amount {
            return Err(Error::validation(format!(
                "Item prices add up to {sum}, not {}",
                request.amount
            )));
        }
        if request.amount == 0 && method != PaymentMethod::Ledger {
            return Err(Error::validation("Free purchases must use the ledger"));
        }
        0
    };

    if let Some(quoted) = request.quoted_bonus {
        if quoted != bonus {
            return Err(Error::validation(format!(
                "Quoted bonus {quoted} does not match the current bonus of {bonus}"
            )));
        }
    }

    if method == PaymentMethod::ManualBankTransfer
        && request.depositor_name.as_deref().map(str::trim).unwrap_or_default().is_empty()
    {
        return Err(Error::validation("Depositor name is required for bank transfer"));
    }

    Ok(ValidPurchase { method, bonus })
}

fn build_metadata(request: &PurchaseRequest, kind: PurchaseKind, bonus: Amount) -> Map<String, Value> {
    let mut metadata = request.metadata.clone();
    // Settlement reads these; the client never sets them
    metadata.remove(METADATA_BONUS_AMOUNT);
    metadata.remove("chargeAmount");
    metadata.insert(METADATA_TYPE.to_string(), json!(kind.as_str()));
    match kind {
        PurchaseKind::CashCharge => {
            metadata.insert(METADATA_BONUS_AMOUNT.to_string(), json!(bonus));
            metadata.insert("chargeAmount".to_string(), json!(request.amount));
        }
        PurchaseKind::SheetPurchase => {
            let ids: Vec<_> = request.items.iter().map(|item| item.product_id).collect();
            metadata.insert("sheetIds".to_string(), json!(ids));
            metadata.insert("itemCount".to_string(), json!(request.items.len()));
        }
    }
    if let Some(description) = &request.description {
        metadata.insert("description".to_string(), json!(description));
    }
    if let Some(return_url) = &request.return_url {
        metadata.insert("returnUrl".to_string(), json!(return_url));
    }
    metadata
}

fn goods_name(request: &PurchaseRequest) -> String {
    if let Some(description) = &request.description {
        return description.clone();
    }
    match request.items.as_slice() {
        [] => format!("Credit top-up {}", request.amount),
        [only] => only.title.clone(),
        [first, rest @ ..] => format!("{} and {} more", first.title, rest.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ManualTransferConfig, TopUpBonusTier};
    use crate::db::store::in_memory::{Fault, InMemoryStore};
    use crate::payment_providers::{
        Approval, ApprovalRequest, PaymentError, PaymentIntent, PaymentProvider, WebhookEvent, dummy::DummyProvider,
        manual_transfer::ManualTransferProvider,
    };
    use crate::test_utils::{charge_credits, purchase_items};
    use async_trait::async_trait;
    use axum::http::HeaderMap;
    use rstest::rstest;
    use std::time::Duration;

    struct UnreachableGateway;

    #[async_trait]
    impl PaymentProvider for UnreachableGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::CardGateway
        }

        async fn create_intent(&self, _request: &IntentRequest) -> crate::payment_providers::Result<PaymentIntent> {
            Err(PaymentError::ProviderApi("gateway unavailable".to_string()))
        }

        async fn approve(&self, _request: &ApprovalRequest<'_>) -> crate::payment_providers::Result<Approval> {
            Err(PaymentError::ProviderApi("gateway unavailable".to_string()))
        }

        async fn cancel(&self, _order: &crate::db::models::orders::Order, _reason: &str) -> crate::payment_providers::Result<()> {
            Ok(())
        }

        async fn validate_webhook(&self, _headers: &HeaderMap, _body: &str) -> crate::payment_providers::Result<Option<WebhookEvent>> {
            Ok(None)
        }
    }

    fn payment_config() -> PaymentConfig {
        PaymentConfig {
            return_url_base: "https://pay.example.com/".to_string(),
            max_amount: 1_000_000,
            top_up_bonus: vec![
                TopUpBonusTier {
                    min_amount: 10_000,
                    bonus: 500,
                },
                TopUpBonusTier {
                    min_amount: 50_000,
                    bonus: 5_000,
                },
            ],
            ..Default::default()
        }
    }

    fn orchestrator_with(store: &InMemoryStore, providers: ProviderRegistry, payment: PaymentConfig) -> PurchaseOrchestrator {
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let ledger = CreditLedger::new(shared.clone(), Duration::from_secs(30));
        PurchaseOrchestrator::new(shared, providers, ledger, payment)
    }

    fn orchestrator(store: &InMemoryStore, providers: ProviderRegistry) -> PurchaseOrchestrator {
        orchestrator_with(store, providers, payment_config())
    }

    fn top_up(amount: Amount, quoted_bonus: Option<Amount>) -> PurchaseRequest {
        PurchaseRequest {
            user_id: Uuid::new_v4(),
            amount,
            quoted_bonus,
            method: Some(PaymentMethod::WalletRedirect),
            ..Default::default()
        }
    }

    fn default_providers() -> ProviderRegistry {
        ProviderRegistry::default()
            .with_provider(Arc::new(DummyProvider))
            .with_provider(Arc::new(ManualTransferProvider::from(ManualTransferConfig {
                enabled: true,
                bank_name: "Kookmin".to_string(),
                account_number: "123-45-6789".to_string(),
                account_holder: "Sheet Shop".to_string(),
                deposit_window: Some(Duration::from_secs(72 * 3600)),
            })))
    }

    fn request(user_id: UserId, prices: &[Amount], method: PaymentMethod) -> PurchaseRequest {
        PurchaseRequest {
            user_id,
            items: purchase_items(prices),
            amount: prices.iter().sum(),
            method: Some(method),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_card_purchase_creates_pending_order_and_redirect() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let user = Uuid::new_v4();

        let handle = orchestrator
            .start_purchase(request(user, &[3_000, 2_000], PaymentMethod::Card))
            .await
            .unwrap();

        assert_eq!(handle.payment_status, PaymentStatus::Pending);
        assert_eq!(handle.provider, Some(ProviderKind::Dummy));
        let NextAction::Redirect { form } = &handle.next_action else {
            panic!("expected a redirect, got {:?}", handle.next_action);
        };
        assert_eq!(
            form.action,
            format!("https://pay.example.com/api/v1/payments/dummy/return?order_id={}", handle.order_id)
        );

        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert!(order.order_number.starts_with("ORD"));
        assert_eq!(order.metadata["type"], "sheet_purchase");
        assert_eq!(order.metadata["itemCount"], 2);
        assert_eq!(store.get_order_items(order.id).await.unwrap().len(), 2);
        let logs = store.list_transaction_logs(order.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].provider, "dummy");
        assert_eq!(logs[0].status, PaymentStatus::Pending);
    }

    #[rstest]
    #[case::below_first_tier(9_999, 0)]
    #[case::first_tier(10_000, 500)]
    #[case::top_tier(80_000, 5_000)]
    #[tokio::test]
    async fn test_top_up_bonus_comes_from_tiers(#[case] amount: Amount, #[case] expected_bonus: Amount) {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());

        let handle = orchestrator.start_purchase(top_up(amount, None)).await.unwrap();

        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.metadata["type"], "cash_charge");
        assert_eq!(order.bonus_amount(), expected_bonus);
        assert_eq!(order.metadata["chargeAmount"], amount);
    }

    #[tokio::test]
    async fn test_matching_quoted_bonus_is_accepted() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());

        let handle = orchestrator.start_purchase(top_up(50_000, Some(5_000))).await.unwrap();
        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.bonus_amount(), 5_000);
    }

    #[rstest]
    #[case::inflated(Some(1_000_000_000))]
    #[case::overflowing(Some(Amount::MAX))]
    #[case::negative(Some(-5))]
    #[tokio::test]
    async fn test_quoted_bonus_other_than_tier_is_rejected(#[case] quoted_bonus: Option<Amount>) {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let request = top_up(1_000, quoted_bonus);
        let user = request.user_id;

        let err = orchestrator.start_purchase(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err:?}");
        assert!(store.list_user_orders(user, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_client_metadata_cannot_set_bonus() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let mut charge = top_up(1_000, None);
        charge.metadata.insert(METADATA_BONUS_AMOUNT.to_string(), json!(1_000_000_000));
        charge.metadata.insert("chargeAmount".to_string(), json!(1_000_000_000));

        let handle = orchestrator.start_purchase(charge).await.unwrap();
        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.bonus_amount(), 0);
        assert_eq!(order.metadata["chargeAmount"], 1_000);

        let mut purchase = request(Uuid::new_v4(), &[2_000], PaymentMethod::Card);
        purchase.metadata.insert(METADATA_BONUS_AMOUNT.to_string(), json!(1_000_000_000));
        let handle = orchestrator.start_purchase(purchase).await.unwrap();
        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert!(order.metadata.get(METADATA_BONUS_AMOUNT).is_none());
    }

    #[rstest]
    #[case::amount_over_max(top_up(1_000_001, None), "exceeds the maximum")]
    #[case::amount_at_i64_max(top_up(Amount::MAX, None), "exceeds the maximum")]
    #[case::item_over_max(PurchaseRequest { amount: 1_000, ..request(Uuid::nil(), &[1_000_001], PaymentMethod::Card) }, "cannot exceed")]
    #[tokio::test]
    async fn test_amounts_above_max_are_rejected(#[case] request: PurchaseRequest, #[case] reason: &str) {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());

        let err = orchestrator.start_purchase(request).await.unwrap_err();
        let Error::Validation { message } = &err else {
            panic!("expected a validation error, got {err:?}");
        };
        assert!(message.contains(reason), "{message}");
    }

    #[tokio::test]
    async fn test_item_sum_overflow_is_a_validation_error() {
        let store = InMemoryStore::new();
        let payment = PaymentConfig {
            max_amount: Amount::MAX,
            ..payment_config()
        };
        let orchestrator = orchestrator_with(&store, default_providers(), payment);
        let mut items = purchase_items(&[1, 1]);
        items[0].price = Amount::MAX;

        let err = orchestrator
            .start_purchase(PurchaseRequest {
                user_id: Uuid::new_v4(),
                items,
                amount: Amount::MAX,
                method: Some(PaymentMethod::Card),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_account_store_failure_still_returns_deposit_details() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());

        store.fail_next(Fault::SetAccountInfo);
        let handle = orchestrator
            .start_purchase(PurchaseRequest {
                depositor_name: Some("Hong Gildong".to_string()),
                ..request(Uuid::new_v4(), &[12_000], PaymentMethod::ManualBankTransfer)
            })
            .await
            .unwrap();

        assert_eq!(handle.payment_status, PaymentStatus::AwaitingDeposit);
        assert!(matches!(handle.next_action, NextAction::Deposit { .. }));
        let logs = store.list_transaction_logs(handle.order_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, PaymentStatus::AwaitingDeposit);
    }

    #[tokio::test]
    async fn test_manual_transfer_awaits_deposit_with_account() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());

        let handle = orchestrator
            .start_purchase(PurchaseRequest {
                depositor_name: Some("  Hong Gildong ".to_string()),
                ..request(Uuid::new_v4(), &[12_000], PaymentMethod::ManualBankTransfer)
            })
            .await
            .unwrap();

        assert_eq!(handle.payment_status, PaymentStatus::AwaitingDeposit);
        let NextAction::Deposit { account } = &handle.next_action else {
            panic!("expected deposit instructions");
        };
        assert_eq!(account.account_number, "123-45-6789");
        assert_eq!(account.expected_depositor.as_deref(), Some("Hong Gildong"));

        let order = store.get_order(handle.order_id).await.unwrap().unwrap();
        assert_eq!(order.depositor_name.as_deref(), Some("Hong Gildong"));
        assert!(order.virtual_account_info.is_some());
        let logs = store.list_transaction_logs(order.id).await.unwrap();
        assert_eq!(logs[0].status, PaymentStatus::AwaitingDeposit);
    }

    #[tokio::test]
    async fn test_ledger_purchase_completes_immediately() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let user = Uuid::new_v4();
        charge_credits(&store, user, 20_000).await;

        let handle = orchestrator
            .start_purchase(request(user, &[7_000], PaymentMethod::Ledger))
            .await
            .unwrap();

        assert_eq!(handle.payment_status, PaymentStatus::Paid);
        assert_eq!(handle.status, OrderStatus::Completed);
        assert_eq!(handle.next_action, NextAction::Completed { new_balance: 13_000 });
        assert_eq!(store.list_entitlements(user).await.unwrap().len(), 1);
    }

    #[rstest]
    #[case::negative_amount(PurchaseRequest { amount: -1, method: Some(PaymentMethod::Card), ..Default::default() })]
    #[case::zero_top_up(PurchaseRequest { amount: 0, method: Some(PaymentMethod::Card), ..Default::default() })]
    #[case::ledger_top_up(PurchaseRequest { amount: 1_000, method: Some(PaymentMethod::Ledger), ..Default::default() })]
    #[case::missing_method(PurchaseRequest { amount: 1_000, ..Default::default() })]
    #[case::item_sum_mismatch(PurchaseRequest { amount: 999, ..request(Uuid::nil(), &[500, 500], PaymentMethod::Card) })]
    #[case::negative_item(PurchaseRequest { amount: 0, ..request(Uuid::nil(), &[500, -500], PaymentMethod::Card) })]
    #[case::bonus_on_products(PurchaseRequest { quoted_bonus: Some(10), ..request(Uuid::nil(), &[500], PaymentMethod::Card) })]
    #[case::free_external(request(Uuid::nil(), &[0], PaymentMethod::Card))]
    #[case::missing_depositor(request(Uuid::nil(), &[500], PaymentMethod::ManualBankTransfer))]
    #[tokio::test]
    async fn test_invalid_requests_write_nothing(#[case] request: PurchaseRequest) {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let user = request.user_id;

        let err = orchestrator.start_purchase(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err:?}");
        assert!(store.list_user_orders(user, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_products_are_rejected() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let mut request = request(Uuid::new_v4(), &[500, 500], PaymentMethod::Card);
        request.items[1].product_id = request.items[0].product_id;

        let err = orchestrator.start_purchase(request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_unconfigured_rail_is_a_validation_error() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, ProviderRegistry::default());

        let err = orchestrator
            .start_purchase(request(Uuid::new_v4(), &[500], PaymentMethod::Card))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_provider_failure_marks_order_failed() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, ProviderRegistry::default().with_provider(Arc::new(UnreachableGateway)));
        let user = Uuid::new_v4();

        let err = orchestrator
            .start_purchase(request(user, &[8_000], PaymentMethod::Card))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));

        let orders = store.list_user_orders(user, 0, 10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].payment_status, PaymentStatus::Failed);
        assert_eq!(orders[0].status, OrderStatus::Failed);
        let logs = store.list_transaction_logs(orders[0].id).await.unwrap();
        assert_eq!(logs[0].status, PaymentStatus::Failed);
        assert!(logs[0].error_message.as_deref().unwrap().contains("gateway unavailable"));
    }

    #[tokio::test]
    async fn test_item_insert_failure_removes_order() {
        let store = InMemoryStore::new();
        let orchestrator = orchestrator(&store, default_providers());
        let user = Uuid::new_v4();

        store.fail_next(Fault::InsertOrderItems);
        orchestrator
            .start_purchase(request(user, &[8_000], PaymentMethod::Card))
            .await
            .unwrap_err();
        assert!(store.list_user_orders(user, 0, 10).await.unwrap().is_empty());
    }
}
