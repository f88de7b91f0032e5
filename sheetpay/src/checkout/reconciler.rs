//! Settlement: the one place an order becomes paid.
//!
//! Every confirmation path (the buyer's return redirect, provider webhooks, an operator
//! confirming a bank transfer, the outbox worker) funnels into
//! [`SettlementReconciler::complete_order`]. Settlement effects are idempotent:
//!
//! - top-ups credit the ledger once per order (`(order_id, charge)` is unique)
//! - entitlements are granted once per `(order_id, product_id)`
//! - [`Store::finalize_order`] lets exactly one caller flip the order to paid
//!
//! The effects are recorded as a `settlement` outbox task before they run, so a crash
//! between crediting and finalizing is finished by the worker instead of lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::{
    checkout::{awaiter::DetailNotifier, fail_unpaid_order, ledger::CreditLedger, mark_transaction},
    db::{
        models::{
            entitlements::EntitlementCreateDBRequest,
            orders::{Order, OrderFinalization, PaymentStatus, PurchaseKind, VirtualAccountInfo},
            outbox::{OutboxTask, OutboxTaskCreateDBRequest, OutboxTaskFailure, OutboxTaskKind},
            payment_transactions::PaymentTransactionStatusUpdate,
        },
        store::Store,
    },
    errors::{Error, Result},
    payment_providers::{Approval, ApprovalRequest, PaymentError, ProviderKind, ProviderRegistry, WebhookEvent, WebhookEventType},
    types::{Amount, OrderId, UserId, abbrev_uuid},
};

/// Which path confirmed the payment. Stored as `completedBy` in the order metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SettlementTrigger {
    Return,
    Webhook,
    Admin,
    /// Follow-up of a ledger purchase whose entitlements could not be granted inline
    Ledger,
}

impl SettlementTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementTrigger::Return => "return",
            SettlementTrigger::Webhook => "webhook",
            SettlementTrigger::Admin => "admin",
            SettlementTrigger::Ledger => "ledger",
        }
    }
}

/// Evidence that an order was paid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, bon::Builder)]
pub struct Confirmation {
    pub trigger: SettlementTrigger,
    pub provider_transaction_id: Option<String>,
    /// Compared against the order total when present
    pub approved_amount: Option<Amount>,
    pub raw_response: Option<Value>,
    /// Operator who confirmed a manual transfer
    pub confirmed_by: Option<UserId>,
    pub depositor_name: Option<String>,
    pub note: Option<String>,
}

/// Payload of a `settlement` outbox task. Fields that end up on the order are frozen here
/// so a retried settlement writes the same values as the first attempt would have.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementTask {
    pub confirmation: Confirmation,
    pub transaction_id: String,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "order", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// This call settled the order
    Settled(Order),
    /// Someone else got there first; nothing was applied twice
    AlreadySettled(Order),
}

impl SettlementOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SettlementOutcome::Settled(order) | SettlementOutcome::AlreadySettled(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            SettlementOutcome::Settled(order) | SettlementOutcome::AlreadySettled(order) => order,
        }
    }
}

/// Result of the buyer returning from a provider page.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnOutcome {
    Settled(SettlementOutcome),
    /// A virtual account was issued; the deposit will be reported by webhook
    AwaitingDeposit(Order),
}

impl ReturnOutcome {
    pub fn order(&self) -> &Order {
        match self {
            ReturnOutcome::Settled(outcome) => outcome.order(),
            ReturnOutcome::AwaitingDeposit(order) => order,
        }
    }
}

/// What a webhook delivery did.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookDisposition {
    Settled(SettlementOutcome),
    Failed,
    AccountRecorded,
    Ignored,
}

struct DriveReport {
    outcome: SettlementOutcome,
    entitlements_pending: bool,
}

fn fallback_transaction_id(now: DateTime<Utc>) -> String {
    format!("manual-{}", now.timestamp_millis())
}

#[derive(Clone)]
pub struct SettlementReconciler {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    providers: ProviderRegistry,
    notifier: DetailNotifier,
    amount_tolerance_bps: u32,
    retry_after: Duration,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: CreditLedger,
        providers: ProviderRegistry,
        notifier: DetailNotifier,
        amount_tolerance_bps: u32,
        retry_after: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            providers,
            notifier,
            amount_tolerance_bps,
            retry_after,
        }
    }

    fn retry_at(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.retry_after).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn verify_amount(&self, order: &Order, approved: Option<Amount>) -> Result<()> {
        let Some(approved) = approved else {
            return Ok(());
        };
        // Provider amounts are untrusted; compare in i128
        let tolerance = i128::from(order.total_amount).abs() * i128::from(self.amount_tolerance_bps) / 10_000;
        if (i128::from(approved) - i128::from(order.total_amount)).abs() > tolerance {
            warn!(
                order_id = %abbrev_uuid(&order.id),
                expected = order.total_amount,
                approved,
                tolerance,
                "Approved amount outside tolerance, refusing to settle"
            );
            return Err(Error::validation(format!(
                "Approved amount {approved} does not match order total {}",
                order.total_amount
            )));
        }
        Ok(())
    }

    /// Settle an order. Safe to call any number of times from any path; the effects are
    /// applied at most once.
    #[instrument(skip(self, confirmation), fields(order_id = %abbrev_uuid(&order_id), trigger = confirmation.trigger.as_str()), err)]
    pub async fn complete_order(&self, order_id: OrderId, confirmation: Confirmation) -> Result<SettlementOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| Error::order_not_found(order_id))?;

        if order.is_settled() {
            debug!("Order already settled, skipping");
            return Ok(SettlementOutcome::AlreadySettled(order));
        }
        if matches!(order.payment_status, PaymentStatus::Failed | PaymentStatus::Cancelled) {
            // Money moved after we gave up on the order; honour the payment
            warn!(
                payment_status = order.payment_status.as_str(),
                "Settling an order that was already closed"
            );
        }

        self.verify_amount(&order, confirmation.approved_amount)?;

        let now = Utc::now();
        let task = SettlementTask {
            transaction_id: confirmation
                .provider_transaction_id
                .clone()
                .unwrap_or_else(|| fallback_transaction_id(now)),
            confirmed_at: now,
            confirmation,
        };
        let payload = serde_json::to_value(&task).map_err(anyhow::Error::from)?;
        let queued = self
            .store
            .enqueue_task(&OutboxTaskCreateDBRequest {
                kind: OutboxTaskKind::Settlement,
                order_id,
                payload,
                run_after: self.retry_at(),
            })
            .await?;

        let report = match self.drive(&order, &task, task.confirmation.trigger.as_str()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(task_id = %queued.id, error = %e, "Settlement interrupted, outbox will resume it");
                return Err(e);
            }
        };

        self.close_task(&queued, &report).await;
        Ok(report.outcome)
    }

    async fn close_task(&self, task: &OutboxTask, report: &DriveReport) {
        let closed = if report.entitlements_pending {
            self.store
                .fail_task(
                    task.id,
                    "entitlement grant failed",
                    &OutboxTaskFailure::Retry {
                        next_attempt_at: self.retry_at(),
                    },
                )
                .await
        } else {
            self.store.complete_task(task.id).await
        };
        if let Err(e) = closed {
            // The worker re-runs the task; every effect is idempotent
            warn!(task_id = %task.id, error = %e, "Failed to close settlement task");
        }
    }

    /// Apply settlement effects for `order` and finalize it.
    async fn drive(&self, order: &Order, task: &SettlementTask, completed_by: &str) -> Result<DriveReport> {
        let items = self.store.get_order_items(order.id).await?;
        let mut entitlements_pending = false;

        match order.purchase_kind(items.len()) {
            Some(PurchaseKind::CashCharge) => {
                self.ledger.credit_top_up(order).await?;
            }
            Some(PurchaseKind::SheetPurchase) => {
                let grants: Vec<_> = items
                    .iter()
                    .map(|item| EntitlementCreateDBRequest {
                        user_id: order.user_id,
                        order_id: order.id,
                        product_id: item.product_id,
                        price_paid: item.price,
                    })
                    .collect();
                match self.store.grant_entitlements(&grants).await {
                    Ok(granted) => debug!(granted, "Entitlements granted"),
                    Err(e) => {
                        warn!(order_id = %abbrev_uuid(&order.id), error = %e, "Entitlement grant failed, will retry");
                        entitlements_pending = true;
                    }
                }
            }
            None => {
                warn!(order_id = %abbrev_uuid(&order.id), "Order has no items and no top-up marker, settling without effects");
            }
        }

        let confirmation = &task.confirmation;
        let mut metadata = Map::new();
        metadata.insert("completedBy".to_string(), json!(completed_by));
        metadata.insert("completedAt".to_string(), json!(task.confirmed_at.to_rfc3339()));
        if let Some(operator) = confirmation.confirmed_by {
            metadata.insert("confirmedBy".to_string(), json!(operator));
        }
        if let Some(note) = &confirmation.note {
            metadata.insert("confirmationNote".to_string(), json!(note));
        }

        let finalization = OrderFinalization {
            transaction_id: task.transaction_id.clone(),
            confirmed_at: task.confirmed_at,
            metadata,
            depositor_name: confirmation.depositor_name.clone(),
        };

        let outcome = match self.store.finalize_order(order.id, &finalization).await? {
            Some(settled) => {
                info!(
                    order_id = %abbrev_uuid(&settled.id),
                    order_number = %settled.order_number,
                    amount = settled.total_amount,
                    completed_by,
                    "Order settled"
                );
                mark_transaction(
                    self.store.as_ref(),
                    settled.id,
                    &PaymentTransactionStatusUpdate {
                        status: PaymentStatus::Paid,
                        provider_transaction_id: Some(task.transaction_id.clone()),
                        raw_response: confirmation.raw_response.clone(),
                    },
                )
                .await;
                SettlementOutcome::Settled(settled)
            }
            None => {
                debug!(order_id = %abbrev_uuid(&order.id), "Lost the settlement race");
                let current = self
                    .store
                    .get_order(order.id)
                    .await?
                    .ok_or_else(|| Error::order_not_found(order.id))?;
                SettlementOutcome::AlreadySettled(current)
            }
        };

        Ok(DriveReport {
            outcome,
            entitlements_pending,
        })
    }

    /// Re-run a queued settlement. Returns whether the task is done.
    pub async fn resume(&self, task: &OutboxTask) -> Result<bool> {
        let payload: SettlementTask = serde_json::from_value(task.payload.clone()).map_err(|e| Error::Internal {
            operation: format!("decode settlement task {}: {e}", task.id),
        })?;
        let order = self
            .store
            .get_order(task.order_id)
            .await?
            .ok_or_else(|| Error::order_not_found(task.order_id))?;

        if order.payment_status == PaymentStatus::Refunded {
            info!(order_id = %abbrev_uuid(&order.id), "Order was refunded, dropping settlement task");
            return Ok(true);
        }

        let report = self.drive(&order, &payload, "outbox").await?;
        Ok(!report.entitlements_pending)
    }

    /// Handle the buyer coming back from a provider page.
    #[instrument(skip(self, raw), fields(order_id = %abbrev_uuid(&order_id), provider = kind.as_str()), err)]
    pub async fn confirm_return(&self, kind: ProviderKind, order_id: OrderId, raw: &Map<String, Value>) -> Result<ReturnOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| Error::order_not_found(order_id))?;
        if order.is_settled() {
            // Reloaded return page
            return Ok(ReturnOutcome::Settled(SettlementOutcome::AlreadySettled(order)));
        }

        let provider = self
            .providers
            .get(kind)
            .ok_or_else(|| Error::validation(format!("Payment provider {kind} is not enabled")))?;

        let approval = provider
            .approve(&ApprovalRequest {
                order: &order,
                raw_confirmation: raw,
            })
            .await;

        match approval {
            Ok(Approval::Captured(capture)) => {
                let confirmation = Confirmation::builder()
                    .trigger(SettlementTrigger::Return)
                    .provider_transaction_id(capture.provider_transaction_id)
                    .approved_amount(capture.approved_amount)
                    .raw_response(capture.raw_response)
                    .build();
                Ok(ReturnOutcome::Settled(self.complete_order(order.id, confirmation).await?))
            }
            Ok(Approval::DepositPending {
                account,
                provider_transaction_id,
                raw_response,
            }) => {
                let order = match account {
                    Some(account) => self.record_account(order.id, &account).await?.unwrap_or(order),
                    None => order,
                };
                mark_transaction(
                    self.store.as_ref(),
                    order.id,
                    &PaymentTransactionStatusUpdate {
                        status: PaymentStatus::AwaitingDeposit,
                        provider_transaction_id,
                        raw_response: Some(raw_response),
                    },
                )
                .await;
                Ok(ReturnOutcome::AwaitingDeposit(order))
            }
            Err(e) => {
                if matches!(e, PaymentError::NotApproved(_) | PaymentError::ProviderApi(_) | PaymentError::Http(_)) {
                    fail_unpaid_order(self.store.as_ref(), order.id, &e.to_string()).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Apply a validated webhook delivery.
    #[instrument(skip(self, event), fields(order_id = %abbrev_uuid(&event.order_id), event = ?event.event_type), err)]
    pub async fn apply_webhook(&self, event: WebhookEvent) -> Result<WebhookDisposition> {
        match event.event_type {
            WebhookEventType::PaymentPaid => {
                let confirmation = Confirmation::builder()
                    .trigger(SettlementTrigger::Webhook)
                    .maybe_provider_transaction_id(event.provider_transaction_id)
                    .maybe_approved_amount(event.approved_amount)
                    .raw_response(event.raw)
                    .build();
                match self.complete_order(event.order_id, confirmation).await {
                    Ok(outcome) => Ok(WebhookDisposition::Settled(outcome)),
                    Err(Error::NotFound { .. }) => {
                        warn!("Webhook for unknown order, acknowledging");
                        Ok(WebhookDisposition::Ignored)
                    }
                    Err(e) => Err(e),
                }
            }
            WebhookEventType::PaymentFailed => {
                let reason = event.reason.unwrap_or_else(|| "payment failed at provider".to_string());
                match fail_unpaid_order(self.store.as_ref(), event.order_id, &reason).await? {
                    Some(_) => Ok(WebhookDisposition::Failed),
                    None => {
                        debug!("Failure event for an order that is not awaiting payment");
                        Ok(WebhookDisposition::Ignored)
                    }
                }
            }
            WebhookEventType::VirtualAccountIssued => {
                let Some(account) = event.account else {
                    return Err(Error::validation("Account issued event without account details"));
                };
                match self.record_account(event.order_id, &account).await? {
                    Some(_) => Ok(WebhookDisposition::AccountRecorded),
                    None => {
                        warn!("Account details for unknown order, acknowledging");
                        Ok(WebhookDisposition::Ignored)
                    }
                }
            }
            WebhookEventType::Other(kind) => {
                debug!(kind, "Ignoring webhook event");
                Ok(WebhookDisposition::Ignored)
            }
        }
    }

    /// Store provider-issued account details and wake anyone waiting on them.
    pub async fn record_account(&self, order_id: OrderId, account: &VirtualAccountInfo) -> Result<Option<Order>> {
        let order = self.store.set_order_account_info(order_id, account).await?;
        if let Some(stored) = order.as_ref().and_then(|order| order.virtual_account_info.clone()) {
            self.notifier.publish(order_id, stored);
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::credits::CreditEntryKind;
    use crate::db::models::orders::{OrderStatus, PaymentMethod};
    use crate::db::store::in_memory::{Fault, InMemoryStore};
    use crate::payment_providers::dummy::DummyProvider;
    use crate::test_utils::{insert_pending_order, insert_top_up_order};
    use rstest::rstest;
    use uuid::Uuid;

    fn reconciler(store: &InMemoryStore) -> SettlementReconciler {
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let ledger = CreditLedger::new(shared.clone(), Duration::from_secs(30));
        let providers = ProviderRegistry::default().with_provider(Arc::new(DummyProvider));
        SettlementReconciler::new(shared, ledger, providers, DetailNotifier::default(), 100, Duration::from_secs(30))
    }

    fn webhook_confirmation(txn: &str, amount: Option<Amount>) -> Confirmation {
        Confirmation::builder()
            .trigger(SettlementTrigger::Webhook)
            .provider_transaction_id(txn.to_string())
            .maybe_approved_amount(amount)
            .build()
    }

    async fn pending_tasks(store: &InMemoryStore) -> Vec<OutboxTask> {
        store
            .claim_due_tasks(Utc::now() + chrono::Duration::days(1), chrono::Duration::seconds(60), 100)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sheet_purchase_settles_with_entitlements() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[4_000, 6_000]).await;

        let outcome = reconciler
            .complete_order(order.id, webhook_confirmation("tid-1", Some(10_000)))
            .await
            .unwrap();

        let SettlementOutcome::Settled(settled) = outcome else {
            panic!("expected this call to settle");
        };
        assert_eq!(settled.payment_status, PaymentStatus::Paid);
        assert_eq!(settled.status, OrderStatus::Completed);
        assert_eq!(settled.transaction_id.as_deref(), Some("tid-1"));
        assert_eq!(settled.metadata["completedBy"], "webhook");
        assert_eq!(settled.metadata["type"], "sheet_purchase");
        assert_eq!(store.list_entitlements(user).await.unwrap().len(), 2);
        assert!(pending_tasks(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_confirmations_apply_effects_once() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 10_000, 1_000).await;

        let (first, second) = tokio::join!(
            reconciler.complete_order(order.id, webhook_confirmation("tid-1", Some(10_000))),
            reconciler.complete_order(
                order.id,
                Confirmation::builder()
                    .trigger(SettlementTrigger::Return)
                    .provider_transaction_id("tid-1".to_string())
                    .build()
            )
        );
        let outcomes = [first.unwrap(), second.unwrap()];
        let settled = outcomes.iter().filter(|o| matches!(o, SettlementOutcome::Settled(_))).count();
        assert_eq!(settled, 1);

        // Third, late delivery
        let again = reconciler
            .complete_order(order.id, webhook_confirmation("tid-1", None))
            .await
            .unwrap();
        assert!(matches!(again, SettlementOutcome::AlreadySettled(_)));

        assert_eq!(store.get_balance(user).await.unwrap(), 11_000);
        let charges = store
            .list_credit_entries(user, 0, 10)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == CreditEntryKind::Charge)
            .count();
        assert_eq!(charges, 1);
    }

    #[tokio::test]
    async fn test_amount_outside_tolerance_is_rejected_without_effects() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 10_000, 0).await;

        // 1% of 10_000 is tolerated
        let err = reconciler
            .complete_order(order.id, webhook_confirmation("tid-1", Some(9_000)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.get_balance(user).await.unwrap(), 0);
        assert!(pending_tasks(&store).await.is_empty());

        let outcome = reconciler
            .complete_order(order.id, webhook_confirmation("tid-1", Some(9_950)))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Settled(_)));
    }

    #[rstest]
    #[case::approved_max(10_000, Amount::MAX)]
    #[case::approved_min(10_000, Amount::MIN)]
    #[case::total_max_approved_min(Amount::MAX, Amount::MIN)]
    #[case::total_max_approved_negative(Amount::MAX, -1)]
    #[tokio::test]
    async fn test_extreme_approved_amounts_are_rejected(#[case] total: Amount, #[case] approved: Amount) {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, total, 0).await;

        let err = reconciler
            .complete_order(order.id, webhook_confirmation("tid-1", Some(approved)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err:?}");
        assert_eq!(store.get_balance(user).await.unwrap(), 0);
        let current = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_crash_before_finalize_is_resumed_from_outbox() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 5_000, 500).await;

        store.fail_next(Fault::FinalizeOrder);
        reconciler
            .complete_order(order.id, webhook_confirmation("tid-9", Some(5_000)))
            .await
            .unwrap_err();

        // Credits landed, order not yet paid
        assert_eq!(store.get_balance(user).await.unwrap(), 5_500);
        let current = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Pending);

        let tasks = pending_tasks(&store).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].kind, OutboxTaskKind::Settlement);
        assert!(reconciler.resume(&tasks[0]).await.unwrap());

        let settled = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(settled.payment_status, PaymentStatus::Paid);
        assert_eq!(settled.transaction_id.as_deref(), Some("tid-9"));
        // The charge was not applied twice
        assert_eq!(store.get_balance(user).await.unwrap(), 5_500);
    }

    #[tokio::test]
    async fn test_entitlement_failure_keeps_task_for_retry() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[3_000]).await;

        store.fail_next(Fault::GrantEntitlements);
        let outcome = reconciler
            .complete_order(order.id, webhook_confirmation("tid-2", Some(3_000)))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Settled(_)));
        assert!(store.list_entitlements(user).await.unwrap().is_empty());

        let tasks = pending_tasks(&store).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].last_error.as_deref(), Some("entitlement grant failed"));
        assert!(reconciler.resume(&tasks[0]).await.unwrap());
        assert_eq!(store.list_entitlements(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_late_confirmation_settles_failed_order() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[2_000]).await;
        fail_unpaid_order(&store, order.id, "timeout").await.unwrap();

        let outcome = reconciler
            .complete_order(order.id, webhook_confirmation("tid-3", Some(2_000)))
            .await
            .unwrap();
        assert_eq!(outcome.order().payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_refunded_order_is_not_resettled_by_outbox() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[2_000]).await;

        store.fail_next(Fault::FinalizeOrder);
        reconciler
            .complete_order(order.id, webhook_confirmation("tid-4", None))
            .await
            .unwrap_err();
        store
            .transition_order(order.id, &[PaymentStatus::Pending], OrderStatus::Cancelled, PaymentStatus::Refunded)
            .await
            .unwrap();

        let tasks = pending_tasks(&store).await;
        assert!(reconciler.resume(&tasks[0]).await.unwrap());
        let current = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_dummy_return_settles_and_reload_is_harmless() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[1_500]).await;

        let mut raw = Map::new();
        raw.insert("session_id".to_string(), json!(format!("dummy_session_{}_x", order.id)));

        let outcome = reconciler.confirm_return(ProviderKind::Dummy, order.id, &raw).await.unwrap();
        assert!(matches!(outcome, ReturnOutcome::Settled(SettlementOutcome::Settled(_))));
        assert_eq!(outcome.order().metadata["completedBy"], "return");

        let reload = reconciler.confirm_return(ProviderKind::Dummy, order.id, &raw).await.unwrap();
        assert!(matches!(reload, ReturnOutcome::Settled(SettlementOutcome::AlreadySettled(_))));
    }

    #[tokio::test]
    async fn test_payment_failed_webhook_does_not_touch_paid_order() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::Card, &[1_000]).await;
        reconciler
            .complete_order(order.id, webhook_confirmation("tid-5", None))
            .await
            .unwrap();

        let disposition = reconciler
            .apply_webhook(WebhookEvent {
                event_type: WebhookEventType::PaymentFailed,
                order_id: order.id,
                provider_transaction_id: None,
                approved_amount: None,
                account: None,
                reason: Some("late failure".to_string()),
                raw: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Ignored);
        let current = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(current.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_account_issued_webhook_records_details() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let user = Uuid::new_v4();
        let order = insert_pending_order(&store, user, PaymentMethod::VirtualAccount, &[1_000]).await;
        let mut rx = reconciler.notifier.subscribe(order.id);

        let account = VirtualAccountInfo {
            bank_name: "Woori".to_string(),
            account_number: "1002-000-1111".to_string(),
            account_holder: "Sheet Shop".to_string(),
            expected_depositor: None,
            amount: Some(1_000),
            expires_at: None,
            issued_at: None,
        };
        let disposition = reconciler
            .apply_webhook(WebhookEvent {
                event_type: WebhookEventType::VirtualAccountIssued,
                order_id: order.id,
                provider_transaction_id: None,
                approved_amount: None,
                account: Some(account.clone()),
                reason: None,
                raw: json!({}),
            })
            .await
            .unwrap();

        assert_eq!(disposition, WebhookDisposition::AccountRecorded);
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        let stored_account = stored.virtual_account_info.unwrap();
        assert!(stored_account.issued_at.is_some());
        assert_eq!(VirtualAccountInfo { issued_at: None, ..stored_account.clone() }, account);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().clone(), Some(stored_account));
    }

    #[tokio::test]
    async fn test_unknown_order_webhook_is_acknowledged() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let disposition = reconciler
            .apply_webhook(WebhookEvent {
                event_type: WebhookEventType::PaymentPaid,
                order_id: Uuid::new_v4(),
                provider_transaction_id: Some("tid".to_string()),
                approved_amount: None,
                account: None,
                reason: None,
                raw: json!({}),
            })
            .await
            .unwrap();
        assert_eq!(disposition, WebhookDisposition::Ignored);
    }
}
