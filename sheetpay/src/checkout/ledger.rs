//! Internal credit ledger.
//!
//! The balance on the profile row is a projection of the append-only ledger. It only ever
//! moves through [`Store::apply_credit_entry`], which writes the entry and the balance in one
//! statement, so replaying a user's entries from zero always reproduces the stored balance.
//!
//! A ledger purchase is a saga over single-statement writes:
//!
//! 1. debit (`use` entry); on insufficient balance stop with no side effects
//! 2. insert the paid order, then its items
//! 3. on failure in step 2: queue a `ledger_rollback` task, then compensate inline
//!    (`reversal` entry, delete items, delete order) and complete the task
//!
//! Compensation is idempotent, so the outbox worker can finish whatever the inline
//! attempt could not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    checkout::{
        ROLLBACK_TARGET, insert_order_with_fresh_number, order_number::generate_order_number, record_transaction,
        reconciler::{Confirmation, SettlementTask, SettlementTrigger},
    },
    db::{
        models::{
            credits::{CreditApplyOutcome, CreditEntryCreateDBRequest, CreditEntryKind, CreditLedgerEntry},
            entitlements::EntitlementCreateDBRequest,
            orders::{Order, OrderCreateDBRequest, OrderItem, OrderItemCreateDBRequest, OrderStatus, PaymentMethod, PaymentStatus},
            outbox::{OutboxTask, OutboxTaskCreateDBRequest, OutboxTaskKind},
            payment_transactions::PaymentTransactionCreateDBRequest,
        },
        store::Store,
    },
    errors::{Error, Result},
    types::{Amount, OrderId, UserId, abbrev_uuid},
};

/// A purchase paid from the credit balance.
#[derive(Debug, Clone)]
pub struct LedgerPurchase {
    pub user_id: UserId,
    pub total: Amount,
    pub items: Vec<OrderItemCreateDBRequest>,
    /// Order metadata, already carrying the purchase type
    pub metadata: Map<String, Value>,
    pub description: Option<String>,
}

/// Result of a successful ledger purchase.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerReceipt {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub new_balance: Amount,
}

/// Payload of a `ledger_rollback` outbox task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPayload {
    pub user_id: UserId,
    /// Amount that was debited and must be given back
    pub amount: Amount,
}

/// Replay of a user's ledger against the stored balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub entry_count: usize,
    pub replayed_balance: Amount,
    pub stored_balance: Amount,
    pub consistent: bool,
    /// First entry whose `balance_after` disagrees with the running replay
    pub first_broken_entry: Option<i64>,
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
    /// Delay before the outbox worker may pick up a task queued by this service
    retry_after: Duration,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Store>, retry_after: Duration) -> Self {
        Self { store, retry_after }
    }

    fn run_after(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.retry_after).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Amount> {
        Ok(self.store.get_balance(user_id).await?)
    }

    pub async fn entries(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditLedgerEntry>> {
        Ok(self.store.list_credit_entries(user_id, skip, limit).await?)
    }

    /// Debit the balance and write a paid order in one synchronous call.
    ///
    /// Returns [`Error::InsufficientCredit`] without writing anything when the balance does
    /// not cover `total`. When writing the order fails after the debit, the debit is
    /// compensated and the original error is returned.
    #[instrument(skip(self, purchase), fields(user_id = %abbrev_uuid(&purchase.user_id), total = purchase.total), err)]
    pub async fn purchase_with_ledger(&self, purchase: LedgerPurchase) -> Result<LedgerReceipt> {
        if purchase.total < 0 {
            return Err(Error::validation("Amount must not be negative"));
        }
        let order_id = Uuid::new_v4();

        let debit = if purchase.total > 0 {
            let request = CreditEntryCreateDBRequest::spend(purchase.user_id, order_id, purchase.total, purchase.description.clone());
            match self.store.apply_credit_entry(&request).await? {
                CreditApplyOutcome::Applied(entry) => Some(entry),
                CreditApplyOutcome::Insufficient { current_balance } => {
                    info!(current_balance, "Insufficient credit for ledger purchase");
                    return Err(Error::InsufficientCredit {
                        current_balance,
                        required: purchase.total,
                    });
                }
                CreditApplyOutcome::Duplicate(_) => {
                    return Err(Error::Internal {
                        operation: format!("debit credits for new order {order_id}: entry already exists"),
                    });
                }
            }
        } else {
            None
        };

        let (order, items) = match self.write_paid_order(order_id, &purchase, debit.as_ref()).await {
            Ok(written) => written,
            Err(err) => {
                warn!(order_id = %abbrev_uuid(&order_id), error = %err, "Ledger purchase failed after debit, compensating");
                self.roll_back_purchase(order_id, purchase.user_id, purchase.total).await;
                return Err(err);
            }
        };

        self.grant_or_defer(&order, &items).await;

        record_transaction(
            self.store.as_ref(),
            &PaymentTransactionCreateDBRequest {
                order_id: order.id,
                user_id: order.user_id,
                method: PaymentMethod::Ledger,
                provider: "ledger".to_string(),
                amount: order.total_amount,
                status: PaymentStatus::Paid,
                provider_transaction_id: order.transaction_id.clone(),
                raw_request: Some(json!({ "item_count": items.len(), "total": order.total_amount })),
                raw_response: debit.as_ref().map(|entry| json!({ "ledger_entry_id": entry.id, "balance_after": entry.balance_after })),
                error_message: None,
            },
        )
        .await;

        let new_balance = match &debit {
            Some(entry) => entry.balance_after,
            None => self.store.get_balance(purchase.user_id).await?,
        };

        info!(
            order_id = %abbrev_uuid(&order.id),
            new_balance,
            "Ledger purchase completed"
        );

        Ok(LedgerReceipt { order, items, new_balance })
    }

    async fn write_paid_order(
        &self,
        order_id: OrderId,
        purchase: &LedgerPurchase,
        debit: Option<&CreditLedgerEntry>,
    ) -> Result<(Order, Vec<OrderItem>)> {
        let now = Utc::now();
        let order = insert_order_with_fresh_number(
            self.store.as_ref(),
            OrderCreateDBRequest {
                id: order_id,
                order_number: generate_order_number(now),
                user_id: purchase.user_id,
                total_amount: purchase.total,
                status: OrderStatus::Completed,
                payment_status: PaymentStatus::Paid,
                payment_method: PaymentMethod::Ledger,
                metadata: purchase.metadata.clone(),
                transaction_id: debit.map(|entry| format!("ledger-{}", entry.id)),
                depositor_name: None,
                payment_confirmed_at: Some(now),
            },
        )
        .await?;

        let items = if purchase.items.is_empty() {
            Vec::new()
        } else {
            self.store.insert_order_items(order_id, &purchase.items).await?
        };
        Ok((order, items))
    }

    /// Entitlements for a paid ledger order. A failed grant is handed to the outbox as a
    /// settlement task so it is retried instead of dropped.
    async fn grant_or_defer(&self, order: &Order, items: &[OrderItem]) {
        if items.is_empty() {
            return;
        }
        let grants: Vec<_> = items
            .iter()
            .map(|item| EntitlementCreateDBRequest {
                user_id: order.user_id,
                order_id: order.id,
                product_id: item.product_id,
                price_paid: item.price,
            })
            .collect();
        let Err(e) = self.store.grant_entitlements(&grants).await else {
            return;
        };

        warn!(order_id = %abbrev_uuid(&order.id), error = %e, "Entitlement grant failed, deferring to outbox");
        let task = SettlementTask {
            confirmation: Confirmation::builder()
                .trigger(SettlementTrigger::Ledger)
                .maybe_provider_transaction_id(order.transaction_id.clone())
                .build(),
            transaction_id: order
                .transaction_id
                .clone()
                .unwrap_or_else(|| format!("ledger-{}", order.id)),
            confirmed_at: order.payment_confirmed_at.unwrap_or_else(Utc::now),
        };
        let enqueued = match serde_json::to_value(&task) {
            Ok(payload) => self
                .store
                .enqueue_task(&OutboxTaskCreateDBRequest {
                    kind: OutboxTaskKind::Settlement,
                    order_id: order.id,
                    payload,
                    run_after: self.run_after(),
                })
                .await
                .map(|_| ())
                .map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = enqueued {
            error!(
                order_id = %abbrev_uuid(&order.id),
                error = %e,
                "Failed to queue entitlement retry; entitlements must be granted by hand"
            );
        }
    }

    /// Queue the compensation durably, then try it inline.
    ///
    /// Never fails: an unfinished compensation is logged under [`ROLLBACK_TARGET`] and left to
    /// the outbox worker.
    async fn roll_back_purchase(&self, order_id: OrderId, user_id: UserId, amount: Amount) {
        let payload = RollbackPayload { user_id, amount };
        let task = match self
            .store
            .enqueue_task(&OutboxTaskCreateDBRequest {
                kind: OutboxTaskKind::LedgerRollback,
                order_id,
                payload: json!(payload),
                run_after: self.run_after(),
            })
            .await
        {
            Ok(task) => Some(task),
            Err(e) => {
                error!(
                    target: ROLLBACK_TARGET,
                    order_id = %order_id,
                    user_id = %user_id,
                    amount,
                    error = %e,
                    "Failed to queue ledger rollback"
                );
                None
            }
        };

        match self.compensate(order_id, &payload).await {
            Ok(()) => {
                info!(order_id = %abbrev_uuid(&order_id), amount, "Ledger purchase rolled back");
                if let Some(task) = task {
                    if let Err(e) = self.store.complete_task(task.id).await {
                        // The worker will re-run the compensation, which is a no-op by now
                        warn!(task_id = %task.id, error = %e, "Failed to complete rollback task");
                    }
                }
            }
            Err(e) => {
                error!(
                    target: ROLLBACK_TARGET,
                    order_id = %order_id,
                    user_id = %user_id,
                    amount,
                    queued = task.is_some(),
                    error = %e,
                    "Ledger rollback failed; balance and orders may disagree until it is retried"
                );
            }
        }
    }

    /// Undo a debited purchase: give the credits back, then delete whatever was written.
    pub async fn compensate(&self, order_id: OrderId, payload: &RollbackPayload) -> Result<()> {
        if payload.amount > 0 {
            let reversal = CreditEntryCreateDBRequest::reversal(payload.user_id, order_id, payload.amount);
            match self.store.apply_credit_entry(&reversal).await? {
                CreditApplyOutcome::Applied(entry) => {
                    debug!(order_id = %abbrev_uuid(&order_id), balance_after = entry.balance_after, "Debit reversed");
                }
                CreditApplyOutcome::Duplicate(_) => {
                    debug!(order_id = %abbrev_uuid(&order_id), "Debit already reversed");
                }
                CreditApplyOutcome::Insufficient { current_balance } => {
                    return Err(Error::Internal {
                        operation: format!("reverse debit of {} (balance {current_balance})", payload.amount),
                    });
                }
            }
        }
        self.store.delete_order_items(order_id).await?;
        self.store.delete_order(order_id).await?;
        Ok(())
    }

    /// Run a queued `ledger_rollback` task.
    pub async fn resume_rollback(&self, task: &OutboxTask) -> Result<()> {
        let payload: RollbackPayload = serde_json::from_value(task.payload.clone()).map_err(|e| Error::Internal {
            operation: format!("decode rollback task {}: {e}", task.id),
        })?;
        self.compensate(task.order_id, &payload).await
    }

    /// Credit a settled top-up: `amount + bonus` as one `charge` entry. Safe to repeat.
    #[instrument(skip(self, order), fields(order_id = %abbrev_uuid(&order.id)), err)]
    pub async fn credit_top_up(&self, order: &Order) -> Result<CreditLedgerEntry> {
        let request =
            CreditEntryCreateDBRequest::charge(order.user_id, order.id, order.total_amount, order.bonus_amount());
        match self.store.apply_credit_entry(&request).await? {
            CreditApplyOutcome::Applied(entry) => {
                info!(
                    amount = entry.amount,
                    bonus = entry.bonus_amount,
                    balance_after = entry.balance_after,
                    "Top-up credited"
                );
                Ok(entry)
            }
            CreditApplyOutcome::Duplicate(entry) => {
                debug!("Top-up already credited");
                Ok(entry)
            }
            CreditApplyOutcome::Insufficient { current_balance } => Err(Error::Internal {
                operation: format!("credit top-up of order {} (balance {current_balance})", order.id),
            }),
        }
    }

    /// Append a `refund` entry for an order. Positive `delta` gives credits back, negative takes
    /// back credits granted by a top-up. Safe to repeat.
    #[instrument(skip(self, order), fields(order_id = %abbrev_uuid(&order.id)), err)]
    pub async fn refund(&self, order: &Order, delta: Amount, refunded_by: Option<UserId>) -> Result<CreditLedgerEntry> {
        let request = CreditEntryCreateDBRequest {
            user_id: order.user_id,
            kind: CreditEntryKind::Refund,
            amount: delta,
            bonus_amount: 0,
            order_id: Some(order.id),
            description: Some(format!("Refund of order {}", order.order_number)),
            created_by: refunded_by,
        };
        match self.store.apply_credit_entry(&request).await? {
            CreditApplyOutcome::Applied(entry) | CreditApplyOutcome::Duplicate(entry) => Ok(entry),
            CreditApplyOutcome::Insufficient { current_balance } => Err(Error::conflict(format!(
                "Credits from this order have already been spent (balance {current_balance}, refund needs {})",
                -delta
            ))),
        }
    }

    /// Replay every entry of a user from zero and compare with the stored balance.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn audit(&self, user_id: UserId) -> Result<LedgerAudit> {
        let entries = self.store.list_credit_entries_for_replay(user_id).await?;
        let stored_balance = self.store.get_balance(user_id).await?;

        let mut replayed_balance: Amount = 0;
        let mut first_broken_entry = None;
        for entry in &entries {
            let replayed = replayed_balance.checked_add(entry.delta());
            if first_broken_entry.is_none() && replayed != Some(entry.balance_after) {
                first_broken_entry = Some(entry.id);
            }
            replayed_balance = replayed.unwrap_or(entry.balance_after);
        }

        let consistent = first_broken_entry.is_none() && replayed_balance == stored_balance;
        if !consistent {
            warn!(replayed_balance, stored_balance, ?first_broken_entry, "Ledger replay does not match balance");
        }

        Ok(LedgerAudit {
            user_id,
            entry_count: entries.len(),
            replayed_balance,
            stored_balance,
            consistent,
            first_broken_entry,
        })
    }
}
