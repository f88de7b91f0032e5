//! Operator cancel and refund.
//!
//! Cancel closes an order nobody paid for. Refund reverses a paid order: products lose
//! their entitlements, credit purchases get their credits back, top-ups take back the
//! credits they granted. Both finish with a compare-and-set, so a concurrent settlement or
//! a second operator click cannot land the order in two terminal states.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::{
    checkout::{ledger::CreditLedger, mark_transaction},
    db::{
        models::{
            orders::{Order, OrderStatus, PaymentMethod, PaymentStatus, PurchaseKind},
            payment_transactions::PaymentTransactionStatusUpdate,
        },
        store::Store,
    },
    errors::{Error, Result},
    payment_providers::ProviderRegistry,
    types::{Amount, OrderId, UserId, abbrev_uuid},
};

/// Operator request against one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Refund a paid order instead of cancelling an unpaid one
    #[serde(default)]
    pub refund: bool,
    pub reason: String,
}

#[derive(Clone)]
pub struct CancellationService {
    store: Arc<dyn Store>,
    providers: ProviderRegistry,
    ledger: CreditLedger,
}

impl CancellationService {
    pub fn new(store: Arc<dyn Store>, providers: ProviderRegistry, ledger: CreditLedger) -> Self {
        Self { store, providers, ledger }
    }

    async fn load(&self, order_id: OrderId) -> Result<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| Error::order_not_found(order_id))
    }

    /// Dispatch on `request.refund`.
    pub async fn handle(&self, order_id: OrderId, request: &CancelRequest, operator: Option<UserId>) -> Result<Order> {
        if request.refund {
            self.refund_order(order_id, &request.reason, operator).await
        } else {
            self.cancel_order(order_id, &request.reason).await
        }
    }

    /// Close an unpaid order.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&order_id)), err)]
    pub async fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<Order> {
        let order = self.load(order_id).await?;
        match order.payment_status {
            PaymentStatus::Paid => return Err(Error::conflict("Order is paid; refund it instead")),
            PaymentStatus::Refunded | PaymentStatus::Cancelled => {
                return Err(Error::conflict(format!("Order is already {}", order.payment_status.as_str())));
            }
            PaymentStatus::Pending | PaymentStatus::AwaitingDeposit | PaymentStatus::Failed => {}
        }

        if let Some(provider) = self.providers.for_order(&order) {
            if let Err(e) = provider.cancel(&order, reason).await {
                // Nothing was captured, so a failed remote cancel leaves no money behind
                warn!(error = %e, "Provider cancel failed, cancelling locally");
            }
        }

        let cancelled = self
            .store
            .transition_order(
                order_id,
                &[PaymentStatus::Pending, PaymentStatus::AwaitingDeposit, PaymentStatus::Failed],
                OrderStatus::Cancelled,
                PaymentStatus::Cancelled,
            )
            .await?
            .ok_or_else(|| Error::conflict("Order changed state while cancelling"))?;

        mark_transaction(
            self.store.as_ref(),
            order_id,
            &PaymentTransactionStatusUpdate {
                status: PaymentStatus::Cancelled,
                provider_transaction_id: None,
                raw_response: Some(json!({ "reason": reason })),
            },
        )
        .await;

        info!(order_number = %cancelled.order_number, reason, "Order cancelled");
        Ok(cancelled)
    }

    /// Reverse a paid order.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&order_id)), err)]
    pub async fn refund_order(&self, order_id: OrderId, reason: &str, operator: Option<UserId>) -> Result<Order> {
        let order = self.load(order_id).await?;
        match order.payment_status {
            PaymentStatus::Paid => {}
            PaymentStatus::Refunded => return Err(Error::conflict("Order is already refunded")),
            other => {
                return Err(Error::conflict(format!(
                    "Only paid orders can be refunded; order is {}",
                    other.as_str()
                )));
            }
        }

        let items = self.store.get_order_items(order_id).await?;
        match order.purchase_kind(items.len()) {
            Some(PurchaseKind::CashCharge) => {
                // Take back first: if the credits are gone the refund stops here
                let granted = order
                    .total_amount
                    .checked_add(order.bonus_amount())
                    .and_then(Amount::checked_neg)
                    .ok_or_else(|| Error::Internal {
                        operation: format!("compute top-up refund for order {}", order.order_number),
                    })?;
                self.ledger.refund(&order, granted, operator).await?;
                self.cancel_at_provider(&order, reason).await?;
            }
            Some(PurchaseKind::SheetPurchase) | None => {
                if order.payment_method == PaymentMethod::Ledger {
                    if order.total_amount > 0 {
                        self.ledger.refund(&order, order.total_amount, operator).await?;
                    }
                } else {
                    self.cancel_at_provider(&order, reason).await?;
                }
                let revoked = self.store.revoke_entitlements(order_id).await?;
                info!(revoked, "Entitlements revoked");
            }
        }

        let refunded = self
            .store
            .transition_order(order_id, &[PaymentStatus::Paid], OrderStatus::Cancelled, PaymentStatus::Refunded)
            .await?
            .ok_or_else(|| Error::conflict("Order changed state while refunding"))?;

        mark_transaction(
            self.store.as_ref(),
            order_id,
            &PaymentTransactionStatusUpdate {
                status: PaymentStatus::Refunded,
                provider_transaction_id: None,
                raw_response: Some(json!({ "reason": reason, "refunded_by": operator })),
            },
        )
        .await;

        info!(order_number = %refunded.order_number, amount = refunded.total_amount, reason, "Order refunded");
        Ok(refunded)
    }

    async fn cancel_at_provider(&self, order: &Order, reason: &str) -> Result<()> {
        let Some(provider) = self.providers.for_order(order) else {
            warn!(
                method = order.payment_method.as_str(),
                "No provider configured for refunded order; settle the money by hand"
            );
            return Ok(());
        };
        provider.cancel(order, reason).await?;
        Ok(())
    }
}
