//! Order lifecycle, payment dispatch and settlement.
//!
//! ```text
//! start_purchase ──┬─ ledger ──► CreditLedger::purchase_with_ledger (debit, paid order, rollback saga)
//!                  └─ other  ──► pending order ──► PaymentProvider::create_intent
//!                                                       │
//!        return redirect / webhook / admin confirm ─────┘
//!                                                       ▼
//!                                 SettlementReconciler::complete_order
//!                                   ├─ outbox task (settlement) written first
//!                                   ├─ ledger charge or entitlements
//!                                   └─ finalize_order check-and-set
//! ```
//!
//! The storage boundary offers no multi-statement transactions. Anything that must
//! eventually happen after a partial failure goes through the outbox (see [`outbox`]).

use crate::db::models::orders::{Order, OrderCreateDBRequest, OrderStatus, PaymentStatus};
use crate::db::models::payment_transactions::{PaymentTransactionCreateDBRequest, PaymentTransactionStatusUpdate};
use crate::db::store::Store;
use crate::errors::Result;
use crate::types::{OrderId, abbrev_uuid};

pub mod awaiter;
pub mod cancellation;
pub mod ledger;
pub mod orchestrator;
pub mod order_number;
pub mod outbox;
pub mod reconciler;
pub mod sweeper;

pub use awaiter::{AccountDetailAwaiter, DetailNotifier};
pub use cancellation::CancellationService;
pub use ledger::CreditLedger;
pub use orchestrator::PurchaseOrchestrator;
pub use outbox::OutboxWorker;
pub use reconciler::SettlementReconciler;
pub use sweeper::PendingOrderSweeper;

/// Log target for compensation failures. Operators alert on it.
pub const ROLLBACK_TARGET: &str = "sheetpay::rollback";

/// Attempts at finding a free order number before giving up.
const ORDER_NUMBER_ATTEMPTS: usize = 5;
const ORDER_NUMBER_CONSTRAINT: &str = "orders_order_number_key";

/// Insert an order, drawing a new order number when the generated one is taken.
pub(crate) async fn insert_order_with_fresh_number(store: &dyn Store, mut request: OrderCreateDBRequest) -> Result<Order> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.insert_order(&request).await {
            Ok(order) => return Ok(order),
            Err(e) if e.is_unique_violation_on(ORDER_NUMBER_CONSTRAINT) && attempt < ORDER_NUMBER_ATTEMPTS => {
                tracing::debug!("Order number {} taken, drawing another", request.order_number);
                request.order_number = order_number::generate_order_number(chrono::Utc::now());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Append an audit row. Failures are logged and swallowed.
pub(crate) async fn record_transaction(store: &dyn Store, request: &PaymentTransactionCreateDBRequest) {
    if let Err(e) = store.insert_transaction_log(request).await {
        tracing::warn!(
            order_id = %abbrev_uuid(&request.order_id),
            error = %e,
            "Failed to write payment transaction log"
        );
    }
}

/// Move the newest audit row of an order to a terminal status. Failures are logged and swallowed.
pub(crate) async fn mark_transaction(store: &dyn Store, order_id: OrderId, update: &PaymentTransactionStatusUpdate) {
    match store.update_transaction_log_status(order_id, update).await {
        Ok(0) => tracing::debug!(order_id = %abbrev_uuid(&order_id), "No payment transaction log row to update"),
        Ok(_) => {}
        Err(e) => tracing::warn!(
            order_id = %abbrev_uuid(&order_id),
            status = update.status.as_str(),
            error = %e,
            "Failed to update payment transaction log"
        ),
    }
}

/// Fail an order that is still waiting for payment and close its audit row.
///
/// Returns `None` when the order had moved on (settled, cancelled) in the meantime.
pub(crate) async fn fail_unpaid_order(store: &dyn Store, order_id: OrderId, reason: &str) -> Result<Option<Order>> {
    let failed = store
        .transition_order(
            order_id,
            &[PaymentStatus::Pending, PaymentStatus::AwaitingDeposit],
            OrderStatus::Failed,
            PaymentStatus::Failed,
        )
        .await?;
    if failed.is_some() {
        tracing::info!(order_id = %abbrev_uuid(&order_id), reason, "Order failed");
        mark_transaction(
            store,
            order_id,
            &PaymentTransactionStatusUpdate {
                status: PaymentStatus::Failed,
                provider_transaction_id: None,
                raw_response: Some(serde_json::json!({ "error": reason })),
            },
        )
        .await;
    }
    Ok(failed)
}
