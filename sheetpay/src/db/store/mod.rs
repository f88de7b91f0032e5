//! The storage boundary used by every checkout service.
//!
//! Each method maps to exactly one atomic statement. Callers compose these into sagas
//! (see `checkout::ledger`) and rely on the conditional primitives below for the
//! concurrency guarantees they need:
//!
//! - [`Store::apply_credit_entry`] moves a balance and appends the ledger entry together,
//!   refusing to go negative and refusing to apply the same `(order_id, kind)` twice.
//! - [`Store::finalize_order`] is the settlement check-and-set: only one caller wins.
//! - [`Store::transition_order`] is a compare-and-set on payment status.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::errors::Result;
use crate::db::models::{
    credits::{CreditApplyOutcome, CreditEntryCreateDBRequest, CreditLedgerEntry},
    entitlements::{Entitlement, EntitlementCreateDBRequest},
    orders::{
        Order, OrderCreateDBRequest, OrderFinalization, OrderItem, OrderItemCreateDBRequest, OrderStatus, PaymentStatus,
        VirtualAccountInfo,
    },
    outbox::{OutboxTask, OutboxTaskCreateDBRequest, OutboxTaskFailure},
    payment_transactions::{PaymentTransactionCreateDBRequest, PaymentTransactionLog, PaymentTransactionStatusUpdate},
};
use crate::types::{Amount, OrderId, OutboxTaskId, UserId};

pub mod in_memory;
pub mod postgres;


pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait Store: Send + Sync {
    // Orders

    async fn insert_order(&self, request: &OrderCreateDBRequest) -> Result<Order>;

    /// Insert all items of an order in one statement; either all land or none do.
    async fn insert_order_items(&self, order_id: OrderId, items: &[OrderItemCreateDBRequest]) -> Result<Vec<OrderItem>>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    /// Newest first.
    async fn list_user_orders(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<Order>>;

    /// Returns the number of rows removed. Removing nothing is not an error.
    async fn delete_order_items(&self, order_id: OrderId) -> Result<u64>;

    /// Returns whether a row was removed.
    async fn delete_order(&self, id: OrderId) -> Result<bool>;

    /// Settle an order unless it is already paid, completed or refunded.
    ///
    /// Sets `status = completed`, `payment_status = paid`, the transaction id and
    /// confirmation time, and merges `metadata` into the stored metadata.
    /// Returns `None` when the guard did not match (or the order does not exist).
    async fn finalize_order(&self, id: OrderId, finalization: &OrderFinalization) -> Result<Option<Order>>;

    /// Move an order to `(to_status, to_payment_status)` if its payment status is one of `from`.
    async fn transition_order(
        &self,
        id: OrderId,
        from: &[PaymentStatus],
        to_status: OrderStatus,
        to_payment_status: PaymentStatus,
    ) -> Result<Option<Order>>;

    /// Attach deposit details delivered by a provider.
    async fn set_order_account_info(&self, id: OrderId, info: &VirtualAccountInfo) -> Result<Option<Order>>;

    /// The user's newest order carrying account details.
    async fn latest_order_with_account_info(&self, user_id: UserId) -> Result<Option<Order>>;

    /// Orders still in `status` whose creation predates `created_before`, oldest first.
    async fn list_stale_orders(&self, status: PaymentStatus, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Order>>;

    // Credit ledger

    /// Atomically move the user's balance by `request.delta()` and append the entry.
    async fn apply_credit_entry(&self, request: &CreditEntryCreateDBRequest) -> Result<CreditApplyOutcome>;

    /// Current balance, zero for users without a profile row.
    async fn get_balance(&self, user_id: UserId) -> Result<Amount>;

    /// Newest first.
    async fn list_credit_entries(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditLedgerEntry>>;

    /// Every entry for the user in creation order.
    async fn list_credit_entries_for_replay(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>>;

    // Entitlements

    /// Grant access; already granted `(order_id, product_id)` pairs are skipped.
    /// Returns the number of new grants.
    async fn grant_entitlements(&self, grants: &[EntitlementCreateDBRequest]) -> Result<u64>;

    async fn revoke_entitlements(&self, order_id: OrderId) -> Result<u64>;

    async fn list_entitlements(&self, user_id: UserId) -> Result<Vec<Entitlement>>;

    // Payment transaction log

    async fn insert_transaction_log(&self, request: &PaymentTransactionCreateDBRequest) -> Result<PaymentTransactionLog>;

    /// Update the newest log row of the order. Returns the number of rows touched.
    async fn update_transaction_log_status(&self, order_id: OrderId, update: &PaymentTransactionStatusUpdate) -> Result<u64>;

    async fn list_transaction_logs(&self, order_id: OrderId) -> Result<Vec<PaymentTransactionLog>>;

    // Outbox

    /// Insert a task, or return the existing one for the same `(kind, order_id)`.
    async fn enqueue_task(&self, request: &OutboxTaskCreateDBRequest) -> Result<OutboxTask>;

    /// Claim up to `limit` due pending tasks, pushing their next attempt out by `lease`
    /// and counting the attempt. Concurrent claimers never receive the same task.
    async fn claim_due_tasks(&self, now: DateTime<Utc>, lease: chrono::Duration, limit: i64) -> Result<Vec<OutboxTask>>;

    async fn complete_task(&self, id: OutboxTaskId) -> Result<()>;

    async fn fail_task(&self, id: OutboxTaskId, error: &str, failure: &OutboxTaskFailure) -> Result<()>;

    async fn get_task(&self, id: OutboxTaskId) -> Result<Option<OutboxTask>>;
}
