//! In-memory implementation of the [`Store`] trait.
//!
//! All tables live behind one `RwLock`, so every trait method is trivially atomic.
//! Suitable for tests and single-process development; everything is lost on restart.
//!
//! Tests can arm a [`Fault`] to make the next matching write fail, which is how the
//! compensation and outbox paths are exercised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::Store;
use crate::db::errors::{Result, StoreError};
use crate::db::models::{
    credits::{CreditApplyOutcome, CreditEntryCreateDBRequest, CreditLedgerEntry},
    entitlements::{Entitlement, EntitlementCreateDBRequest},
    orders::{
        Order, OrderCreateDBRequest, OrderFinalization, OrderItem, OrderItemCreateDBRequest, OrderStatus, PaymentStatus,
        VirtualAccountInfo, merge_metadata,
    },
    outbox::{OutboxTask, OutboxTaskCreateDBRequest, OutboxTaskFailure, OutboxTaskStatus},
    payment_transactions::{PaymentTransactionCreateDBRequest, PaymentTransactionLog, PaymentTransactionStatusUpdate},
};
use crate::types::{Amount, OrderId, OutboxTaskId, UserId};

/// A write that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    InsertOrder,
    InsertOrderItems,
    DeleteOrder,
    GrantEntitlements,
    ApplyCreditEntry,
    FinalizeOrder,
    EnqueueTask,
    SetAccountInfo,
}

#[derive(Default)]
struct Tables {
    orders: HashMap<OrderId, Order>,
    order_items: Vec<OrderItem>,
    balances: HashMap<UserId, Amount>,
    ledger: Vec<CreditLedgerEntry>,
    entitlements: Vec<Entitlement>,
    transaction_logs: Vec<PaymentTransactionLog>,
    outbox: HashMap<OutboxTaskId, OutboxTask>,
    next_ledger_id: i64,
    next_entitlement_id: i64,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Mutex<HashSet<Fault>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write of this kind fail with a storage error.
    pub fn fail_next(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    /// Seed a balance without a ledger entry. Only for tests that start from a known balance.
    pub fn set_balance(&self, user_id: UserId, balance: Amount) {
        self.tables.write().balances.insert(user_id, balance);
    }

    /// Move the issue time of an order's account details into the past.
    pub fn backdate_account_info(&self, order_id: OrderId, issued_at: DateTime<Utc>) {
        if let Some(info) = self
            .tables
            .write()
            .orders
            .get_mut(&order_id)
            .and_then(|order| order.virtual_account_info.as_mut())
        {
            info.issued_at = Some(issued_at);
        }
    }

    fn check_fault(&self, fault: Fault) -> Result<()> {
        if self.faults.lock().remove(&fault) {
            return Err(StoreError::Other(anyhow!("injected fault: {fault:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_order(&self, request: &OrderCreateDBRequest) -> Result<Order> {
        self.check_fault(Fault::InsertOrder)?;
        let mut tables = self.tables.write();
        if tables.orders.contains_key(&request.id) || tables.orders.values().any(|o| o.order_number == request.order_number) {
            return Err(StoreError::UniqueViolation {
                constraint: Some("orders_order_number_key".to_string()),
                table: Some("orders".to_string()),
                message: format!("order {} already exists", request.order_number),
            });
        }
        let now = Utc::now();
        let order = Order {
            id: request.id,
            order_number: request.order_number.clone(),
            user_id: request.user_id,
            total_amount: request.total_amount,
            status: request.status,
            payment_status: request.payment_status,
            payment_method: request.payment_method,
            metadata: serde_json::Value::Object(request.metadata.clone()),
            transaction_id: request.transaction_id.clone(),
            depositor_name: request.depositor_name.clone(),
            virtual_account_info: None,
            payment_confirmed_at: request.payment_confirmed_at,
            created_at: now,
            updated_at: now,
        };
        tables.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn insert_order_items(&self, order_id: OrderId, items: &[OrderItemCreateDBRequest]) -> Result<Vec<OrderItem>> {
        self.check_fault(Fault::InsertOrderItems)?;
        let mut tables = self.tables.write();
        if !tables.orders.contains_key(&order_id) {
            return Err(StoreError::ForeignKeyViolation {
                constraint: Some("order_items_order_id_fkey".to_string()),
                table: Some("order_items".to_string()),
                message: format!("order {order_id} does not exist"),
            });
        }
        let created: Vec<OrderItem> = items
            .iter()
            .map(|item| OrderItem {
                id: Uuid::new_v4(),
                order_id,
                product_id: item.product_id,
                title: item.title.clone(),
                price: item.price,
            })
            .collect();
        tables.order_items.extend(created.iter().cloned());
        Ok(created)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.read().orders.get(&id).cloned())
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let tables = self.tables.read();
        Ok(tables.order_items.iter().filter(|i| i.order_id == order_id).cloned().collect())
    }

    async fn list_user_orders(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<Order>> {
        let tables = self.tables.read();
        let mut orders: Vec<Order> = tables.orders.values().filter(|o| o.user_id == user_id).cloned().collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders.into_iter().skip(skip.max(0) as usize).take(limit.max(0) as usize).collect())
    }

    async fn delete_order_items(&self, order_id: OrderId) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.order_items.len();
        tables.order_items.retain(|i| i.order_id != order_id);
        Ok((before - tables.order_items.len()) as u64)
    }

    async fn delete_order(&self, id: OrderId) -> Result<bool> {
        self.check_fault(Fault::DeleteOrder)?;
        let mut tables = self.tables.write();
        tables.order_items.retain(|i| i.order_id != id);
        Ok(tables.orders.remove(&id).is_some())
    }

    async fn finalize_order(&self, id: OrderId, finalization: &OrderFinalization) -> Result<Option<Order>> {
        self.check_fault(Fault::FinalizeOrder)?;
        let mut tables = self.tables.write();
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(None);
        };
        if order.is_settled() {
            return Ok(None);
        }
        order.status = OrderStatus::Completed;
        order.payment_status = PaymentStatus::Paid;
        order.transaction_id = Some(finalization.transaction_id.clone());
        order.payment_confirmed_at = Some(finalization.confirmed_at);
        order.metadata = merge_metadata(&order.metadata, &finalization.metadata);
        if let Some(depositor) = &finalization.depositor_name {
            order.depositor_name = Some(depositor.clone());
        }
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: &[PaymentStatus],
        to_status: OrderStatus,
        to_payment_status: PaymentStatus,
    ) -> Result<Option<Order>> {
        let mut tables = self.tables.write();
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&order.payment_status) {
            return Ok(None);
        }
        order.status = to_status;
        order.payment_status = to_payment_status;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn set_order_account_info(&self, id: OrderId, info: &VirtualAccountInfo) -> Result<Option<Order>> {
        self.check_fault(Fault::SetAccountInfo)?;
        let mut tables = self.tables.write();
        let Some(order) = tables.orders.get_mut(&id) else {
            return Ok(None);
        };
        let now = Utc::now();
        order.virtual_account_info = Some(info.issued(now));
        order.updated_at = now;
        Ok(Some(order.clone()))
    }

    async fn latest_order_with_account_info(&self, user_id: UserId) -> Result<Option<Order>> {
        let tables = self.tables.read();
        Ok(tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.virtual_account_info.is_some())
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn list_stale_orders(&self, status: PaymentStatus, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Order>> {
        let tables = self.tables.read();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.payment_status == status && o.created_at < created_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn apply_credit_entry(&self, request: &CreditEntryCreateDBRequest) -> Result<CreditApplyOutcome> {
        self.check_fault(Fault::ApplyCreditEntry)?;
        let mut tables = self.tables.write();

        if let Some(order_id) = request.order_id {
            let existing = tables
                .ledger
                .iter()
                .find(|e| e.order_id == Some(order_id) && e.kind == request.kind);
            if let Some(existing) = existing {
                return Ok(CreditApplyOutcome::Duplicate(existing.clone()));
            }
        }

        let current = tables.balances.get(&request.user_id).copied().unwrap_or(0);
        let balance_after = request
            .delta()
            .and_then(|delta| current.checked_add(delta))
            .ok_or_else(|| StoreError::Other(anyhow!("credit balance overflow for user {}", request.user_id)))?;
        if balance_after < 0 {
            return Ok(CreditApplyOutcome::Insufficient { current_balance: current });
        }

        tables.next_ledger_id += 1;
        let entry = CreditLedgerEntry {
            id: tables.next_ledger_id,
            user_id: request.user_id,
            kind: request.kind,
            amount: request.amount,
            bonus_amount: request.bonus_amount,
            balance_after,
            order_id: request.order_id,
            description: request.description.clone(),
            created_by: request.created_by,
            created_at: Utc::now(),
        };
        tables.balances.insert(request.user_id, balance_after);
        tables.ledger.push(entry.clone());
        Ok(CreditApplyOutcome::Applied(entry))
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Amount> {
        Ok(self.tables.read().balances.get(&user_id).copied().unwrap_or(0))
    }

    async fn list_credit_entries(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditLedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .ledger
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_credit_entries_for_replay(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>> {
        let tables = self.tables.read();
        Ok(tables.ledger.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }

    async fn grant_entitlements(&self, grants: &[EntitlementCreateDBRequest]) -> Result<u64> {
        self.check_fault(Fault::GrantEntitlements)?;
        let mut tables = self.tables.write();
        let mut granted = 0;
        for grant in grants {
            let exists = tables
                .entitlements
                .iter()
                .any(|e| e.order_id == grant.order_id && e.product_id == grant.product_id);
            if exists {
                continue;
            }
            tables.next_entitlement_id += 1;
            let id = tables.next_entitlement_id;
            tables.entitlements.push(Entitlement {
                id,
                user_id: grant.user_id,
                order_id: grant.order_id,
                product_id: grant.product_id,
                price_paid: grant.price_paid,
                granted_at: Utc::now(),
            });
            granted += 1;
        }
        Ok(granted)
    }

    async fn revoke_entitlements(&self, order_id: OrderId) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.entitlements.len();
        tables.entitlements.retain(|e| e.order_id != order_id);
        Ok((before - tables.entitlements.len()) as u64)
    }

    async fn list_entitlements(&self, user_id: UserId) -> Result<Vec<Entitlement>> {
        let tables = self.tables.read();
        Ok(tables.entitlements.iter().filter(|e| e.user_id == user_id).cloned().collect())
    }

    async fn insert_transaction_log(&self, request: &PaymentTransactionCreateDBRequest) -> Result<PaymentTransactionLog> {
        let now = Utc::now();
        let log = PaymentTransactionLog {
            id: Uuid::new_v4(),
            order_id: request.order_id,
            user_id: request.user_id,
            method: request.method,
            provider: request.provider.clone(),
            amount: request.amount,
            status: request.status,
            provider_transaction_id: request.provider_transaction_id.clone(),
            raw_request: request.raw_request.clone(),
            raw_response: request.raw_response.clone(),
            error_message: request.error_message.clone(),
            created_at: now,
            updated_at: now,
        };
        self.tables.write().transaction_logs.push(log.clone());
        Ok(log)
    }

    async fn update_transaction_log_status(&self, order_id: OrderId, update: &PaymentTransactionStatusUpdate) -> Result<u64> {
        let mut tables = self.tables.write();
        let Some(log) = tables.transaction_logs.iter_mut().rev().find(|l| l.order_id == order_id) else {
            return Ok(0);
        };
        log.status = update.status;
        if let Some(txn) = &update.provider_transaction_id {
            log.provider_transaction_id = Some(txn.clone());
        }
        if let Some(raw) = &update.raw_response {
            log.raw_response = Some(raw.clone());
        }
        log.updated_at = Utc::now();
        Ok(1)
    }

    async fn list_transaction_logs(&self, order_id: OrderId) -> Result<Vec<PaymentTransactionLog>> {
        let tables = self.tables.read();
        Ok(tables.transaction_logs.iter().filter(|l| l.order_id == order_id).cloned().collect())
    }

    async fn enqueue_task(&self, request: &OutboxTaskCreateDBRequest) -> Result<OutboxTask> {
        self.check_fault(Fault::EnqueueTask)?;
        let mut tables = self.tables.write();
        if let Some(existing) = tables
            .outbox
            .values()
            .find(|t| t.kind == request.kind && t.order_id == request.order_id)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let task = OutboxTask {
            id: Uuid::new_v4(),
            kind: request.kind,
            order_id: request.order_id,
            payload: request.payload.clone(),
            status: OutboxTaskStatus::Pending,
            attempts: 0,
            next_attempt_at: request.run_after,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        tables.outbox.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, lease: chrono::Duration, limit: i64) -> Result<Vec<OutboxTask>> {
        let mut tables = self.tables.write();
        let mut due: Vec<&mut OutboxTask> = tables
            .outbox
            .values_mut()
            .filter(|t| t.status == OutboxTaskStatus::Pending && t.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|t| t.next_attempt_at);
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|task| {
                task.attempts += 1;
                task.next_attempt_at = now + lease;
                task.updated_at = Utc::now();
                task.clone()
            })
            .collect())
    }

    async fn complete_task(&self, id: OutboxTaskId) -> Result<()> {
        let mut tables = self.tables.write();
        let task = tables.outbox.get_mut(&id).ok_or(StoreError::NotFound)?;
        task.status = OutboxTaskStatus::Completed;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, id: OutboxTaskId, error: &str, failure: &OutboxTaskFailure) -> Result<()> {
        let mut tables = self.tables.write();
        let task = tables.outbox.get_mut(&id).ok_or(StoreError::NotFound)?;
        task.last_error = Some(error.to_string());
        match failure {
            OutboxTaskFailure::Retry { next_attempt_at } => task.next_attempt_at = *next_attempt_at,
            OutboxTaskFailure::Dead => task.status = OutboxTaskStatus::Dead,
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get_task(&self, id: OutboxTaskId) -> Result<Option<OutboxTask>> {
        Ok(self.tables.read().outbox.get(&id).cloned())
    }
}
