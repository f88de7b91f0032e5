//! PostgreSQL implementation of the [`Store`] trait.
//!
//! Every method issues a single statement. The conditional writes the checkout flow
//! depends on (balance movement, settlement, status transitions) are expressed as
//! guarded `UPDATE`s or data-modifying CTEs so Postgres row locking serializes
//! concurrent callers without an explicit transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, types::Json};
use uuid::Uuid;

use super::Store;
use crate::db::errors::{Result, StoreError};
use crate::db::models::{
    credits::{CreditApplyOutcome, CreditEntryCreateDBRequest, CreditLedgerEntry},
    entitlements::{Entitlement, EntitlementCreateDBRequest},
    orders::{
        Order, OrderCreateDBRequest, OrderFinalization, OrderItem, OrderItemCreateDBRequest, OrderStatus, PaymentMethod,
        PaymentStatus, VirtualAccountInfo,
    },
    outbox::{OutboxTask, OutboxTaskCreateDBRequest, OutboxTaskFailure},
    payment_transactions::{PaymentTransactionCreateDBRequest, PaymentTransactionLog, PaymentTransactionStatusUpdate},
};
use crate::types::{Amount, OrderId, OutboxTaskId, UserId};

const LEDGER_ORDER_KIND_UNIQUE: &str = "credit_ledger_order_kind_unique";

const ORDER_COLUMNS: &str = "id, order_number, user_id, total_amount, status, payment_status, payment_method, metadata, \
     transaction_id, depositor_name, virtual_account_info, payment_confirmed_at, created_at, updated_at";

const LEDGER_COLUMNS: &str = "id, user_id, kind, amount, bonus_amount, balance_after, order_id, description, created_by, created_at";

/// Row shape of `orders`; the account info column is JSONB.
#[derive(FromRow)]
struct OrderRow {
    id: OrderId,
    order_number: String,
    user_id: UserId,
    total_amount: Amount,
    status: OrderStatus,
    payment_status: PaymentStatus,
    payment_method: PaymentMethod,
    metadata: Value,
    transaction_id: Option<String>,
    depositor_name: Option<String>,
    virtual_account_info: Option<Json<VirtualAccountInfo>>,
    payment_confirmed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<OrderRow> for Order {
    fn from(row: OrderRow) -> Self {
        Self {
            id: row.id,
            order_number: row.order_number,
            user_id: row.user_id,
            total_amount: row.total_amount,
            status: row.status,
            payment_status: row.payment_status,
            payment_method: row.payment_method,
            metadata: row.metadata,
            transaction_id: row.transaction_id,
            depositor_name: row.depositor_name,
            virtual_account_info: row.virtual_account_info.map(|Json(info)| info),
            payment_confirmed_at: row.payment_confirmed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_ledger_entry(&self, order_id: OrderId, kind: &str) -> Result<Option<CreditLedgerEntry>> {
        let entry = sqlx::query_as::<_, CreditLedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE order_id = $1 AND kind = $2"
        ))
        .bind(order_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn insert_order(&self, request: &OrderCreateDBRequest) -> Result<Order> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            INSERT INTO orders (id, order_number, user_id, total_amount, status, payment_status, payment_method,
                                metadata, transaction_id, depositor_name, payment_confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(request.id)
        .bind(&request.order_number)
        .bind(request.user_id)
        .bind(request.total_amount)
        .bind(request.status)
        .bind(request.payment_status)
        .bind(request.payment_method)
        .bind(Value::Object(request.metadata.clone()))
        .bind(&request.transaction_id)
        .bind(&request.depositor_name)
        .bind(request.payment_confirmed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn insert_order_items(&self, order_id: OrderId, items: &[OrderItemCreateDBRequest]) -> Result<Vec<OrderItem>> {
        let ids: Vec<Uuid> = items.iter().map(|_| Uuid::new_v4()).collect();
        let product_ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let titles: Vec<String> = items.iter().map(|i| i.title.clone()).collect();
        let prices: Vec<i64> = items.iter().map(|i| i.price).collect();

        let created = sqlx::query_as::<_, OrderItem>(
            r#"
            INSERT INTO order_items (id, order_id, product_id, title, price)
            SELECT item.id, $2, item.product_id, item.title, item.price
            FROM UNNEST($1::uuid[], $3::uuid[], $4::text[], $5::bigint[]) AS item(id, product_id, title, price)
            RETURNING id, order_id, product_id, title, price
            "#,
        )
        .bind(&ids)
        .bind(order_id)
        .bind(&product_ids)
        .bind(&titles)
        .bind(&prices)
        .fetch_all(&self.pool)
        .await?;
        Ok(created)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT id, order_id, product_id, title, price FROM order_items WHERE order_id = $1 ORDER BY title",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn list_user_orders(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 ORDER BY created_at DESC OFFSET $2 LIMIT $3"
        ))
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_order_items(&self, order_id: OrderId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM order_items WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_order(&self, id: OrderId) -> Result<bool> {
        // order_items cascade
        let result = sqlx::query("DELETE FROM orders WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finalize_order(&self, id: OrderId, finalization: &OrderFinalization) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            UPDATE orders
            SET status = 'completed',
                payment_status = 'paid',
                transaction_id = $2,
                payment_confirmed_at = $3,
                metadata = CASE WHEN jsonb_typeof(metadata) = 'object' THEN metadata ELSE '{{}}'::jsonb END || $4::jsonb,
                depositor_name = COALESCE($5, depositor_name),
                updated_at = NOW()
            WHERE id = $1
              AND payment_status NOT IN ('paid', 'refunded')
              AND status <> 'completed'
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&finalization.transaction_id)
        .bind(finalization.confirmed_at)
        .bind(Value::Object(finalization.metadata.clone()))
        .bind(&finalization.depositor_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn transition_order(
        &self,
        id: OrderId,
        from: &[PaymentStatus],
        to_status: OrderStatus,
        to_payment_status: PaymentStatus,
    ) -> Result<Option<Order>> {
        let from: Vec<&str> = from.iter().map(PaymentStatus::as_str).collect();
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            UPDATE orders
            SET status = $3, payment_status = $4, updated_at = NOW()
            WHERE id = $1 AND payment_status = ANY($2::text[])
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&from)
        .bind(to_status)
        .bind(to_payment_status)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn set_order_account_info(&self, id: OrderId, info: &VirtualAccountInfo) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            "UPDATE orders SET virtual_account_info = $2, updated_at = NOW() WHERE id = $1 RETURNING {ORDER_COLUMNS}"
        ))
        .bind(id)
        .bind(Json(info.issued(Utc::now())))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn latest_order_with_account_info(&self, user_id: UserId) -> Result<Option<Order>> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE user_id = $1 AND virtual_account_info IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_stale_orders(&self, status: PaymentStatus, created_before: DateTime<Utc>, limit: i64) -> Result<Vec<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE payment_status = $1 AND created_at < $2
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(status)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn apply_credit_entry(&self, request: &CreditEntryCreateDBRequest) -> Result<CreditApplyOutcome> {
        // The profile upsert only proceeds when no entry exists for (order_id, kind) and the
        // resulting balance stays non-negative; the ledger insert consumes its RETURNING row,
        // so both writes happen or neither does. Concurrent movements for one user serialize
        // on the profile row lock and re-check the guard against the committed balance.
        let applied = sqlx::query_as::<_, CreditLedgerEntry>(&format!(
            r#"
            WITH existing AS (
                SELECT 1 FROM credit_ledger
                WHERE $5::uuid IS NOT NULL AND order_id = $5 AND kind = $2
            ),
            moved AS (
                INSERT INTO profiles AS p (user_id, credits)
                SELECT $1, GREATEST($3 + $4, 0)
                WHERE NOT EXISTS (SELECT 1 FROM existing)
                  AND ($3 + $4 >= 0 OR EXISTS (SELECT 1 FROM profiles WHERE user_id = $1))
                ON CONFLICT (user_id) DO UPDATE
                    SET credits = p.credits + $3 + $4, updated_at = NOW()
                    WHERE p.credits + $3 + $4 >= 0
                RETURNING credits
            )
            INSERT INTO credit_ledger (user_id, kind, amount, bonus_amount, balance_after, order_id, description, created_by)
            SELECT $1, $2, $3, $4, moved.credits, $5, $6, $7 FROM moved
            RETURNING {LEDGER_COLUMNS}
            "#
        ))
        .bind(request.user_id)
        .bind(request.kind)
        .bind(request.amount)
        .bind(request.bonus_amount)
        .bind(request.order_id)
        .bind(&request.description)
        .bind(request.created_by)
        .fetch_optional(&self.pool)
        .await;

        let applied = match applied {
            Ok(applied) => applied,
            // Lost a race with an identical movement; the whole statement rolled back.
            Err(e) => match StoreError::from(e) {
                err if err.is_unique_violation_on(LEDGER_ORDER_KIND_UNIQUE) => None,
                err => return Err(err),
            },
        };

        if let Some(entry) = applied {
            return Ok(CreditApplyOutcome::Applied(entry));
        }

        if let Some(order_id) = request.order_id {
            if let Some(existing) = self.find_ledger_entry(order_id, request.kind.as_str()).await? {
                return Ok(CreditApplyOutcome::Duplicate(existing));
            }
        }

        let current_balance = self.get_balance(request.user_id).await?;
        Ok(CreditApplyOutcome::Insufficient { current_balance })
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Amount> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT credits FROM profiles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn list_credit_entries(&self, user_id: UserId, skip: i64, limit: i64) -> Result<Vec<CreditLedgerEntry>> {
        let entries = sqlx::query_as::<_, CreditLedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE user_id = $1 ORDER BY id DESC OFFSET $2 LIMIT $3"
        ))
        .bind(user_id)
        .bind(skip)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn list_credit_entries_for_replay(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>> {
        let entries = sqlx::query_as::<_, CreditLedgerEntry>(&format!(
            "SELECT {LEDGER_COLUMNS} FROM credit_ledger WHERE user_id = $1 ORDER BY id ASC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn grant_entitlements(&self, grants: &[EntitlementCreateDBRequest]) -> Result<u64> {
        if grants.is_empty() {
            return Ok(0);
        }
        let user_ids: Vec<Uuid> = grants.iter().map(|g| g.user_id).collect();
        let order_ids: Vec<Uuid> = grants.iter().map(|g| g.order_id).collect();
        let product_ids: Vec<Uuid> = grants.iter().map(|g| g.product_id).collect();
        let prices: Vec<i64> = grants.iter().map(|g| g.price_paid).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, order_id, product_id, price_paid)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::bigint[])
            ON CONFLICT (order_id, product_id) DO NOTHING
            "#,
        )
        .bind(&user_ids)
        .bind(&order_ids)
        .bind(&product_ids)
        .bind(&prices)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn revoke_entitlements(&self, order_id: OrderId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM entitlements WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_entitlements(&self, user_id: UserId) -> Result<Vec<Entitlement>> {
        let entitlements = sqlx::query_as::<_, Entitlement>(
            "SELECT id, user_id, order_id, product_id, price_paid, granted_at FROM entitlements WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entitlements)
    }

    async fn insert_transaction_log(&self, request: &PaymentTransactionCreateDBRequest) -> Result<PaymentTransactionLog> {
        let log = sqlx::query_as::<_, PaymentTransactionLog>(
            r#"
            INSERT INTO payment_transactions (order_id, user_id, method, provider, amount, status,
                                              provider_transaction_id, raw_request, raw_response, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(request.order_id)
        .bind(request.user_id)
        .bind(request.method)
        .bind(&request.provider)
        .bind(request.amount)
        .bind(request.status)
        .bind(&request.provider_transaction_id)
        .bind(&request.raw_request)
        .bind(&request.raw_response)
        .bind(&request.error_message)
        .fetch_one(&self.pool)
        .await?;
        Ok(log)
    }

    async fn update_transaction_log_status(&self, order_id: OrderId, update: &PaymentTransactionStatusUpdate) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_transactions
            SET status = $2,
                provider_transaction_id = COALESCE($3, provider_transaction_id),
                raw_response = COALESCE($4, raw_response),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM payment_transactions WHERE order_id = $1 ORDER BY created_at DESC LIMIT 1
            )
            "#,
        )
        .bind(order_id)
        .bind(update.status)
        .bind(&update.provider_transaction_id)
        .bind(&update.raw_response)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_transaction_logs(&self, order_id: OrderId) -> Result<Vec<PaymentTransactionLog>> {
        let logs =
            sqlx::query_as::<_, PaymentTransactionLog>("SELECT * FROM payment_transactions WHERE order_id = $1 ORDER BY created_at")
                .bind(order_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(logs)
    }

    async fn enqueue_task(&self, request: &OutboxTaskCreateDBRequest) -> Result<OutboxTask> {
        let inserted = sqlx::query_as::<_, OutboxTask>(
            r#"
            INSERT INTO outbox_tasks (id, kind, order_id, payload, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (kind, order_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(request.kind)
        .bind(request.order_id)
        .bind(&request.payload)
        .bind(request.run_after)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(task) = inserted {
            return Ok(task);
        }

        let existing = sqlx::query_as::<_, OutboxTask>("SELECT * FROM outbox_tasks WHERE kind = $1 AND order_id = $2")
            .bind(request.kind)
            .bind(request.order_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(existing)
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, lease: chrono::Duration, limit: i64) -> Result<Vec<OutboxTask>> {
        let tasks = sqlx::query_as::<_, OutboxTask>(
            r#"
            UPDATE outbox_tasks
            SET attempts = attempts + 1, next_attempt_at = $2, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM outbox_tasks
                WHERE status = 'pending' AND next_attempt_at <= $1
                ORDER BY next_attempt_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now + lease)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn complete_task(&self, id: OutboxTaskId) -> Result<()> {
        let result = sqlx::query("UPDATE outbox_tasks SET status = 'completed', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn fail_task(&self, id: OutboxTaskId, error: &str, failure: &OutboxTaskFailure) -> Result<()> {
        let (status, next_attempt_at) = match failure {
            OutboxTaskFailure::Retry { next_attempt_at } => ("pending", Some(*next_attempt_at)),
            OutboxTaskFailure::Dead => ("dead", None),
        };
        let result = sqlx::query(
            r#"
            UPDATE outbox_tasks
            SET status = $2, last_error = $3, next_attempt_at = COALESCE($4, next_attempt_at), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_task(&self, id: OutboxTaskId) -> Result<Option<OutboxTask>> {
        let task = sqlx::query_as::<_, OutboxTask>("SELECT * FROM outbox_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }
}
