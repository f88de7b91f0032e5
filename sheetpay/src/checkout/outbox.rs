//! Outbox worker.
//!
//! Polls for due tasks and re-drives them. Claiming leases a task (pushes its next attempt
//! out and counts the attempt) so concurrent workers in other replicas skip it. A failed
//! attempt is rescheduled with exponential backoff; after `max_attempts` the task is marked
//! dead and reported at error level for an operator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkout::{ROLLBACK_TARGET, ledger::CreditLedger, reconciler::SettlementReconciler},
    config::OutboxConfig,
    db::{
        models::outbox::{OutboxTask, OutboxTaskFailure, OutboxTaskKind},
        store::Store,
    },
    errors::Result,
    types::abbrev_uuid,
};

/// Delay before the next attempt after `attempts` failed ones.
pub fn backoff(config: &OutboxConfig, attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
    config
        .initial_backoff
        .checked_mul(1u32 << exponent)
        .map_or(config.max_backoff, |delay| delay.min(config.max_backoff))
}

#[derive(Clone)]
pub struct OutboxWorker {
    store: Arc<dyn Store>,
    reconciler: SettlementReconciler,
    ledger: CreditLedger,
    config: OutboxConfig,
}

impl OutboxWorker {
    pub fn new(store: Arc<dyn Store>, reconciler: SettlementReconciler, ledger: CreditLedger, config: OutboxConfig) -> Self {
        Self {
            store,
            reconciler,
            ledger,
            config,
        }
    }

    /// Claim and run one batch of due tasks. Returns how many were claimed.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.config.lease).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let tasks = self.store.claim_due_tasks(now, lease, self.config.batch_size).await?;
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "Claimed outbox tasks");
        }
        for task in &tasks {
            self.process(task, now).await;
        }
        Ok(tasks.len())
    }

    async fn process(&self, task: &OutboxTask, now: DateTime<Utc>) {
        let result = match task.kind {
            OutboxTaskKind::Settlement => self.reconciler.resume(task).await,
            OutboxTaskKind::LedgerRollback => self.ledger.resume_rollback(task).await.map(|()| true),
        };

        let closed = match result {
            Ok(true) => {
                info!(
                    task_id = %task.id,
                    kind = ?task.kind,
                    order_id = %abbrev_uuid(&task.order_id),
                    attempts = task.attempts,
                    "Outbox task completed"
                );
                self.store.complete_task(task.id).await
            }
            Ok(false) => self.fail(task, "effects still pending", now).await,
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    kind = ?task.kind,
                    order_id = %abbrev_uuid(&task.order_id),
                    attempts = task.attempts,
                    error = %e,
                    "Outbox task attempt failed"
                );
                self.fail(task, &e.to_string(), now).await
            }
        };

        if let Err(e) = closed {
            // The lease expires and the task is picked up again
            warn!(task_id = %task.id, error = %e, "Failed to record outbox task result");
        }
    }

    async fn fail(&self, task: &OutboxTask, reason: &str, now: DateTime<Utc>) -> crate::db::errors::Result<()> {
        if task.attempts >= self.config.max_attempts {
            if task.kind == OutboxTaskKind::LedgerRollback {
                error!(
                    target: ROLLBACK_TARGET,
                    task_id = %task.id,
                    order_id = %task.order_id,
                    payload = %task.payload,
                    attempts = task.attempts,
                    reason,
                    "Ledger rollback gave up; balance needs manual correction"
                );
            } else {
                error!(
                    task_id = %task.id,
                    order_id = %task.order_id,
                    attempts = task.attempts,
                    reason,
                    "Settlement task gave up; order needs manual attention"
                );
            }
            return self.store.fail_task(task.id, reason, &OutboxTaskFailure::Dead).await;
        }

        let delay = chrono::Duration::from_std(backoff(&self.config, task.attempts))
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.store
            .fail_task(
                task.id,
                reason,
                &OutboxTaskFailure::Retry {
                    next_attempt_at: now + delay,
                },
            )
            .await
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(poll_interval = ?self.config.poll_interval, "Starting outbox worker");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Outbox worker shutting down");
                    return;
                }
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Outbox poll failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::awaiter::DetailNotifier;
    use crate::checkout::reconciler::{Confirmation, SettlementTrigger};
    use crate::db::models::orders::PaymentStatus;
    use crate::db::models::outbox::{OutboxTaskCreateDBRequest, OutboxTaskStatus};
    use crate::db::store::in_memory::{Fault, InMemoryStore};
    use crate::payment_providers::ProviderRegistry;
    use crate::test_utils::insert_top_up_order;
    use rstest::rstest;
    use serde_json::json;
    use uuid::Uuid;

    fn config() -> OutboxConfig {
        OutboxConfig {
            enabled: true,
            poll_interval: Duration::from_millis(50),
            batch_size: 10,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            lease: Duration::from_secs(60),
        }
    }

    fn worker(store: &InMemoryStore) -> OutboxWorker {
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let ledger = CreditLedger::new(shared.clone(), Duration::from_secs(30));
        let reconciler = SettlementReconciler::new(
            shared.clone(),
            ledger.clone(),
            ProviderRegistry::default(),
            DetailNotifier::default(),
            100,
            Duration::from_secs(30),
        );
        OutboxWorker::new(shared, reconciler, ledger, config())
    }

    #[rstest]
    #[case(1, 30)]
    #[case(2, 60)]
    #[case(3, 120)]
    #[case(5, 300)]
    #[case(40, 300)]
    fn test_backoff_doubles_up_to_cap(#[case] attempts: i32, #[case] expected_secs: u64) {
        assert_eq!(backoff(&config(), attempts), Duration::from_secs(expected_secs));
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_finishes_interrupted_settlement() {
        let store = InMemoryStore::new();
        let worker = worker(&store);
        let user = Uuid::new_v4();
        let order = insert_top_up_order(&store, user, 7_000, 0).await;

        store.fail_next(Fault::FinalizeOrder);
        worker
            .reconciler
            .complete_order(
                order.id,
                Confirmation::builder()
                    .trigger(SettlementTrigger::Webhook)
                    .provider_transaction_id("tid-77".to_string())
                    .build(),
            )
            .await
            .unwrap_err();

        // Not yet due
        assert_eq!(worker.run_once(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(worker.run_once(later).await.unwrap(), 1);

        let settled = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(settled.payment_status, PaymentStatus::Paid);
        assert_eq!(settled.metadata["completedBy"], "outbox");
        assert_eq!(store.get_balance(user).await.unwrap(), 7_000);
        assert_eq!(worker.run_once(later).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_failing_task_backs_off_then_dies() {
        let store = InMemoryStore::new();
        let worker = worker(&store);
        let missing_order = Uuid::new_v4();
        let task = store
            .enqueue_task(&OutboxTaskCreateDBRequest {
                kind: OutboxTaskKind::Settlement,
                order_id: missing_order,
                payload: json!({ "not": "a settlement" }),
                run_after: Utc::now(),
            })
            .await
            .unwrap();

        let mut now = Utc::now();
        for attempt in 1..=3 {
            assert_eq!(worker.run_once(now).await.unwrap(), 1, "attempt {attempt}");
            let current = store.get_task(task.id).await.unwrap().unwrap();
            assert_eq!(current.attempts, attempt);
            assert!(current.last_error.is_some());
            if attempt < 3 {
                assert_eq!(current.status, OutboxTaskStatus::Pending);
                assert!(current.next_attempt_at > now);
                now = current.next_attempt_at;
            } else {
                assert_eq!(current.status, OutboxTaskStatus::Dead);
            }
        }
        assert_eq!(worker.run_once(now + chrono::Duration::days(1)).await.unwrap(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_worker_completes_stranded_rollback() {
        let store = InMemoryStore::new();
        let worker = worker(&store);
        let user = Uuid::new_v4();
        crate::test_utils::charge_credits(&store, user, 6_000).await;

        // Item insert fails, and so does the inline order delete
        store.fail_next(Fault::InsertOrderItems);
        store.fail_next(Fault::DeleteOrder);
        let mut metadata = serde_json::Map::new();
        metadata.insert("type".to_string(), json!("sheet_purchase"));
        worker
            .ledger
            .purchase_with_ledger(crate::checkout::ledger::LedgerPurchase {
                user_id: user,
                total: 4_000,
                items: crate::test_utils::sample_items(&[4_000]),
                metadata,
                description: None,
            })
            .await
            .unwrap_err();
        assert_eq!(store.list_user_orders(user, 0, 10).await.unwrap().len(), 1);

        let processed = worker.run_once(Utc::now() + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(processed, 1);
        assert!(store.list_user_orders(user, 0, 10).await.unwrap().is_empty());
        assert_eq!(store.get_balance(user).await.unwrap(), 6_000);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = InMemoryStore::new();
        let worker = worker(&store);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(120)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
