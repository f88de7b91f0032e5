//! Expiry of abandoned orders.
//!
//! A buyer can walk away from a `pending` or `awaiting_deposit` order at any time. The sweeper
//! cancels such orders once they outlive their TTL. The cancel is a compare-and-set on the
//! payment status, so an order that settles while being swept stays settled.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    checkout::mark_transaction,
    config::SweeperConfig,
    db::{
        models::{
            orders::{OrderStatus, PaymentStatus},
            payment_transactions::PaymentTransactionStatusUpdate,
        },
        store::Store,
    },
    errors::{Error, Result},
    types::abbrev_uuid,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_pending: usize,
    pub expired_awaiting_deposit: usize,
}

#[derive(Clone)]
pub struct PendingOrderSweeper {
    store: Arc<dyn Store>,
    config: SweeperConfig,
}

impl PendingOrderSweeper {
    pub fn new(store: Arc<dyn Store>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let expired_pending = self.expire(PaymentStatus::Pending, self.config.pending_ttl, now).await?;
        let expired_awaiting_deposit = self
            .expire(PaymentStatus::AwaitingDeposit, self.config.awaiting_deposit_ttl, now)
            .await?;

        let report = SweepReport {
            expired_pending,
            expired_awaiting_deposit,
        };
        if report != SweepReport::default() {
            info!(
                expired_pending = report.expired_pending,
                expired_awaiting_deposit = report.expired_awaiting_deposit,
                "Expired abandoned orders"
            );
        }
        Ok(report)
    }

    async fn expire(&self, status: PaymentStatus, ttl: std::time::Duration, now: DateTime<Utc>) -> Result<usize> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| Error::Internal {
            operation: format!("convert {} order TTL", status.as_str()),
        })?;
        let stale = self
            .store
            .list_stale_orders(status, now - ttl, self.config.batch_size)
            .await?;

        let mut expired = 0;
        for order in stale {
            let cancelled = self
                .store
                .transition_order(order.id, &[status], OrderStatus::Cancelled, PaymentStatus::Cancelled)
                .await?;
            if cancelled.is_none() {
                // Settled or changed while we were looking
                continue;
            }
            expired += 1;
            info!(
                order_id = %abbrev_uuid(&order.id),
                order_number = %order.order_number,
                from = status.as_str(),
                "Expired abandoned order"
            );
            mark_transaction(
                self.store.as_ref(),
                order.id,
                &PaymentTransactionStatusUpdate {
                    status: PaymentStatus::Cancelled,
                    provider_transaction_id: None,
                    raw_response: Some(serde_json::json!({ "reason": "expired" })),
                },
            )
            .await;
        }
        Ok(expired)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            pending_ttl = ?self.config.pending_ttl,
            awaiting_deposit_ttl = ?self.config.awaiting_deposit_ttl,
            "Starting abandoned order sweeper"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Abandoned order sweeper shutting down");
                    return;
                }
            }

            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Order sweep failed");
            }
        }
    }
}
