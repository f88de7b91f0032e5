//! Waiting for provider-delivered account details.
//!
//! Virtual-account details arrive asynchronously (approval response or a webhook). Clients
//! that need them right after checkout either poll the user's newest order carrying details
//! ([`AccountDetailAwaiter::await_detail`]) or wait on one specific order
//! ([`AccountDetailAwaiter::await_order_detail`]), which is woken by [`DetailNotifier`]
//! as soon as the details are stored.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::{
    db::{
        models::orders::{Order, VirtualAccountInfo},
        store::Store,
    },
    errors::{Error, Result},
    types::{OrderId, UserId, abbrev_uuid},
};

/// In-process fan-out of account details, keyed by order.
///
/// Only waiters in this process are woken; waiters elsewhere fall back to the store check
/// they perform before waiting.
#[derive(Clone, Default)]
pub struct DetailNotifier {
    channels: Arc<DashMap<OrderId, watch::Sender<Option<VirtualAccountInfo>>>>,
}

impl DetailNotifier {
    pub fn subscribe(&self, order_id: OrderId) -> watch::Receiver<Option<VirtualAccountInfo>> {
        self.channels
            .entry(order_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Wake every waiter for `order_id`. A no-op when nobody is waiting.
    pub fn publish(&self, order_id: OrderId, info: VirtualAccountInfo) {
        if let Some(sender) = self.channels.get(&order_id) {
            sender.send_replace(Some(info));
        }
    }

    /// Drop the channel once its last waiter is gone.
    pub fn release(&self, order_id: OrderId) {
        self.channels.remove_if(&order_id, |_, sender| sender.receiver_count() == 0);
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[derive(Clone)]
pub struct AccountDetailAwaiter {
    store: Arc<dyn Store>,
    notifier: DetailNotifier,
}

impl AccountDetailAwaiter {
    pub fn new(store: Arc<dyn Store>, notifier: DetailNotifier) -> Self {
        Self { store, notifier }
    }

    /// Poll for the user's newest order whose account details were attached within `freshness`.
    ///
    /// Age is measured from when the details were stored, not from the order's last update,
    /// so settling or sweeping an old order does not make its details look new.
    ///
    /// Makes at most `max_attempts` store reads, waiting `interval` after each miss, so an
    /// unsuccessful call takes about `max_attempts * interval`. Returns `None` then.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn await_detail(
        &self,
        user_id: UserId,
        freshness: Duration,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<Option<Order>> {
        let freshness = chrono::Duration::from_std(freshness)
            .map_err(|_| Error::validation("Freshness window is too large"))?;

        for attempt in 1..=max_attempts {
            if let Some(order) = self.store.latest_order_with_account_info(user_id).await? {
                let issued_at = order
                    .virtual_account_info
                    .as_ref()
                    .and_then(|info| info.issued_at)
                    .unwrap_or(order.created_at);
                let cutoff = Utc::now().checked_sub_signed(freshness).unwrap_or(DateTime::<Utc>::MIN_UTC);
                if issued_at >= cutoff {
                    debug!(attempt, order_id = %abbrev_uuid(&order.id), "Account details found");
                    return Ok(Some(order));
                }
            }
            tokio::time::sleep(interval).await;
        }

        debug!(max_attempts, "No account details within the attempt budget");
        Ok(None)
    }

    /// Wait until account details are attached to `order_id`, or `timeout` passes.
    #[instrument(skip(self), fields(order_id = %abbrev_uuid(&order_id)), err)]
    pub async fn await_order_detail(&self, user_id: UserId, order_id: OrderId, timeout: Duration) -> Result<Option<Order>> {
        // Subscribe before reading so a publish between the read and the wait is not missed
        let mut rx = self.notifier.subscribe(order_id);
        let result = self.wait_on(&mut rx, user_id, order_id, timeout).await;
        drop(rx);
        self.notifier.release(order_id);
        result
    }

    async fn wait_on(
        &self,
        rx: &mut watch::Receiver<Option<VirtualAccountInfo>>,
        user_id: UserId,
        order_id: OrderId,
        timeout: Duration,
    ) -> Result<Option<Order>> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .filter(|order| order.user_id == user_id)
            .ok_or_else(|| Error::order_not_found(order_id))?;
        if order.virtual_account_info.is_some() {
            return Ok(Some(order));
        }

        let woken = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => true,
            // Sender dropped; nothing more will arrive
            Ok(Err(_)) => false,
            Err(_) => {
                debug!("Timed out waiting for account details");
                false
            }
        };
        if !woken {
            return Ok(None);
        }
        Ok(self.store.get_order(order_id).await?)
    }
}
