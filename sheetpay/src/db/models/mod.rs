//! Persisted record types and the create/update requests for them.

pub mod credits;
pub mod entitlements;
pub mod orders;
pub mod outbox;
pub mod payment_transactions;
