//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases for readability:
//!
//! - [`UserId`]: Storefront user (owner of orders and credit balance)
//! - [`OrderId`]: Order identifier
//! - [`ProductId`]: Catalog item (a sheet) that can be purchased
//!
//! Monetary values are integers in the minor currency unit ([`Amount`]).

use uuid::Uuid;

pub type UserId = Uuid;
pub type OrderId = Uuid;
pub type ProductId = Uuid;
pub type OutboxTaskId = Uuid;

/// Money in the minor currency unit. Signed so ledger deltas share the type.
pub type Amount = i64;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
