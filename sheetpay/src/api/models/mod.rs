//! API request and response data models.
//!
//! These are the JSON shapes of the HTTP API. Handlers convert between them and the
//! checkout service types, so the wire format can stay stable while the services change.

pub mod credits;
pub mod orders;
pub mod pagination;
pub mod payments;
pub mod purchases;
