//! Persistence layer.
//!
//! Everything the checkout services write goes through the [`store::Store`] trait. Each
//! trait method is a single atomic statement against the backing store: the services never
//! hold a multi-statement transaction, so the few places that need atomicity (balance
//! movements, settlement check-and-set, status transitions) are expressed as one
//! conditional statement each.
//!
//! # Modules
//!
//! - [`models`]: Record structures matching table schemas
//! - [`store`]: The [`store::Store`] trait with in-memory and PostgreSQL implementations
//! - [`errors`]: Storage error types

pub mod errors;
pub mod models;
pub mod store;
