//! HTTP request handlers for all API endpoints.
//!
//! Handlers are thin: they extract the caller, translate the request model into a checkout
//! service call and map the result back. Every business rule lives in [`crate::checkout`].
//!
//! # Handler Modules
//!
//! - [`purchases`]: Starting a purchase
//! - [`orders`]: Reading orders and waiting for deposit account details
//! - [`credits`]: The caller's credit balance and ledger
//! - [`payments`]: Buyers returning from a provider page
//! - [`webhooks`]: Provider-initiated notifications
//! - [`admin`]: Operator confirmation, cancellation, refund and ledger audit
//!
//! # Authentication
//!
//! Buyer handlers take a [`crate::auth::CurrentUser`]; operator handlers take a
//! [`crate::auth::AdminCaller`]. Provider returns and webhooks are verified by the provider
//! adapters instead.
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`] which automatically converts to
//! appropriate HTTP status codes and JSON error responses.

pub mod admin;
pub mod credits;
pub mod orders;
pub mod payments;
pub mod purchases;
pub mod webhooks;
