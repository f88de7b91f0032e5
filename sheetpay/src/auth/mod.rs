//! Caller identity.
//!
//! Authentication happens in the upstream auth proxy, which forwards the authenticated user
//! id in `auth.user_header`. Operator routes additionally require the shared admin token in
//! `auth.admin_header`. The extractors in [`current_user`] turn those headers into typed
//! identities for the handlers.

pub mod current_user;

pub use current_user::{AdminCaller, CurrentUser};
