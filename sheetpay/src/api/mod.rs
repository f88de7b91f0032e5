//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! All routes live under `/api/v1`:
//!
//! - **Purchases** (`/purchases`): Start a purchase
//! - **Orders** (`/orders/{id}`, `/users/current/account-detail`): Order lookup and deposit details
//! - **Credits** (`/users/current/credits/*`): Balance and ledger history
//! - **Payments** (`/payments/{provider}/return`): Buyer returning from a provider page
//! - **Webhooks** (`/webhooks/{provider}`): Provider notifications
//! - **Admin** (`/admin/*`): Manual confirmation, cancel/refund and ledger audit

pub mod handlers;
pub mod models;
