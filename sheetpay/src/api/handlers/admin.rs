//! HTTP handlers for operators.

use axum::{
    Json,
    extract::{Path, State},
};

use crate::{
    AppState,
    api::models::payments::{ConfirmOrderRequest, SettlementResponse},
    auth::AdminCaller,
    checkout::{
        cancellation::CancelRequest,
        ledger::LedgerAudit,
        reconciler::{Confirmation, SettlementTrigger},
    },
    db::models::orders::Order,
    errors::Result,
    types::{OrderId, UserId},
};

/// Confirm that a bank transfer arrived.
#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn confirm_order(
    State(state): State<AppState>,
    admin: AdminCaller,
    Path(order_id): Path<OrderId>,
    Json(body): Json<ConfirmOrderRequest>,
) -> Result<Json<SettlementResponse>> {
    let confirmation = Confirmation::builder()
        .trigger(SettlementTrigger::Admin)
        .maybe_provider_transaction_id(body.transaction_id)
        .maybe_confirmed_by(admin.operator)
        .maybe_depositor_name(body.depositor_name)
        .maybe_note(body.note)
        .build();
    let outcome = state.reconciler.complete_order(order_id, confirmation).await?;
    Ok(Json(outcome.into()))
}

/// Cancel an unpaid order, or refund a paid one with `refund: true`.
#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn cancel_order(
    State(state): State<AppState>,
    admin: AdminCaller,
    Path(order_id): Path<OrderId>,
    Json(body): Json<CancelRequest>,
) -> Result<Json<Order>> {
    let order = state.cancellation.handle(order_id, &body, admin.operator).await?;
    Ok(Json(order))
}

/// Replay a user's ledger against the stored balance.
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn audit_credits(
    State(state): State<AppState>,
    _admin: AdminCaller,
    Path(user_id): Path<UserId>,
) -> Result<Json<LedgerAudit>> {
    Ok(Json(state.ledger.audit(user_id).await?))
}
