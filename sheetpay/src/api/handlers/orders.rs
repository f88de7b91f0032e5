//! HTTP handlers for reading orders and waiting on deposit account details.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    api::models::orders::{AccountDetailResponse, AwaitDetailQuery, OrderResponse, PollDetailQuery},
    auth::CurrentUser,
    db::models::orders::Order,
    errors::{Error, Result},
    types::OrderId,
};

/// 200 with the details, or 204 when none arrived in time.
fn detail_response(order: Option<Order>) -> Response {
    match order.and_then(AccountDetailResponse::from_order) {
        Some(detail) => (StatusCode::OK, Json(detail)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Get one of the caller's orders with its line items.
#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn get_order(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderResponse>> {
    // Someone else's order is reported as missing
    let order = state
        .store
        .get_order(order_id)
        .await?
        .filter(|order| order.user_id == current_user.id)
        .ok_or_else(|| Error::order_not_found(order_id))?;
    let items = state.store.get_order_items(order_id).await?;
    Ok(Json(OrderResponse { order, items }))
}

/// Wait for the provider to attach deposit details to one order.
#[tracing::instrument(skip_all, fields(order_id = %order_id))]
pub async fn await_order_account_detail(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Path(order_id): Path<OrderId>,
    Query(query): Query<AwaitDetailQuery>,
) -> Result<Response> {
    let cap = state.config.settlement.awaiter.push_timeout;
    let timeout = query.timeout_ms.map(Duration::from_millis).map_or(cap, |t| t.min(cap));

    let order = state.awaiter.await_order_detail(current_user.id, order_id, timeout).await?;
    Ok(detail_response(order))
}

/// Poll for the caller's newest order carrying fresh deposit details.
#[tracing::instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn poll_account_detail(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(query): Query<PollDetailQuery>,
) -> Result<Response> {
    let defaults = &state.config.settlement.awaiter;
    let freshness = query
        .freshness_secs
        .map_or(defaults.freshness, Duration::from_secs)
        .min(defaults.max_freshness);
    let max_attempts = query
        .max_attempts
        .unwrap_or(defaults.max_attempts)
        .clamp(1, defaults.max_attempts_cap);
    let interval = query
        .interval_ms
        .map_or(defaults.interval, Duration::from_millis)
        .min(defaults.max_interval);

    let order = state
        .awaiter
        .await_detail(current_user.id, freshness, max_attempts, interval)
        .await?;
    Ok(detail_response(order))
}
