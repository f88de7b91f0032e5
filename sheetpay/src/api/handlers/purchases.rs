//! HTTP handler for starting a purchase.

use axum::{Json, extract::State, http::StatusCode};

use crate::{
    AppState,
    api::models::purchases::PurchaseCreate,
    auth::CurrentUser,
    checkout::orchestrator::PurchaseHandle,
    errors::Result,
};

/// Start a purchase for the calling user.
///
/// Ledger purchases come back already paid; every other method returns the next step the
/// client takes at the provider.
#[tracing::instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn start_purchase(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(body): Json<PurchaseCreate>,
) -> Result<(StatusCode, Json<PurchaseHandle>)> {
    let handle = state.orchestrator.start_purchase(body.into_request(current_user.id)).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}
