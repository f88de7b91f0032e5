//! HTTP handlers for the caller's credit balance and ledger.

use axum::{
    Json,
    extract::{Query, State},
};

use crate::{
    AppState,
    api::models::{
        credits::{CreditEntryResponse, UserBalanceResponse},
        pagination::{PaginatedResponse, Pagination},
    },
    auth::CurrentUser,
    errors::Result,
};

#[tracing::instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn get_balance(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<UserBalanceResponse>> {
    let balance = state.ledger.balance(current_user.id).await?;
    Ok(Json(UserBalanceResponse {
        user_id: current_user.id,
        balance,
    }))
}

/// Newest entries first.
#[tracing::instrument(skip_all, fields(user_id = %current_user.id))]
pub async fn list_transactions(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Query(pagination): Query<Pagination>,
) -> Result<Json<PaginatedResponse<CreditEntryResponse>>> {
    let (skip, limit) = pagination.params();
    let entries = state.ledger.entries(current_user.id, skip, limit).await?;
    let data = entries.into_iter().map(CreditEntryResponse::from).collect();
    Ok(Json(PaginatedResponse::new(data, skip, limit)))
}

#[cfg(test)]
mod tests {
    use crate::api::models::{
        credits::{CreditEntryResponse, UserBalanceResponse},
        pagination::PaginatedResponse,
    };
    use crate::test_utils::{charge_credits, create_test_app, create_test_config, user_headers};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_balance_and_transactions() {
        let (server, _bg, store) = create_test_app().await;
        let user = Uuid::new_v4();
        charge_credits(&store, user, 5_000).await;
        charge_credits(&store, user, 2_000).await;
        charge_credits(&store, Uuid::new_v4(), 9_999).await;
        let (header, value) = user_headers(&create_test_config(), user);

        let response = server
            .get("/api/v1/users/current/credits/balance")
            .add_header(header.as_str(), value.as_str())
            .await;
        response.assert_status_ok();
        let balance: UserBalanceResponse = response.json();
        assert_eq!(balance.user_id, user);
        assert_eq!(balance.balance, 7_000);

        let response = server
            .get("/api/v1/users/current/credits/transactions?limit=1")
            .add_header(header.as_str(), value.as_str())
            .await;
        response.assert_status_ok();
        let page: PaginatedResponse<CreditEntryResponse> = response.json();
        assert_eq!(page.limit, 1);
        assert_eq!(page.data.len(), 1);
        assert_eq!(page.data[0].balance_after, 7_000);

        let response = server
            .get("/api/v1/users/current/credits/transactions")
            .add_header(header.as_str(), value.as_str())
            .await;
        let page: PaginatedResponse<CreditEntryResponse> = response.json();
        assert_eq!(page.data.len(), 2);
    }
}
