//! HTTP handlers for buyers returning from a provider page.
//!
//! Providers send the buyer back either with a plain redirect (query parameters) or with an
//! auto-submitted form. Every parameter becomes part of the raw confirmation the provider
//! adapter verifies server-to-server; the client's word alone never settles an order.

use std::collections::BTreeMap;

use axum::{
    Form, Json,
    extract::{Path, Query, State},
};
use serde_json::{Map, Value};

use crate::{
    AppState,
    api::models::payments::SettlementResponse,
    errors::{Error, Result},
    payment_providers::ProviderKind,
    types::OrderId,
};

async fn settle_return(state: &AppState, provider: &str, params: BTreeMap<String, String>) -> Result<SettlementResponse> {
    let kind: ProviderKind = provider.parse()?;
    let order_id: OrderId = params
        .get("order_id")
        .ok_or_else(|| Error::validation("Missing order_id"))?
        .parse()
        .map_err(|_| Error::validation("Invalid order_id"))?;

    let raw: Map<String, Value> = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    let outcome = state.reconciler.confirm_return(kind, order_id, &raw).await?;
    Ok(outcome.into())
}

/// `GET` return: everything arrives in the query string.
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn provider_return(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<SettlementResponse>> {
    Ok(Json(settle_return(&state, &provider, params).await?))
}

/// `POST` return: form fields win over query parameters of the same name.
#[tracing::instrument(skip_all, fields(provider = %provider))]
pub async fn provider_return_form(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(mut params): Query<BTreeMap<String, String>>,
    Form(form): Form<BTreeMap<String, String>>,
) -> Result<Json<SettlementResponse>> {
    params.extend(form);
    Ok(Json(settle_return(&state, &provider, params).await?))
}
