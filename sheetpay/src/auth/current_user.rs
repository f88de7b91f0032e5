use axum::{extract::FromRequestParts, http::request::Parts};
use serde::Serialize;
use tracing::{instrument, trace};

use crate::{
    AppState,
    errors::{Error, Result},
    payment_providers::signing::constant_time_eq,
    types::UserId,
};

/// The buyer making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CurrentUser {
    pub id: UserId,
}

/// An operator holding the admin token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdminCaller {
    /// Operator's own user id, when the proxy forwards one. Recorded on confirmations
    /// and refunds.
    pub operator: Option<UserId>,
}

/// Read the user header.
/// Returns:
/// - None: header absent
/// - Some(Ok(id)): header holds a user id
/// - Some(Err(error)): header present but not a UUID
fn try_user_header(parts: &Parts, header_name: &str) -> Option<Result<UserId>> {
    let value = parts.headers.get(header_name)?;
    let parsed = value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse::<UserId>().ok())
        .ok_or(Error::Unauthenticated);
    Some(parsed)
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        match try_user_header(parts, &state.config.auth.user_header) {
            Some(Ok(id)) => Ok(CurrentUser { id }),
            Some(Err(e)) => {
                trace!("Malformed user header");
                Err(e)
            }
            None => {
                trace!("No authentication credentials found in request");
                Err(Error::Unauthenticated)
            }
        }
    }
}

impl FromRequestParts<AppState> for AdminCaller {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let auth = &state.config.auth;
        let Some(token) = parts.headers.get(&auth.admin_header) else {
            return Err(Error::Unauthenticated);
        };

        // An empty configured token never matches; config validation refuses it anyway
        let expected = auth.admin_token.as_bytes();
        if expected.is_empty() || !constant_time_eq(token.as_bytes(), expected) {
            return Err(Error::Forbidden);
        }

        let operator = try_user_header(parts, &auth.user_header).transpose()?;
        Ok(AdminCaller { operator })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::store::InMemoryStore, test_utils::{TEST_ADMIN_TOKEN, create_test_config}};
    use axum::extract::FromRequestParts as _;
    use std::sync::Arc;
    use uuid::Uuid;

    fn state() -> AppState {
        crate::build_state(&create_test_config(), Arc::new(InMemoryStore::new())).unwrap()
    }

    fn parts_with_headers(headers: &[(&str, &str)]) -> Parts {
        let mut builder = axum::http::Request::builder().uri("http://localhost/test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _body) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[tokio::test]
    async fn test_current_user_from_header() {
        let state = state();
        let id = Uuid::new_v4();
        let mut parts = parts_with_headers(&[("x-sheetpay-user", &id.to_string())]);

        let user = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.id, id);
    }

    #[tokio::test]
    async fn test_current_user_missing_or_malformed() {
        let state = state();

        let mut parts = parts_with_headers(&[]);
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));

        let mut parts = parts_with_headers(&[("x-sheetpay-user", "not-a-uuid")]);
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));
    }

    #[tokio::test]
    async fn test_admin_caller_requires_matching_token() {
        let state = state();

        let mut parts = parts_with_headers(&[]);
        let err = AdminCaller::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));

        let mut parts = parts_with_headers(&[("x-sheetpay-admin", "wrong-token")]);
        let err = AdminCaller::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert!(matches!(err, Error::Forbidden));

        let operator = Uuid::new_v4();
        let mut parts = parts_with_headers(&[
            ("x-sheetpay-admin", TEST_ADMIN_TOKEN),
            ("x-sheetpay-user", &operator.to_string()),
        ]);
        let admin = AdminCaller::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(admin.operator, Some(operator));
    }
}
