use crate::db::errors::StoreError;
use crate::payment_providers::PaymentError;
use crate::types::Amount;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed amount, method or missing required buyer fields; nothing was written
    #[error("{message}")]
    Validation { message: String },

    /// Ledger purchase exceeds the balance; nothing was written
    #[error("Insufficient credit: balance {current_balance}, required {required}")]
    InsufficientCredit { current_balance: Amount, required: Amount },

    /// Remote or network failure at a payment provider
    #[error("Payment provider error: {message}")]
    Provider { message: String },

    /// Caller identity missing or malformed
    #[error("Not authenticated")]
    Unauthenticated,

    /// Caller is not allowed to act on the resource
    #[error("Forbidden")]
    Forbidden,

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Request conflicts with the current state of the resource
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Storage operation error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::Conflict { message: message.into() }
    }

    pub fn order_not_found(id: impl ToString) -> Self {
        Error::NotFound {
            resource: "Order".to_string(),
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::Provider { .. } => StatusCode::BAD_GATEWAY,
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Store(store_err) => match store_err {
                StoreError::NotFound => StatusCode::NOT_FOUND,
                StoreError::UniqueViolation { .. } => StatusCode::CONFLICT,
                StoreError::ForeignKeyViolation { .. } | StoreError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for the response body
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation_error",
            Error::InsufficientCredit { .. } => "insufficient_credit",
            Error::Provider { .. } => "provider_error",
            Error::Unauthenticated => "unauthenticated",
            Error::Forbidden => "forbidden",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "conflict",
            Error::Store(StoreError::UniqueViolation { .. }) => "conflict",
            Error::Internal { .. } | Error::Store(_) | Error::Other(_) => "internal_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Validation { message } => message.clone(),
            Error::InsufficientCredit { current_balance, required } => {
                format!("Insufficient credit: {required} required, {current_balance} available")
            }
            Error::Provider { .. } => "The payment provider could not process the request. Please try again.".to_string(),
            Error::Unauthenticated => "Authentication required".to_string(),
            Error::Forbidden => "You do not have access to this resource".to_string(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::Store(StoreError::NotFound) => "Resource not found".to_string(),
            Error::Store(StoreError::UniqueViolation { .. }) => "Resource already exists".to_string(),
            Error::Store(StoreError::ForeignKeyViolation { .. }) => "Invalid reference to related resource".to_string(),
            Error::Store(StoreError::CheckViolation { .. }) => "Invalid data provided".to_string(),
            Error::Internal { .. } | Error::Store(StoreError::Other(_)) | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl From<PaymentError> for Error {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidData(message) => Error::Validation { message },
            PaymentError::UnsupportedMethod(method) => Error::Validation {
                message: format!("Payment method {method} is currently unavailable"),
            },
            PaymentError::AmountMismatch { expected, approved } => Error::Validation {
                message: format!("Approved amount {approved} does not match order total {expected}"),
            },
            PaymentError::NotApproved(message) => Error::Validation {
                message: format!("Payment was not approved: {message}"),
            },
            PaymentError::SignatureInvalid => Error::Validation {
                message: "Invalid webhook signature".to_string(),
            },
            other => Error::Provider { message: other.to_string() },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Store(StoreError::Other(_)) | Error::Internal { .. } | Error::Other(_) | Error::Provider { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Store(_) => {
                tracing::warn!("Storage constraint error: {}", self);
            }
            Error::InsufficientCredit { .. } | Error::Conflict { .. } => {
                tracing::warn!("Request rejected: {}", self);
            }
            Error::Unauthenticated | Error::Forbidden => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::Validation { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        let mut body = json!({
            "error": self.code(),
            "message": self.user_message(),
        });
        if let Error::InsufficientCredit { current_balance, required } = &self {
            body["current_balance"] = json!(current_balance);
            body["required"] = json!(required);
        }
        (status, Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::orders::PaymentMethod;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::InsufficientCredit {
                current_balance: 3000,
                required: 5000
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(Error::conflict("x").status_code(), StatusCode::CONFLICT);
        assert_eq!(Error::Store(StoreError::NotFound).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_payment_errors_map_to_taxonomy() {
        assert!(matches!(
            Error::from(PaymentError::UnsupportedMethod(PaymentMethod::VirtualAccount)),
            Error::Validation { .. }
        ));
        assert!(matches!(
            Error::from(PaymentError::ProviderApi("timeout".to_string())),
            Error::Provider { .. }
        ));
    }

    #[test]
    fn test_internal_details_are_not_leaked() {
        let err = Error::Other(anyhow::anyhow!("connection refused to 10.0.0.3"));
        assert_eq!(err.user_message(), "Internal server error");
        let err = Error::Provider {
            message: "HTTP 500 from gateway with secret payload".to_string(),
        };
        assert!(!err.user_message().contains("secret"));
    }
}
