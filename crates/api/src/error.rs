//! API error type and its JSON rendering

use apihub_billing::{BillingError, ErrorKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::tester::TesterError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Billing is not available")]
    ServiceUnavailable,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Database(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Database(detail) | ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => ApiError::NotFound(e.to_string()),
            ErrorKind::Forbidden => ApiError::Forbidden(e.to_string()),
            ErrorKind::BadRequest => ApiError::Validation(e.to_string()),
            ErrorKind::PaymentFailed => match e {
                BillingError::PaymentFailed(reason) => ApiError::PaymentFailed(reason),
                other => ApiError::PaymentFailed(other.to_string()),
            },
            ErrorKind::Internal => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ApiError::Conflict("A record with the same identity already exists".to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                ApiError::Conflict("Record is still referenced by other data".to_string())
            }
            _ => ApiError::Database(e.to_string()),
        }
    }
}

impl From<TesterError> for ApiError {
    fn from(e: TesterError) -> Self {
        ApiError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apihub_shared::SubscriptionStatus;

    async fn body_json(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_billing_errors_map_by_kind() {
        let cases = [
            (BillingError::TierNotFound("t".into()), StatusCode::NOT_FOUND),
            (BillingError::PaymentMethodForbidden, StatusCode::FORBIDDEN),
            (BillingError::AlreadySubscribed, StatusCode::BAD_REQUEST),
            (
                BillingError::InvalidTransition {
                    status: SubscriptionStatus::Cancelled,
                    action: "resume",
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::PaymentFailed("card_declined".into()),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::Gateway("timeout".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (billing, expected) in cases {
            let label = billing.to_string();
            assert_eq!(ApiError::from(billing).status(), expected, "{label}");
        }
    }

    #[test]
    fn test_tester_errors_are_bad_request() {
        let err = ApiError::from(TesterError::MissingPathParam("id".into()));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Missing value for path parameter 'id'");
    }

    #[test]
    fn test_row_not_found_is_404() {
        assert_eq!(
            ApiError::from(sqlx::Error::RowNotFound).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_response_body_shape() {
        let (status, body) = body_json(ApiError::Validation("limit must be 1..=100".into())).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "limit must be 1..=100");
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let (status, body) =
            body_json(ApiError::from(BillingError::Database("relation missing".into()))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }

    #[tokio::test]
    async fn test_billing_message_is_preserved() {
        let (_, body) = body_json(ApiError::from(BillingError::AlreadySubscribed)).await;
        assert_eq!(body["error"], "Already subscribed to this tier");
    }
}
