//! Billing errors

use apihub_shared::SubscriptionStatus;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification used by callers to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    BadRequest,
    PaymentFailed,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Subscription tier not found: {0}")]
    TierNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Payment method not found: {0}")]
    PaymentMethodNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Payment method does not belong to the caller")]
    PaymentMethodForbidden,

    #[error("Already subscribed to this tier")]
    AlreadySubscribed,

    #[error("Cannot {action} a subscription in status {status}")]
    InvalidTransition {
        status: SubscriptionStatus,
        action: &'static str,
    },

    #[error("A payment method is required for paid tiers")]
    PaymentMethodRequired,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Billing not configured: {0}")]
    Config(String),
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::ServiceNotFound(_)
            | BillingError::TierNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::PaymentMethodNotFound(_)
            | BillingError::UserNotFound(_) => ErrorKind::NotFound,
            BillingError::PaymentMethodForbidden => ErrorKind::Forbidden,
            BillingError::AlreadySubscribed
            | BillingError::InvalidTransition { .. }
            | BillingError::PaymentMethodRequired
            | BillingError::InvalidInput(_) => ErrorKind::BadRequest,
            BillingError::PaymentFailed(_) => ErrorKind::PaymentFailed,
            BillingError::Gateway(_) | BillingError::Database(_) | BillingError::Config(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::Gateway(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_variants_share_kind() {
        for err in [
            BillingError::ServiceNotFound("s".into()),
            BillingError::TierNotFound("t".into()),
            BillingError::SubscriptionNotFound("c".into()),
            BillingError::PaymentMethodNotFound("p".into()),
            BillingError::UserNotFound("u".into()),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound, "{err}");
        }
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = BillingError::InvalidTransition {
            status: SubscriptionStatus::Active,
            action: "resume",
        };
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(
            err.to_string(),
            "Cannot resume a subscription in status ACTIVE"
        );
    }

    #[test]
    fn test_infrastructure_errors_are_internal() {
        assert_eq!(BillingError::Database("x".into()).kind(), ErrorKind::Internal);
        assert_eq!(BillingError::Gateway("x".into()).kind(), ErrorKind::Internal);
        assert_eq!(BillingError::Config("x".into()).kind(), ErrorKind::Internal);
    }
}
