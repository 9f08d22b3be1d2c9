//! Domain enums stored as TEXT columns

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Returned when a stored or submitted value doesn't name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Status of a consumer's subscription to a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    PendingCancellation,
    PaymentFailed,
    Expired,
}

impl SubscriptionStatus {
    pub const ALL: [SubscriptionStatus; 5] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Cancelled,
        SubscriptionStatus::PendingCancellation,
        SubscriptionStatus::PaymentFailed,
        SubscriptionStatus::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::PendingCancellation => "PENDING_CANCELLATION",
            SubscriptionStatus::PaymentFailed => "PAYMENT_FAILED",
            SubscriptionStatus::Expired => "EXPIRED",
        }
    }

    /// The consumer still has access to the tier
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::PendingCancellation
        )
    }

    /// Rows may only be hard-deleted once access has ended
    pub fn is_deletable(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELLED" => Ok(SubscriptionStatus::Cancelled),
            "PENDING_CANCELLATION" => Ok(SubscriptionStatus::PendingCancellation),
            "PAYMENT_FAILED" => Ok(SubscriptionStatus::PaymentFailed),
            "EXPIRED" => Ok(SubscriptionStatus::Expired),
            other => Err(ParseEnumError {
                kind: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// Outcome recorded on a billing receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptStatus {
    Paid,
    Failed,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Paid => "PAID",
            ReceiptStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ReceiptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAID" => Ok(ReceiptStatus::Paid),
            "FAILED" => Ok(ReceiptStatus::Failed),
            other => Err(ParseEnumError {
                kind: "receipt status",
                value: other.to_string(),
            }),
        }
    }
}

/// HTTP method of a documented endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Whether requests with this method conventionally carry a body
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch | HttpMethod::Delete)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            _ => Err(ParseEnumError {
                kind: "HTTP method",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_status_round_trips_through_text() {
        for status in SubscriptionStatus::ALL {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_subscription_status_rejects_lowercase() {
        let err = "active".parse::<SubscriptionStatus>().unwrap_err();
        assert_eq!(err.kind, "subscription status");
        assert_eq!(err.value, "active");
    }

    #[test]
    fn test_live_statuses_are_not_deletable() {
        assert!(!SubscriptionStatus::Active.is_deletable());
        assert!(!SubscriptionStatus::PendingCancellation.is_deletable());
        assert!(SubscriptionStatus::Cancelled.is_deletable());
        assert!(SubscriptionStatus::Expired.is_deletable());
        assert!(SubscriptionStatus::PaymentFailed.is_deletable());
    }

    #[test]
    fn test_subscription_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&SubscriptionStatus::PendingCancellation).unwrap();
        assert_eq!(json, "\"PENDING_CANCELLATION\"");
    }

    #[test]
    fn test_http_method_parse_is_case_insensitive() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!("Patch".parse::<HttpMethod>(), Ok(HttpMethod::Patch));
        assert!("TRACE".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_http_method_body_rules() {
        assert!(!HttpMethod::Get.allows_body());
        assert!(!HttpMethod::Head.allows_body());
        assert!(HttpMethod::Post.allows_body());
    }

    #[test]
    fn test_receipt_status_parse() {
        assert_eq!("PAID".parse::<ReceiptStatus>(), Ok(ReceiptStatus::Paid));
        assert!("REFUNDED".parse::<ReceiptStatus>().is_err());
    }
}
