//! Billing entities shared by the services and the store

use apihub_shared::{ReceiptStatus, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Length of one subscription billing period
pub const BILLING_PERIOD_DAYS: i64 = 30;

pub fn billing_period() -> Duration {
    Duration::days(BILLING_PERIOD_DAYS)
}

/// The parts of a marketplace service billing needs
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
}

/// A priced plan offered by a service. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionTier {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub description: Option<String>,
}

impl SubscriptionTier {
    pub fn is_paid(&self) -> bool {
        self.price_cents > 0
    }
}

/// Billing view of a user
#[derive(Debug, Clone)]
pub struct BillingUser {
    pub id: Uuid,
    pub email: Option<String>,
    pub stripe_customer_id: Option<String>,
}

/// A user's subscription to one tier of a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConsumer {
    pub id: Uuid,
    pub user_id: Uuid,
    pub service_id: Uuid,
    pub tier_id: Uuid,
    pub subscription_status: SubscriptionStatus,
    pub renewing_subscription: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_renewed: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub subscription_start_date: OffsetDateTime,
    pub payment_method_id: Option<Uuid>,
}

impl ServiceConsumer {
    /// End of the current billing period
    pub fn period_end(&self) -> OffsetDateTime {
        self.last_renewed + billing_period()
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.period_end() <= now
    }
}

/// A consumer row joined with its tier and service for listings
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDetails {
    #[serde(flatten)]
    pub consumer: ServiceConsumer,
    pub tier_name: String,
    pub price_cents: i64,
    pub service_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
}

/// Billing address snapshot taken when the card was saved
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BillingAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

/// Local mirror of a gateway payment method
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub user_id: Uuid,
    pub gateway_payment_method_id: String,
    pub brand: String,
    pub last4: String,
    pub exp_month: i32,
    pub exp_year: i32,
    pub cardholder_name: Option<String>,
    pub billing_address: BillingAddress,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Immutable record of a charge attempt
#[derive(Debug, Clone, Serialize)]
pub struct BillingReceipt {
    pub id: Uuid,
    pub from_user_id: Uuid,
    pub to_user_id: Uuid,
    pub tier_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: ReceiptStatus,
    pub gateway_reference: Option<String>,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Which side of a receipt the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptRole {
    #[default]
    Payer,
    Payee,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(last_renewed: OffsetDateTime) -> ServiceConsumer {
        ServiceConsumer {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            tier_id: Uuid::new_v4(),
            subscription_status: SubscriptionStatus::Active,
            renewing_subscription: true,
            last_renewed,
            subscription_start_date: last_renewed,
            payment_method_id: None,
        }
    }

    #[test]
    fn test_period_end_is_thirty_days_after_renewal() {
        let renewed = time::macros::datetime!(2026-01-01 00:00 UTC);
        let c = consumer(renewed);
        assert_eq!(c.period_end(), time::macros::datetime!(2026-01-31 00:00 UTC));
    }

    #[test]
    fn test_is_due_at_exact_period_end() {
        let renewed = time::macros::datetime!(2026-01-01 00:00 UTC);
        let c = consumer(renewed);
        assert!(!c.is_due(c.period_end() - Duration::seconds(1)));
        assert!(c.is_due(c.period_end()));
    }

    #[test]
    fn test_tier_free_vs_paid() {
        let mut tier = SubscriptionTier {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            name: "Free".into(),
            price_cents: 0,
            description: None,
        };
        assert!(!tier.is_paid());
        tier.price_cents = 1000;
        assert!(tier.is_paid());
    }

    #[test]
    fn test_subscription_details_flattens_consumer() {
        let renewed = time::macros::datetime!(2026-03-01 12:00 UTC);
        let c = consumer(renewed);
        let details = SubscriptionDetails {
            current_period_end: c.period_end(),
            consumer: c,
            tier_name: "Pro".into(),
            price_cents: 1000,
            service_name: "Weather API".into(),
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["subscription_status"], "ACTIVE");
        assert_eq!(json["tier_name"], "Pro");
        assert_eq!(json["current_period_end"], "2026-03-31T12:00:00Z");
    }
}
