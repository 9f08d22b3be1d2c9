//! Billing Invariants Module
//!
//! Runnable consistency checks over subscriptions, payment methods and
//! receipts. Each check is a read-only SQL query; violations carry enough
//! context to debug the affected rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - someone may be charged incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity found, if any
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations
            .iter()
            .map(|v| v.severity)
            .min_by_key(|s| *s as u8)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateConsumerRow {
    user_id: Uuid,
    service_id: Uuid,
    row_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct TierMismatchRow {
    consumer_id: Uuid,
    user_id: Uuid,
    service_id: Uuid,
    tier_id: Uuid,
    tier_service_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct PaidWithoutMethodRow {
    consumer_id: Uuid,
    user_id: Uuid,
    tier_name: String,
    price_cents: i64,
    subscription_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ForeignMethodRow {
    consumer_id: Uuid,
    user_id: Uuid,
    payment_method_id: Uuid,
    method_owner_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct UnreferencedReceiptRow {
    receipt_id: Uuid,
    from_user_id: Uuid,
    amount_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingCustomerRow {
    user_id: Uuid,
    method_count: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        Ok(InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        ))
    }

    /// Invariant 1: one consumer row per (user, service)
    async fn check_single_consumer_per_service(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateConsumerRow> = sqlx::query_as(
            r#"
            SELECT user_id, service_id, COUNT(*) AS row_count
            FROM service_consumers
            GROUP BY user_id, service_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_consumer_per_service".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} subscriptions to one service (expected 1)",
                    row.row_count
                ),
                context: serde_json::json!({
                    "service_id": row.service_id,
                    "row_count": row.row_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: a subscription's tier belongs to its service
    async fn check_tier_belongs_to_service(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                sc.id AS consumer_id,
                sc.user_id,
                sc.service_id,
                sc.tier_id,
                t.service_id AS tier_service_id
            FROM service_consumers sc
            JOIN subscription_tiers t ON t.id = sc.tier_id
            WHERE t.service_id <> sc.service_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "tier_belongs_to_service".to_string(),
                user_ids: vec![row.user_id],
                description: "Subscription points at a tier of another service".to_string(),
                context: serde_json::json!({
                    "consumer_id": row.consumer_id,
                    "service_id": row.service_id,
                    "tier_id": row.tier_id,
                    "tier_service_id": row.tier_service_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: live paid subscriptions reference a payment method
    async fn check_paid_subscription_has_payment_method(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidWithoutMethodRow> = sqlx::query_as(
            r#"
            SELECT
                sc.id AS consumer_id,
                sc.user_id,
                t.name AS tier_name,
                t.price_cents,
                sc.subscription_status
            FROM service_consumers sc
            JOIN subscription_tiers t ON t.id = sc.tier_id
            WHERE t.price_cents > 0
              AND sc.subscription_status IN ('ACTIVE', 'PENDING_CANCELLATION')
              AND sc.payment_method_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_subscription_has_payment_method".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "{} subscription to '{}' (${:.2}) has no payment method",
                    row.subscription_status,
                    row.tier_name,
                    row.price_cents as f64 / 100.0
                ),
                context: serde_json::json!({
                    "consumer_id": row.consumer_id,
                    "price_cents": row.price_cents,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: a subscription only uses its own user's cards
    async fn check_payment_method_owner_matches(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ForeignMethodRow> = sqlx::query_as(
            r#"
            SELECT
                sc.id AS consumer_id,
                sc.user_id,
                pm.id AS payment_method_id,
                pm.user_id AS method_owner_id
            FROM service_consumers sc
            JOIN payment_methods pm ON pm.id = sc.payment_method_id
            WHERE pm.user_id <> sc.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payment_method_owner_matches".to_string(),
                user_ids: vec![row.user_id, row.method_owner_id],
                description: "Subscription is billed to another user's payment method"
                    .to_string(),
                context: serde_json::json!({
                    "consumer_id": row.consumer_id,
                    "payment_method_id": row.payment_method_id,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: PAID receipts carry the gateway reference of the charge
    async fn check_paid_receipt_has_gateway_reference(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnreferencedReceiptRow> = sqlx::query_as(
            r#"
            SELECT id AS receipt_id, from_user_id, amount_cents
            FROM billing_receipts
            WHERE status = 'PAID'
              AND gateway_reference IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_receipt_has_gateway_reference".to_string(),
                user_ids: vec![row.from_user_id],
                description: "Paid receipt has no gateway reference".to_string(),
                context: serde_json::json!({
                    "receipt_id": row.receipt_id,
                    "amount_cents": row.amount_cents,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: users with saved cards have a gateway customer
    async fn check_payment_method_user_has_customer(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingCustomerRow> = sqlx::query_as(
            r#"
            SELECT pm.user_id, COUNT(*) AS method_count
            FROM payment_methods pm
            JOIN users u ON u.id = pm.user_id
            WHERE u.stripe_customer_id IS NULL
            GROUP BY pm.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "payment_method_user_has_customer".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} saved payment method(s) but no gateway customer",
                    row.method_count
                ),
                context: serde_json::json!({
                    "method_count": row.method_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_consumer_per_service" => self.check_single_consumer_per_service().await,
            "tier_belongs_to_service" => self.check_tier_belongs_to_service().await,
            "paid_subscription_has_payment_method" => {
                self.check_paid_subscription_has_payment_method().await
            }
            "payment_method_owner_matches" => self.check_payment_method_owner_matches().await,
            "paid_receipt_has_gateway_reference" => {
                self.check_paid_receipt_has_gateway_reference().await
            }
            "payment_method_user_has_customer" => {
                self.check_payment_method_user_has_customer().await
            }
            other => Err(BillingError::InvalidInput(format!(
                "Unknown invariant check: {}",
                other
            ))),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_consumer_per_service",
            "tier_belongs_to_service",
            "paid_subscription_has_payment_method",
            "payment_method_owner_matches",
            "paid_receipt_has_gateway_reference",
            "payment_method_user_has_customer",
        ]
    }
}
