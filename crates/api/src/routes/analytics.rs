//! Owner analytics for a service

use std::collections::BTreeMap;

use apihub_shared::SubscriptionStatus;
use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    routes::services,
    state::AppState,
};

#[derive(Debug, Serialize, FromRow)]
pub struct TierAnalytics {
    pub tier_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    /// ACTIVE or PENDING_CANCELLATION
    pub live_subscribers: i64,
    pub total_subscribers: i64,
}

#[derive(Debug, FromRow)]
struct StatusCount {
    subscription_status: String,
    count: i64,
}

#[derive(Debug, FromRow)]
struct RevenueRow {
    revenue_cents: i64,
    paid_charges: i64,
    failed_charges: i64,
}

#[derive(Debug, Serialize)]
pub struct ServiceAnalytics {
    pub service_id: Uuid,
    pub subscribers_by_status: BTreeMap<String, i64>,
    pub tiers: Vec<TierAnalytics>,
    pub revenue_cents: i64,
    pub paid_charges: i64,
    pub failed_charges: i64,
}

/// Every status appears, zero when no row has it
fn status_breakdown(counts: Vec<StatusCount>) -> BTreeMap<String, i64> {
    let mut breakdown: BTreeMap<String, i64> = SubscriptionStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    for row in counts {
        *breakdown.entry(row.subscription_status).or_insert(0) += row.count;
    }
    breakdown
}

pub async fn service_analytics(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<ServiceAnalytics>> {
    services::owned_service(&state.pool, service_id, auth_user.user_id).await?;

    let counts = sqlx::query_as::<_, StatusCount>(
        r#"
        SELECT subscription_status, COUNT(*) AS count
        FROM service_consumers
        WHERE service_id = $1
        GROUP BY subscription_status
        "#,
    )
    .bind(service_id)
    .fetch_all(&state.pool)
    .await?;

    let tiers = sqlx::query_as::<_, TierAnalytics>(
        r#"
        SELECT t.id AS tier_id, t.name, t.price_cents,
               COUNT(sc.id) FILTER (
                   WHERE sc.subscription_status IN ('ACTIVE', 'PENDING_CANCELLATION')
               ) AS live_subscribers,
               COUNT(sc.id) AS total_subscribers
        FROM subscription_tiers t
        LEFT JOIN service_consumers sc ON sc.tier_id = t.id
        WHERE t.service_id = $1
        GROUP BY t.id, t.name, t.price_cents
        ORDER BY t.price_cents ASC
        "#,
    )
    .bind(service_id)
    .fetch_all(&state.pool)
    .await?;

    let revenue = sqlx::query_as::<_, RevenueRow>(
        r#"
        SELECT COALESCE(SUM(r.amount_cents) FILTER (WHERE r.status = 'PAID'), 0)::BIGINT AS revenue_cents,
               COUNT(*) FILTER (WHERE r.status = 'PAID') AS paid_charges,
               COUNT(*) FILTER (WHERE r.status = 'FAILED') AS failed_charges
        FROM billing_receipts r
        JOIN subscription_tiers t ON t.id = r.tier_id
        WHERE t.service_id = $1
        "#,
    )
    .bind(service_id)
    .fetch_one(&state.pool)
    .await?;

    tracing::debug!(user_id = %auth_user.user_id, service_id = %service_id, "Served analytics");

    Ok(Json(ServiceAnalytics {
        service_id,
        subscribers_by_status: status_breakdown(counts),
        tiers,
        revenue_cents: revenue.revenue_cents,
        paid_charges: revenue.paid_charges,
        failed_charges: revenue.failed_charges,
    }))
}
