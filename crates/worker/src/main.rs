#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ApiHub Background Worker
//!
//! Handles scheduled jobs including:
//! - Subscription renewal sweep (hourly)
//! - Billing invariant checks (daily at 3:30 AM UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use apihub_billing::{BillingService, InvariantCheckSummary, ViolationSeverity};
use apihub_shared::{create_pool, DEFAULT_MAX_CONNECTIONS};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RENEWAL_SCHEDULE: &str = "0 0 * * * *";
const DEFAULT_INVARIANT_SCHEDULE: &str = "0 30 3 * * *";
const HEARTBEAT_SCHEDULE: &str = "0 */5 * * * *";

/// Cron expression from the environment, falling back to `default`
fn schedule_from_env(name: &str, default: &'static str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing invariant checks passed"
        );
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = ?violation.user_ids,
                "{}",
                violation.description
            ),
        }
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing invariant checks found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting ApiHub Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url, DEFAULT_MAX_CONNECTIONS).await?;
    info!("Database pool created");

    let billing = match BillingService::from_env(pool) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Nothing to renew without a gateway
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Renewal sweep
    let renewal_schedule = schedule_from_env("RENEWAL_SCHEDULE", DEFAULT_RENEWAL_SCHEDULE);
    let renewal_billing = billing.clone();
    scheduler
        .add(Job::new_async(renewal_schedule.as_str(), move |_uuid, _l| {
            let billing = renewal_billing.clone();
            Box::pin(async move {
                info!("Running subscription renewal sweep");
                // The sweep logs its own summary
                if let Err(e) = billing.renewals.process_due(OffsetDateTime::now_utc()).await {
                    error!(error = %e, "Renewal sweep failed");
                }
            })
        })?)
        .await?;
    info!(schedule = %renewal_schedule, "Scheduled: Subscription renewal sweep");

    // Job 2: Invariant checks
    let invariant_schedule = schedule_from_env("INVARIANT_SCHEDULE", DEFAULT_INVARIANT_SCHEDULE);
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async(invariant_schedule.as_str(), move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!(schedule = %invariant_schedule, "Scheduled: Billing invariant checks");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async(HEARTBEAT_SCHEDULE, |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("ApiHub Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
