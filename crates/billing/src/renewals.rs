//! Period-end processing for subscriptions
//!
//! Run periodically by the worker. Each due row is settled independently; a
//! failure on one row is logged and counted without stopping the sweep.

use std::sync::Arc;

use apihub_shared::SubscriptionStatus;
use serde::Serialize;
use time::OffsetDateTime;

use crate::charges::{self, ChargeReason};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::models::{billing_period, ServiceConsumer};
use crate::store::BillingStore;

/// What happened to a single due subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Free tier rolled into a new period
    Renewed,
    /// Paid tier charged and rolled into a new period
    Charged,
    Cancelled,
    Expired,
    PaymentFailed,
    /// Row changed between listing and settling; the next sweep picks it up
    Skipped,
}

/// Counts per outcome for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalSummary {
    pub due: usize,
    pub renewed: usize,
    pub charged: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub payment_failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl RenewalSummary {
    fn record(&mut self, outcome: RenewalOutcome) {
        match outcome {
            RenewalOutcome::Renewed => self.renewed += 1,
            RenewalOutcome::Charged => self.charged += 1,
            RenewalOutcome::Cancelled => self.cancelled += 1,
            RenewalOutcome::Expired => self.expired += 1,
            RenewalOutcome::PaymentFailed => self.payment_failed += 1,
            RenewalOutcome::Skipped => self.skipped += 1,
        }
    }
}

pub struct RenewalService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl RenewalService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Settle every live subscription whose period ended at or before `now`
    pub async fn process_due(&self, now: OffsetDateTime) -> BillingResult<RenewalSummary> {
        let due = self.store.list_due_consumers(now - billing_period()).await?;
        let mut summary = RenewalSummary {
            due: due.len(),
            ..Default::default()
        };

        for consumer in due {
            let consumer_id = consumer.id;
            match self.settle(consumer, now).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    tracing::error!(
                        subscription_id = %consumer_id,
                        error = %e,
                        "Failed to settle subscription renewal"
                    );
                    summary.errors += 1;
                }
            }
        }

        tracing::info!(
            due = summary.due,
            renewed = summary.renewed,
            charged = summary.charged,
            cancelled = summary.cancelled,
            expired = summary.expired,
            payment_failed = summary.payment_failed,
            skipped = summary.skipped,
            errors = summary.errors,
            "Renewal sweep complete"
        );

        Ok(summary)
    }

    async fn settle(
        &self,
        consumer: ServiceConsumer,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        let outcome = match consumer.subscription_status {
            SubscriptionStatus::PendingCancellation => {
                self.transition(
                    &consumer,
                    SubscriptionStatus::Cancelled,
                    consumer.last_renewed,
                    RenewalOutcome::Cancelled,
                )
                .await?
            }
            SubscriptionStatus::Active if !consumer.renewing_subscription => {
                self.transition(
                    &consumer,
                    SubscriptionStatus::Expired,
                    consumer.last_renewed,
                    RenewalOutcome::Expired,
                )
                .await?
            }
            SubscriptionStatus::Active => self.renew(&consumer, now).await?,
            status => {
                return Err(BillingError::InvalidTransition {
                    status,
                    action: "renew",
                })
            }
        };

        if outcome == RenewalOutcome::Skipped {
            tracing::debug!(
                subscription_id = %consumer.id,
                "Subscription changed while settling, leaving it for the next sweep"
            );
        } else {
            tracing::info!(
                subscription_id = %consumer.id,
                user_id = %consumer.user_id,
                outcome = ?outcome,
                "Settled subscription period"
            );
        }

        Ok(outcome)
    }

    /// Apply `status` unless the row moved on since `expected` was read
    async fn transition(
        &self,
        expected: &ServiceConsumer,
        status: SubscriptionStatus,
        last_renewed: OffsetDateTime,
        outcome: RenewalOutcome,
    ) -> BillingResult<RenewalOutcome> {
        let applied = self
            .store
            .transition_consumer(expected, status, last_renewed)
            .await?;
        Ok(if applied {
            outcome
        } else {
            RenewalOutcome::Skipped
        })
    }

    async fn renew(
        &self,
        consumer: &ServiceConsumer,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        let tier = self
            .store
            .get_tier(consumer.tier_id)
            .await?
            .ok_or_else(|| BillingError::TierNotFound(consumer.tier_id.to_string()))?;

        if !tier.is_paid() {
            return self
                .transition(consumer, SubscriptionStatus::Active, now, RenewalOutcome::Renewed)
                .await;
        }

        let method = match consumer.payment_method_id {
            Some(id) => self.store.get_payment_method(id).await?,
            None => None,
        };
        let Some(method) = method else {
            tracing::warn!(
                subscription_id = %consumer.id,
                "Paid subscription has no payment method at renewal"
            );
            return self
                .transition(
                    consumer,
                    SubscriptionStatus::PaymentFailed,
                    consumer.last_renewed,
                    RenewalOutcome::PaymentFailed,
                )
                .await;
        };

        let service = self
            .store
            .get_service(consumer.service_id)
            .await?
            .ok_or_else(|| BillingError::ServiceNotFound(consumer.service_id.to_string()))?;

        // Stamp the new period before charging. Only one sweep can win the
        // stamp, and the row is no longer due while the charge is in flight.
        if !self
            .store
            .transition_consumer(consumer, SubscriptionStatus::Active, now)
            .await?
        {
            return Ok(RenewalOutcome::Skipped);
        }
        let claimed = ServiceConsumer {
            last_renewed: now,
            ..consumer.clone()
        };

        let attempt = match charges::charge_tier(
            self.store.as_ref(),
            self.gateway.as_ref(),
            consumer.user_id,
            &service,
            &tier,
            &method,
            ChargeReason::Renewal,
            now,
        )
        .await
        {
            Ok(attempt) => attempt,
            Err(e) => {
                // Hand the period back so the next sweep retries it
                if let Err(release) = self
                    .store
                    .transition_consumer(&claimed, SubscriptionStatus::Active, consumer.last_renewed)
                    .await
                {
                    tracing::error!(
                        subscription_id = %consumer.id,
                        error = %release,
                        "Failed to release renewal claim"
                    );
                }
                return Err(e);
            }
        };

        if attempt.failure.is_some() {
            return self.fail_claimed(&claimed, consumer.last_renewed).await;
        }

        Ok(RenewalOutcome::Charged)
    }

    /// End a claimed period whose charge failed, restoring the previous
    /// `last_renewed`. A user write during the charge is respected: a pending
    /// cancellation becomes cancelled rather than failed.
    async fn fail_claimed(
        &self,
        claimed: &ServiceConsumer,
        previous: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        if self
            .store
            .transition_consumer(claimed, SubscriptionStatus::PaymentFailed, previous)
            .await?
        {
            return Ok(RenewalOutcome::PaymentFailed);
        }

        let current = self
            .store
            .find_consumer(claimed.user_id, claimed.service_id)
            .await?
            .filter(|c| c.id == claimed.id && c.last_renewed == claimed.last_renewed);
        let Some(current) = current else {
            return Ok(RenewalOutcome::Skipped);
        };

        let (status, outcome) = match current.subscription_status {
            SubscriptionStatus::PendingCancellation => {
                (SubscriptionStatus::Cancelled, RenewalOutcome::Cancelled)
            }
            SubscriptionStatus::Active if !current.renewing_subscription => {
                (SubscriptionStatus::Expired, RenewalOutcome::Expired)
            }
            SubscriptionStatus::Active => {
                (SubscriptionStatus::PaymentFailed, RenewalOutcome::PaymentFailed)
            }
            _ => return Ok(RenewalOutcome::Skipped),
        };
        self.transition(&current, status, previous, outcome).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Marketplace;
    use apihub_shared::ReceiptStatus;
    use time::Duration;
    use uuid::Uuid;

    fn due_consumer(m: &Marketplace, tier_id: Uuid, now: OffsetDateTime) -> ServiceConsumer {
        let renewed = now - billing_period() - Duration::hours(1);
        let consumer = ServiceConsumer {
            id: Uuid::new_v4(),
            user_id: m.consumer_id,
            service_id: m.service_id,
            tier_id,
            subscription_status: SubscriptionStatus::Active,
            renewing_subscription: true,
            last_renewed: renewed,
            subscription_start_date: renewed,
            payment_method_id: Some(m.card_id),
        };
        m.store.put_consumer(consumer.clone());
        consumer
    }

    fn sweeper(m: &Marketplace) -> RenewalService {
        RenewalService::new(m.store(), m.gateway())
    }

    #[tokio::test]
    async fn test_paid_renewal_charges_and_rolls_period() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.due, 1);
        assert_eq!(summary.charged, 1);
        let row = m.store.consumer(consumer.id).unwrap();
        assert_eq!(row.subscription_status, SubscriptionStatus::Active);
        assert_eq!(row.last_renewed, now);

        let receipts = m.store.receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].status, ReceiptStatus::Paid);
        assert!(receipts[0].description.contains("renewal"));
    }

    #[tokio::test]
    async fn test_declined_renewal_marks_payment_failed() {
        let m = Marketplace::seed();
        m.gateway.decline_charges("insufficient_funds");
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.payment_failed, 1);
        let row = m.store.consumer(consumer.id).unwrap();
        assert_eq!(row.subscription_status, SubscriptionStatus::PaymentFailed);
        assert_eq!(row.last_renewed, consumer.last_renewed);
        assert_eq!(m.store.receipts()[0].status, ReceiptStatus::Failed);
    }

    #[tokio::test]
    async fn test_pending_cancellation_becomes_cancelled_without_charge() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let mut consumer = due_consumer(&m, m.paid_tier_id, now);
        consumer.subscription_status = SubscriptionStatus::PendingCancellation;
        consumer.renewing_subscription = false;
        m.store.put_consumer(consumer.clone());

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.cancelled, 1);
        assert_eq!(
            m.store.consumer(consumer.id).unwrap().subscription_status,
            SubscriptionStatus::Cancelled
        );
        assert!(m.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_auto_renew_off_expires() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let mut consumer = due_consumer(&m, m.paid_tier_id, now);
        consumer.renewing_subscription = false;
        m.store.put_consumer(consumer.clone());

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.expired, 1);
        assert_eq!(
            m.store.consumer(consumer.id).unwrap().subscription_status,
            SubscriptionStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_free_tier_renews_without_receipt() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.free_tier_id, now);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.renewed, 1);
        assert_eq!(m.store.consumer(consumer.id).unwrap().last_renewed, now);
        assert!(m.store.receipts().is_empty());
    }

    #[tokio::test]
    async fn test_paid_tier_without_card_fails_payment() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let mut consumer = due_consumer(&m, m.paid_tier_id, now);
        consumer.payment_method_id = None;
        m.store.put_consumer(consumer.clone());

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.payment_failed, 1);
        assert!(m.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_rows_inside_their_period_are_untouched() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let mut consumer = due_consumer(&m, m.paid_tier_id, now);
        consumer.last_renewed = now - Duration::days(3);
        m.store.put_consumer(consumer.clone());

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary, RenewalSummary::default());
        assert_eq!(m.store.consumer(consumer.id), Some(consumer));
    }

    #[tokio::test]
    async fn test_missing_tier_is_counted_as_error() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        due_consumer(&m, Uuid::new_v4(), now);
        due_consumer(&m, m.free_tier_id, now);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.due, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.renewed, 1);
    }

    /// Simulates the user unsubscribing while the renewal charge is in flight
    fn unsubscribe_during_charge(m: &Marketplace, consumer_id: Uuid) {
        let store = m.store.clone();
        m.gateway.on_charge(move || {
            if let Some(mut row) = store.consumer(consumer_id) {
                row.subscription_status = SubscriptionStatus::PendingCancellation;
                row.renewing_subscription = false;
                store.put_consumer(row);
            }
        });
    }

    #[tokio::test]
    async fn test_unsubscribe_during_charge_is_kept() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);
        unsubscribe_during_charge(&m, consumer.id);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.charged, 1);
        let row = m.store.consumer(consumer.id).unwrap();
        assert_eq!(row.subscription_status, SubscriptionStatus::PendingCancellation);
        assert!(!row.renewing_subscription);
        assert_eq!(row.last_renewed, now);
    }

    #[tokio::test]
    async fn test_declined_charge_after_unsubscribe_cancels() {
        let m = Marketplace::seed();
        m.gateway.decline_charges("card_declined");
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);
        unsubscribe_during_charge(&m, consumer.id);

        let summary = sweeper(&m).process_due(now).await.unwrap();

        assert_eq!(summary.cancelled, 1);
        let row = m.store.consumer(consumer.id).unwrap();
        assert_eq!(row.subscription_status, SubscriptionStatus::Cancelled);
        assert!(!row.renewing_subscription);
        assert_eq!(row.last_renewed, consumer.last_renewed);
    }

    #[tokio::test]
    async fn test_stale_row_from_overlapping_sweep_is_not_charged_twice() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);
        let first = sweeper(&m);
        let second = sweeper(&m);

        let summary = first.process_due(now).await.unwrap();
        let late = second.settle(consumer.clone(), now).await.unwrap();

        assert_eq!(summary.charged, 1);
        assert_eq!(late, RenewalOutcome::Skipped);
        assert_eq!(m.gateway.charges().len(), 1);
    }

    #[tokio::test]
    async fn test_user_write_from_before_the_sweep_keeps_new_period() {
        let m = Marketplace::seed();
        let now = OffsetDateTime::now_utc();
        let consumer = due_consumer(&m, m.paid_tier_id, now);

        sweeper(&m).process_due(now).await.unwrap();
        let mut stale = consumer.clone();
        stale.subscription_status = SubscriptionStatus::PendingCancellation;
        stale.renewing_subscription = false;
        m.store.update_consumer(&stale).await.unwrap();

        let row = m.store.consumer(consumer.id).unwrap();
        assert_eq!(row.subscription_status, SubscriptionStatus::PendingCancellation);
        assert_eq!(row.last_renewed, now);
        assert_eq!(sweeper(&m).process_due(now).await.unwrap().due, 0);
    }
}
