//! Subscription lifecycle
//!
//! A consumer holds at most one row per service (`service_consumers`). The
//! row moves through [`SubscriptionStatus`] as the consumer subscribes,
//! cancels, resumes and switches tiers; the renewal sweep in
//! [`crate::renewals`] handles period ends.

use std::sync::Arc;

use apihub_shared::SubscriptionStatus;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::charges::{self, ChargeReason};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::models::{
    BillingReceipt, ServiceConsumer, ServiceSummary, SubscriptionDetails, SubscriptionTier,
};
use crate::store::BillingStore;

/// Parameters for a new subscription
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub service_id: Uuid,
    pub tier_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    pub auto_renewal: bool,
}

/// Result of a successful subscribe
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResult {
    pub subscription: ServiceConsumer,
    /// Receipt for the first period. `None` for free tiers and for a
    /// reactivated pending cancellation.
    pub receipt: Option<BillingReceipt>,
}

/// Subscription service operating on behalf of an explicit caller
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Subscribe `user_id` to a tier, charging the first period for paid tiers.
    ///
    /// Any existing row for the service is overwritten, unless it is already
    /// ACTIVE on the requested tier. A declined charge leaves the row as it
    /// was and records a FAILED receipt.
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        request: SubscribeRequest,
    ) -> BillingResult<SubscribeResult> {
        let service = self.service(request.service_id).await?;
        let tier = self.tier(request.tier_id).await?;
        if tier.service_id != service.id {
            return Err(BillingError::TierNotFound(request.tier_id.to_string()));
        }

        let payment_method = match request.payment_method_id {
            Some(id) => Some(charges::owned_payment_method(self.store.as_ref(), user_id, id).await?),
            None => None,
        };
        if tier.is_paid() && payment_method.is_none() {
            return Err(BillingError::PaymentMethodRequired);
        }

        if let Some(existing) = self.store.find_consumer(user_id, service.id).await? {
            if existing.tier_id == tier.id {
                match existing.subscription_status {
                    SubscriptionStatus::Active => return Err(BillingError::AlreadySubscribed),
                    // The current period is already paid for
                    SubscriptionStatus::PendingCancellation => {
                        return self
                            .reactivate(existing, request.auto_renewal, payment_method.as_ref().map(|m| m.id))
                            .await;
                    }
                    _ => {}
                }
            }
        }

        let now = OffsetDateTime::now_utc();

        let receipt = match &payment_method {
            Some(method) if tier.is_paid() => {
                let attempt = charges::charge_tier(
                    self.store.as_ref(),
                    self.gateway.as_ref(),
                    user_id,
                    &service,
                    &tier,
                    method,
                    ChargeReason::NewSubscription,
                    now,
                )
                .await?;
                if let Some(reason) = attempt.failure {
                    return Err(BillingError::PaymentFailed(reason));
                }
                Some(attempt.receipt)
            }
            _ => None,
        };

        let subscription = self
            .store
            .upsert_consumer(&ServiceConsumer {
                id: Uuid::new_v4(),
                user_id,
                service_id: service.id,
                tier_id: tier.id,
                subscription_status: SubscriptionStatus::Active,
                renewing_subscription: request.auto_renewal,
                last_renewed: now,
                subscription_start_date: now,
                payment_method_id: payment_method.as_ref().map(|m| m.id),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            service_id = %service.id,
            tier_id = %tier.id,
            subscription_id = %subscription.id,
            paid = tier.is_paid(),
            "Subscribed to tier"
        );

        Ok(SubscribeResult {
            subscription,
            receipt,
        })
    }

    /// Subscribing again before a pending cancellation takes effect keeps the
    /// current period instead of charging for a new one
    async fn reactivate(
        &self,
        mut consumer: ServiceConsumer,
        auto_renewal: bool,
        payment_method_id: Option<Uuid>,
    ) -> BillingResult<SubscribeResult> {
        consumer.subscription_status = SubscriptionStatus::Active;
        consumer.renewing_subscription = auto_renewal;
        if payment_method_id.is_some() {
            consumer.payment_method_id = payment_method_id;
        }
        self.store.update_consumer(&consumer).await?;

        tracing::info!(
            user_id = %consumer.user_id,
            tier_id = %consumer.tier_id,
            subscription_id = %consumer.id,
            "Reactivated pending cancellation on subscribe"
        );

        Ok(SubscribeResult {
            subscription: consumer,
            receipt: None,
        })
    }

    /// Cancel at period end (paid tiers) or immediately (free tiers)
    pub async fn unsubscribe(&self, user_id: Uuid, tier_id: Uuid) -> BillingResult<ServiceConsumer> {
        let mut consumer = self.consumer_for_tier(user_id, tier_id).await?;
        if consumer.subscription_status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition {
                status: consumer.subscription_status,
                action: "unsubscribe from",
            });
        }

        let tier = self.tier(tier_id).await?;
        consumer.subscription_status = if tier.is_paid() {
            SubscriptionStatus::PendingCancellation
        } else {
            SubscriptionStatus::Cancelled
        };
        consumer.renewing_subscription = false;
        self.store.update_consumer(&consumer).await?;

        tracing::info!(
            user_id = %user_id,
            tier_id = %tier_id,
            status = %consumer.subscription_status,
            "Unsubscribed from tier"
        );

        Ok(consumer)
    }

    /// Undo a pending cancellation
    pub async fn resume(&self, user_id: Uuid, tier_id: Uuid) -> BillingResult<ServiceConsumer> {
        let mut consumer = self.consumer_for_tier(user_id, tier_id).await?;
        if consumer.subscription_status != SubscriptionStatus::PendingCancellation {
            return Err(BillingError::InvalidTransition {
                status: consumer.subscription_status,
                action: "resume",
            });
        }

        consumer.subscription_status = SubscriptionStatus::Active;
        consumer.renewing_subscription = true;
        self.store.update_consumer(&consumer).await?;

        tracing::info!(user_id = %user_id, tier_id = %tier_id, "Resumed subscription");

        Ok(consumer)
    }

    /// Move an active subscription to another tier of the same service.
    ///
    /// Nothing is charged now; the next renewal bills the new price.
    pub async fn switch_tier(
        &self,
        user_id: Uuid,
        old_tier_id: Uuid,
        new_tier_id: Uuid,
    ) -> BillingResult<ServiceConsumer> {
        let mut consumer = self.consumer_for_tier(user_id, old_tier_id).await?;
        if old_tier_id == new_tier_id {
            return Err(BillingError::InvalidInput(
                "New tier must differ from the current tier".to_string(),
            ));
        }

        let new_tier = self.tier(new_tier_id).await?;
        if new_tier.service_id != consumer.service_id {
            return Err(BillingError::InvalidInput(
                "Tier belongs to a different service".to_string(),
            ));
        }
        if consumer.subscription_status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition {
                status: consumer.subscription_status,
                action: "switch tier of",
            });
        }
        if new_tier.is_paid() && consumer.payment_method_id.is_none() {
            return Err(BillingError::PaymentMethodRequired);
        }

        consumer.tier_id = new_tier.id;
        self.store.update_consumer(&consumer).await?;

        tracing::info!(
            user_id = %user_id,
            from_tier = %old_tier_id,
            to_tier = %new_tier_id,
            "Switched subscription tier"
        );

        Ok(consumer)
    }

    /// Point a subscription at another of the caller's payment methods
    pub async fn update_payment_method(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
        payment_method_id: Uuid,
        auto_renewal: Option<bool>,
    ) -> BillingResult<ServiceConsumer> {
        let mut consumer = self.consumer_for_tier(user_id, tier_id).await?;
        let method =
            charges::owned_payment_method(self.store.as_ref(), user_id, payment_method_id).await?;

        consumer.payment_method_id = Some(method.id);
        if let Some(auto_renewal) = auto_renewal {
            consumer.renewing_subscription = auto_renewal;
        }
        self.store.update_consumer(&consumer).await?;

        tracing::info!(
            user_id = %user_id,
            tier_id = %tier_id,
            payment_method_id = %method.id,
            "Updated subscription payment method"
        );

        Ok(consumer)
    }

    /// Remove a subscription whose access has ended
    pub async fn delete_subscription(&self, user_id: Uuid, tier_id: Uuid) -> BillingResult<()> {
        let consumer = self.consumer_for_tier(user_id, tier_id).await?;
        if !consumer.subscription_status.is_deletable() {
            return Err(BillingError::InvalidTransition {
                status: consumer.subscription_status,
                action: "delete",
            });
        }

        self.store.delete_consumer(consumer.id).await?;

        tracing::info!(
            user_id = %user_id,
            tier_id = %tier_id,
            subscription_id = %consumer.id,
            "Deleted subscription"
        );

        Ok(())
    }

    pub async fn list_subscriptions(&self, user_id: Uuid) -> BillingResult<Vec<SubscriptionDetails>> {
        self.store.list_subscription_details(user_id).await
    }

    pub async fn get_subscription(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<SubscriptionDetails> {
        self.store
            .list_subscription_details(user_id)
            .await?
            .into_iter()
            .find(|d| d.consumer.tier_id == tier_id)
            .ok_or_else(|| BillingError::SubscriptionNotFound(tier_id.to_string()))
    }

    async fn service(&self, service_id: Uuid) -> BillingResult<ServiceSummary> {
        self.store
            .get_service(service_id)
            .await?
            .ok_or_else(|| BillingError::ServiceNotFound(service_id.to_string()))
    }

    async fn tier(&self, tier_id: Uuid) -> BillingResult<SubscriptionTier> {
        self.store
            .get_tier(tier_id)
            .await?
            .ok_or_else(|| BillingError::TierNotFound(tier_id.to_string()))
    }

    async fn consumer_for_tier(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<ServiceConsumer> {
        self.store
            .find_consumer_by_tier(user_id, tier_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(tier_id.to_string()))
    }
}
