//! Saved cards
//!
//! Cards are collected client-side against a setup intent, then mirrored
//! locally with their brand, expiry and billing address.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::charges;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, SetupIntentSecret};
use crate::models::PaymentMethod;
use crate::store::BillingStore;

pub struct PaymentMethodService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl PaymentMethodService {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Start collecting a card for off-session use
    pub async fn create_setup_intent(&self, user_id: Uuid) -> BillingResult<SetupIntentSecret> {
        let customer_id =
            charges::ensure_customer(self.store.as_ref(), self.gateway.as_ref(), user_id).await?;
        self.gateway.create_setup_intent(&customer_id).await
    }

    /// Mirror a confirmed gateway card into the caller's wallet.
    ///
    /// Saving a card that is already mirrored for the caller returns the
    /// existing row.
    pub async fn save_payment_method(
        &self,
        user_id: Uuid,
        gateway_payment_method_id: &str,
    ) -> BillingResult<PaymentMethod> {
        let gateway_payment_method_id = gateway_payment_method_id.trim();
        if gateway_payment_method_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "payment_method_id is required".to_string(),
            ));
        }

        if let Some(existing) = self
            .store
            .find_payment_method_by_gateway_id(gateway_payment_method_id)
            .await?
        {
            if existing.user_id != user_id {
                return Err(BillingError::PaymentMethodForbidden);
            }
            return Ok(existing);
        }

        let customer_id =
            charges::ensure_customer(self.store.as_ref(), self.gateway.as_ref(), user_id).await?;
        let card = self
            .gateway
            .retrieve_payment_method(gateway_payment_method_id)
            .await?;

        let card = match card.customer_id.as_deref() {
            Some(owner) if owner != customer_id => {
                tracing::warn!(
                    user_id = %user_id,
                    payment_method_id = %gateway_payment_method_id,
                    "Card is attached to another customer"
                );
                return Err(BillingError::PaymentMethodForbidden);
            }
            Some(_) => card,
            None => {
                self.gateway
                    .attach_payment_method(gateway_payment_method_id, &customer_id)
                    .await?
            }
        };

        let method = PaymentMethod {
            id: Uuid::new_v4(),
            user_id,
            gateway_payment_method_id: card.id,
            brand: card.brand,
            last4: card.last4,
            exp_month: card.exp_month,
            exp_year: card.exp_year,
            cardholder_name: card.cardholder_name,
            billing_address: card.address,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_payment_method(&method).await?;

        tracing::info!(
            user_id = %user_id,
            payment_method_id = %method.id,
            brand = %method.brand,
            last4 = %method.last4,
            "Saved payment method"
        );

        Ok(method)
    }

    pub async fn list_payment_methods(&self, user_id: Uuid) -> BillingResult<Vec<PaymentMethod>> {
        self.store.list_payment_methods(user_id).await
    }

    /// Detach at the gateway, then drop the local row.
    ///
    /// If the detach fails the local row is kept.
    pub async fn delete_payment_method(&self, user_id: Uuid, id: Uuid) -> BillingResult<()> {
        let method = charges::owned_payment_method(self.store.as_ref(), user_id, id).await?;

        if let Err(e) = self
            .gateway
            .detach_payment_method(&method.gateway_payment_method_id)
            .await
        {
            tracing::error!(
                user_id = %user_id,
                payment_method_id = %id,
                error = %e,
                "Failed to detach payment method"
            );
            return Err(e);
        }

        self.store.delete_payment_method(method.id).await?;

        tracing::info!(user_id = %user_id, payment_method_id = %id, "Deleted payment method");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::subscriptions::{SubscribeRequest, SubscriptionService};
    use crate::testing::Marketplace;

    fn service(m: &Marketplace) -> PaymentMethodService {
        PaymentMethodService::new(m.store(), m.gateway())
    }

    #[tokio::test]
    async fn test_setup_intent_creates_customer_on_first_use() {
        let m = Marketplace::seed();
        let svc = service(&m);

        let first = svc.create_setup_intent(m.consumer_id).await.unwrap();
        let second = svc.create_setup_intent(m.consumer_id).await.unwrap();

        assert_eq!(m.gateway.customers().len(), 1);
        assert!(m.store.customer_id(m.consumer_id).is_some());
        assert_ne!(first.setup_intent_id, second.setup_intent_id);
        assert!(!first.client_secret.is_empty());
    }

    #[tokio::test]
    async fn test_save_attaches_unattached_card_and_mirrors_metadata() {
        let m = Marketplace::seed();
        m.gateway.add_card("pm_new", None);
        let svc = service(&m);

        let saved = svc.save_payment_method(m.consumer_id, "pm_new").await.unwrap();

        let customer = m.store.customer_id(m.consumer_id).unwrap();
        assert_eq!(m.gateway.card("pm_new").unwrap().customer_id, Some(customer));
        assert_eq!(saved.user_id, m.consumer_id);
        assert_eq!(saved.brand, "visa");
        assert_eq!(saved.last4, "4242");
        assert_eq!(saved.billing_address.city.as_deref(), Some("Springfield"));
        assert_eq!(saved.cardholder_name.as_deref(), Some("Test Holder"));
    }

    #[tokio::test]
    async fn test_save_card_attached_to_another_customer_is_forbidden() {
        let m = Marketplace::seed();
        m.gateway.add_card("pm_stolen", Some("cus_someone_else"));
        let svc = service(&m);

        let err = svc
            .save_payment_method(m.consumer_id, "pm_stolen")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(m.store.payment_method_count(), 1);
    }

    #[tokio::test]
    async fn test_save_is_idempotent_for_the_owner() {
        let m = Marketplace::seed();
        m.gateway.add_card("pm_new", None);
        let svc = service(&m);

        let first = svc.save_payment_method(m.consumer_id, "pm_new").await.unwrap();
        let second = svc.save_payment_method(m.consumer_id, "pm_new").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(svc.list_payment_methods(m.consumer_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_card_mirrored_for_another_user_is_forbidden() {
        let m = Marketplace::seed();
        let svc = service(&m);

        let err = svc
            .save_payment_method(m.owner_id, "pm_consumer_visa")
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::PaymentMethodForbidden));
    }

    #[tokio::test]
    async fn test_save_unknown_card_is_not_found() {
        let m = Marketplace::seed();
        let svc = service(&m);

        let err = svc
            .save_payment_method(m.consumer_id, "pm_missing")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_detaches_then_removes_row() {
        let m = Marketplace::seed();
        let svc = service(&m);

        svc.delete_payment_method(m.consumer_id, m.card_id)
            .await
            .unwrap();

        assert_eq!(m.gateway.detached(), vec!["pm_consumer_visa".to_string()]);
        assert_eq!(m.store.payment_method_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_keeps_row_when_detach_fails() {
        let m = Marketplace::seed();
        m.gateway.fail_detach();
        let svc = service(&m);

        let err = svc
            .delete_payment_method(m.consumer_id, m.card_id)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(m.store.payment_method_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_other_users_card_is_forbidden() {
        let m = Marketplace::seed();
        let svc = service(&m);

        let err = svc
            .delete_payment_method(m.owner_id, m.card_id)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::PaymentMethodForbidden));
        assert!(m.gateway.detached().is_empty());
    }

    #[tokio::test]
    async fn test_delete_clears_subscription_reference() {
        let m = Marketplace::seed();
        let subscriptions = SubscriptionService::new(m.store(), m.gateway());
        let created = subscriptions
            .subscribe(
                m.consumer_id,
                SubscribeRequest {
                    service_id: m.service_id,
                    tier_id: m.paid_tier_id,
                    payment_method_id: Some(m.card_id),
                    auto_renewal: true,
                },
            )
            .await
            .unwrap()
            .subscription;

        service(&m)
            .delete_payment_method(m.consumer_id, m.card_id)
            .await
            .unwrap();

        assert_eq!(m.store.consumer(created.id).unwrap().payment_method_id, None);
    }
}
