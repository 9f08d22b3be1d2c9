//! Helpers shared by subscribe, renewals and payment methods

use std::collections::HashMap;

use apihub_shared::ReceiptStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use crate::models::{BillingReceipt, PaymentMethod, ServiceSummary, SubscriptionTier};
use crate::store::BillingStore;

/// Why a tier is being charged, used in receipt descriptions
#[derive(Debug, Clone, Copy)]
pub(crate) enum ChargeReason {
    NewSubscription,
    Renewal,
}

impl ChargeReason {
    fn label(&self) -> &'static str {
        match self {
            ChargeReason::NewSubscription => "subscription",
            ChargeReason::Renewal => "renewal",
        }
    }
}

/// A recorded charge attempt. `failure` carries the decline reason.
pub(crate) struct ChargeAttempt {
    pub receipt: BillingReceipt,
    pub failure: Option<String>,
}

/// Return the user's gateway customer, creating it on first use
pub(crate) async fn ensure_customer(
    store: &dyn BillingStore,
    gateway: &dyn PaymentGateway,
    user_id: Uuid,
) -> BillingResult<String> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;

    if let Some(customer_id) = user.stripe_customer_id {
        return Ok(customer_id);
    }

    let customer_id = gateway
        .create_customer(user_id, user.email.as_deref())
        .await?;
    store.set_customer_id(user_id, &customer_id).await?;

    tracing::info!(
        user_id = %user_id,
        customer_id = %customer_id,
        "Linked gateway customer to user"
    );

    Ok(customer_id)
}

/// Look up a payment method and check the caller owns it
pub(crate) async fn owned_payment_method(
    store: &dyn BillingStore,
    user_id: Uuid,
    payment_method_id: Uuid,
) -> BillingResult<PaymentMethod> {
    let method = store
        .get_payment_method(payment_method_id)
        .await?
        .ok_or_else(|| BillingError::PaymentMethodNotFound(payment_method_id.to_string()))?;

    if method.user_id != user_id {
        tracing::warn!(
            user_id = %user_id,
            payment_method_id = %payment_method_id,
            "Payment method belongs to another user"
        );
        return Err(BillingError::PaymentMethodForbidden);
    }

    Ok(method)
}

/// Charge `payer` the tier price and append a receipt for the attempt.
///
/// Declines are recorded as FAILED receipts and reported through
/// [`ChargeAttempt::failure`]; transport errors propagate without a receipt.
pub(crate) async fn charge_tier(
    store: &dyn BillingStore,
    gateway: &dyn PaymentGateway,
    payer_id: Uuid,
    service: &ServiceSummary,
    tier: &SubscriptionTier,
    method: &PaymentMethod,
    reason: ChargeReason,
    now: OffsetDateTime,
) -> BillingResult<ChargeAttempt> {
    let customer_id = ensure_customer(store, gateway, payer_id).await?;
    let description = format!("{} - {} ({})", service.name, tier.name, reason.label());

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), payer_id.to_string());
    metadata.insert("service_id".to_string(), service.id.to_string());
    metadata.insert("tier_id".to_string(), tier.id.to_string());

    let outcome = gateway
        .charge(ChargeRequest {
            customer_id,
            gateway_payment_method_id: method.gateway_payment_method_id.clone(),
            amount_cents: tier.price_cents,
            description: description.clone(),
            metadata,
        })
        .await?;

    let (status, gateway_reference, failure) = match outcome {
        ChargeOutcome::Succeeded { reference } => (ReceiptStatus::Paid, Some(reference), None),
        ChargeOutcome::Declined { reference, reason } => {
            (ReceiptStatus::Failed, reference, Some(reason))
        }
    };

    let receipt = BillingReceipt {
        id: Uuid::new_v4(),
        from_user_id: payer_id,
        to_user_id: service.owner_id,
        tier_id: tier.id,
        payment_method_id: Some(method.id),
        amount_cents: tier.price_cents,
        currency: gateway.currency().to_string(),
        status,
        gateway_reference,
        description,
        created_at: now,
    };
    store.insert_receipt(&receipt).await?;

    match &failure {
        None => tracing::info!(
            user_id = %payer_id,
            tier_id = %tier.id,
            amount_cents = tier.price_cents,
            receipt_id = %receipt.id,
            "Charged subscription tier"
        ),
        Some(reason) => tracing::warn!(
            user_id = %payer_id,
            tier_id = %tier.id,
            amount_cents = tier.price_cents,
            receipt_id = %receipt.id,
            reason = %reason,
            "Subscription charge declined"
        ),
    }

    Ok(ChargeAttempt { receipt, failure })
}
