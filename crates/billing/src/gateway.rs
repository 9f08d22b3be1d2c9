//! Payment gateway seam
//!
//! Billing services talk to the payment provider only through
//! [`PaymentGateway`]. [`StripeClient`] is the production implementation;
//! tests use the scripted gateway in [`crate::testing`].

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePaymentIntent, CreateSetupIntent, Customer,
    CustomerId, PaymentIntent, PaymentIntentOffSession, PaymentIntentStatus, PaymentMethod,
    PaymentMethodId, SetupIntent, StripeError,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::models::BillingAddress;

/// Client secret handed to the browser to confirm card setup
#[derive(Debug, Clone, serde::Serialize)]
pub struct SetupIntentSecret {
    pub setup_intent_id: String,
    pub client_secret: String,
}

/// Payment method as reported by the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPaymentMethod {
    pub id: String,
    /// Gateway customer the method is attached to, if any
    pub customer_id: Option<String>,
    pub brand: String,
    pub last4: String,
    pub exp_month: i32,
    pub exp_year: i32,
    pub cardholder_name: Option<String>,
    pub address: BillingAddress,
}

/// Off-session charge against a saved payment method
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub customer_id: String,
    pub gateway_payment_method_id: String,
    pub amount_cents: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChargeOutcome {
    Succeeded { reference: String },
    Declined {
        reference: Option<String>,
        reason: String,
    },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a gateway customer for a user, returning its id
    async fn create_customer(&self, user_id: Uuid, email: Option<&str>) -> BillingResult<String>;

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret>;

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<GatewayPaymentMethod>;

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod>;

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()>;

    /// Charge immediately. A card decline is an `Ok(Declined)`, not an error.
    async fn charge(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome>;

    /// ISO currency code used for charges and receipts
    fn currency(&self) -> &str;
}

fn parse_customer_id(customer_id: &str) -> BillingResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| BillingError::Gateway(format!("Invalid customer ID: {}", e)))
}

fn parse_payment_method_id(payment_method_id: &str) -> BillingResult<PaymentMethodId> {
    payment_method_id
        .parse::<PaymentMethodId>()
        .map_err(|_| BillingError::PaymentMethodNotFound(payment_method_id.to_string()))
}

fn to_gateway_payment_method(pm: PaymentMethod) -> BillingResult<GatewayPaymentMethod> {
    let card = pm.card.as_ref().ok_or_else(|| {
        BillingError::InvalidInput(format!("Payment method {} is not a card", pm.id))
    })?;

    let address = pm
        .billing_details
        .address
        .as_ref()
        .map(|a| BillingAddress {
            line1: a.line1.clone(),
            line2: a.line2.clone(),
            city: a.city.clone(),
            state: a.state.clone(),
            postal_code: a.postal_code.clone(),
            country: a.country.clone(),
        })
        .unwrap_or_default();

    Ok(GatewayPaymentMethod {
        id: pm.id.to_string(),
        customer_id: pm.customer.as_ref().map(|c| c.id().to_string()),
        brand: card.brand.to_string(),
        last4: card.last4.clone(),
        exp_month: card.exp_month as i32,
        exp_year: card.exp_year as i32,
        cardholder_name: pm.billing_details.name.clone(),
        address,
    })
}

/// Card errors from the confirm step that mean "declined" rather than a
/// gateway failure.
fn decline_reason(error: &StripeError) -> Option<String> {
    match error {
        StripeError::Stripe(request_error) if request_error.http_status == 402 => Some(
            request_error
                .message
                .clone()
                .unwrap_or_else(|| "Card declined".to_string()),
        ),
        // `authentication_required` is not a known error code in this client
        // version, so the error body fails to decode at `error.code`
        StripeError::JSONSerialize(decode)
            if decode.path().to_string() == "error.code"
                && decode.inner().to_string().contains("authentication_required") =>
        {
            Some("Card requires authentication by the cardholder".to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl PaymentGateway for StripeClient {
    async fn create_customer(&self, user_id: Uuid, email: Option<&str>) -> BillingResult<String> {
        let mut params = CreateCustomer::new();
        params.email = email;

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        params.metadata = Some(metadata);

        let customer = Customer::create(self.inner(), params).await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id.to_string())
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret> {
        let mut params = CreateSetupIntent::new();
        params.customer = Some(parse_customer_id(customer_id)?);

        let mut metadata = HashMap::new();
        metadata.insert("purpose".to_string(), "subscription_payment_method".to_string());
        params.metadata = Some(metadata);

        let intent = SetupIntent::create(self.inner(), params).await?;
        let client_secret = intent.client_secret.clone().ok_or_else(|| {
            BillingError::Gateway(format!("Setup intent {} has no client secret", intent.id))
        })?;

        tracing::info!(
            customer_id = %customer_id,
            setup_intent_id = %intent.id,
            "Created setup intent"
        );

        Ok(SetupIntentSecret {
            setup_intent_id: intent.id.to_string(),
            client_secret,
        })
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        let id = parse_payment_method_id(payment_method_id)?;
        let pm = PaymentMethod::retrieve(self.inner(), &id, &[]).await?;
        to_gateway_payment_method(pm)
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        let id = parse_payment_method_id(payment_method_id)?;
        let customer = parse_customer_id(customer_id)?;

        let pm = PaymentMethod::attach(self.inner(), &id, AttachPaymentMethod { customer }).await?;

        tracing::info!(
            payment_method_id = %payment_method_id,
            customer_id = %customer_id,
            "Attached payment method"
        );

        to_gateway_payment_method(pm)
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()> {
        let id = parse_payment_method_id(payment_method_id)?;
        PaymentMethod::detach(self.inner(), &id).await?;

        tracing::info!(payment_method_id = %payment_method_id, "Detached payment method");
        Ok(())
    }

    async fn charge(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome> {
        let mut params = CreatePaymentIntent::new(request.amount_cents, self.stripe_currency()?);
        params.customer = Some(parse_customer_id(&request.customer_id)?);
        params.payment_method = Some(parse_payment_method_id(&request.gateway_payment_method_id)?);
        params.confirm = Some(true);
        // Saved-card charges run without the customer present
        params.off_session = Some(PaymentIntentOffSession::exists(true));
        params.description = Some(request.description.as_str());
        params.metadata = Some(request.metadata.clone());

        match PaymentIntent::create(self.inner(), params).await {
            Ok(intent) if intent.status == PaymentIntentStatus::Succeeded => {
                Ok(ChargeOutcome::Succeeded {
                    reference: intent.id.to_string(),
                })
            }
            Ok(intent) => {
                let reason = intent
                    .last_payment_error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| format!("Payment intent ended in status {}", intent.status));
                Ok(ChargeOutcome::Declined {
                    reference: Some(intent.id.to_string()),
                    reason,
                })
            }
            Err(e) => match decline_reason(&e) {
                Some(reason) => Ok(ChargeOutcome::Declined {
                    reference: None,
                    reason,
                }),
                None => Err(e.into()),
            },
        }
    }

    fn currency(&self) -> &str {
        &self.config().currency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripe::{ErrorCode, ErrorType, RequestError};

    fn request_error(http_status: u16, code: Option<ErrorCode>, message: &str) -> StripeError {
        StripeError::Stripe(RequestError {
            http_status,
            error_type: ErrorType::Card,
            message: Some(message.to_string()),
            code,
            ..Default::default()
        })
    }

    #[test]
    fn test_card_error_is_a_decline() {
        let err = request_error(402, Some(ErrorCode::CardDeclined), "Your card was declined.");
        assert_eq!(decline_reason(&err).as_deref(), Some("Your card was declined."));
    }

    #[test]
    fn test_card_error_without_message_has_default_reason() {
        let err = StripeError::Stripe(RequestError {
            http_status: 402,
            ..Default::default()
        });
        assert_eq!(decline_reason(&err).as_deref(), Some("Card declined"));
    }

    #[test]
    fn test_non_card_errors_are_not_declines() {
        let invalid = request_error(400, None, "No such customer");
        assert_eq!(decline_reason(&invalid), None);
        assert_eq!(decline_reason(&StripeError::Timeout), None);
    }
}
