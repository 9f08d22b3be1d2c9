//! Stripe client configuration

use stripe::{Client, Currency};

use crate::error::{BillingError, BillingResult};

/// Stripe settings read from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Lowercase ISO currency code charged for tiers (e.g. "usd")
    pub currency: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        if secret_key.trim().is_empty() {
            return Err(BillingError::Config("STRIPE_SECRET_KEY is empty".to_string()));
        }

        let currency = std::env::var("STRIPE_CURRENCY")
            .unwrap_or_else(|_| "usd".to_string())
            .to_lowercase();
        currency_from_code(&currency)?;

        Ok(Self {
            secret_key,
            currency,
        })
    }
}

/// Thin wrapper pairing the async-stripe client with its config
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn stripe_currency(&self) -> BillingResult<Currency> {
        currency_from_code(&self.config.currency)
    }
}

/// Map a lowercase currency code to the Stripe enum
pub fn currency_from_code(code: &str) -> BillingResult<Currency> {
    match code {
        "usd" => Ok(Currency::USD),
        "eur" => Ok(Currency::EUR),
        "gbp" => Ok(Currency::GBP),
        "cad" => Ok(Currency::CAD),
        "aud" => Ok(Currency::AUD),
        "jpy" => Ok(Currency::JPY),
        other => Err(BillingError::Config(format!("Unsupported currency: {}", other))),
    }
}
