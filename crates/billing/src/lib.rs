// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)]
#![allow(clippy::too_many_arguments)] // Charge helpers carry the full payer/payee context
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ApiHub Billing Module
//!
//! Subscriptions to marketplace tiers, saved cards and receipts, with Stripe
//! as the payment gateway.
//!
//! ## Features
//!
//! - **Subscription Lifecycle**: Subscribe, unsubscribe, resume, switch tier, delete
//! - **Payment Methods**: Setup intents, saving and detaching cards
//! - **Receipts**: Append-only record of every charge attempt
//! - **Renewals**: Period-end sweep charging, expiring or cancelling subscriptions
//! - **Invariants**: Read-only consistency checks over billing tables

mod charges;
pub mod client;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod models;
pub mod payment_methods;
pub mod receipts;
pub mod renewals;
pub mod store;
pub mod subscriptions;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


use std::sync::Arc;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Gateway
pub use gateway::{
    ChargeOutcome, ChargeRequest, GatewayPaymentMethod, PaymentGateway, SetupIntentSecret,
};

// Models
pub use models::{
    BillingAddress, BillingReceipt, BillingUser, PaymentMethod, ReceiptRole, ServiceConsumer,
    ServiceSummary, SubscriptionDetails, SubscriptionTier, BILLING_PERIOD_DAYS,
};

// Services
pub use payment_methods::PaymentMethodService;
pub use receipts::ReceiptService;
pub use renewals::{RenewalOutcome, RenewalService, RenewalSummary};
pub use subscriptions::{SubscribeRequest, SubscribeResult, SubscriptionService};

// Store
pub use store::{BillingStore, PgBillingStore};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub payment_methods: PaymentMethodService,
    pub receipts: ReceiptService,
    pub renewals: RenewalService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_gateway(Arc::new(stripe), pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_gateway(Arc::new(StripeClient::new(config)), pool)
    }

    /// Postgres-backed services around any gateway
    pub fn with_gateway(gateway: Arc<dyn PaymentGateway>, pool: PgPool) -> Self {
        let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool.clone()));
        Self::from_parts(store, gateway, pool)
    }

    /// Assemble the services over an explicit store and gateway.
    ///
    /// Invariant checks always read Postgres directly through `pool`.
    pub fn from_parts(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        pool: PgPool,
    ) -> Self {
        Self {
            subscriptions: SubscriptionService::new(store.clone(), gateway.clone()),
            payment_methods: PaymentMethodService::new(store.clone(), gateway.clone()),
            receipts: ReceiptService::new(store.clone()),
            renewals: RenewalService::new(store, gateway),
            invariants: InvariantChecker::new(pool),
        }
    }
}
