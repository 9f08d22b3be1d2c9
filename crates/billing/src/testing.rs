//! In-memory fakes for the billing seams
//!
//! Available to this crate's tests and, behind the `testing` feature, to
//! downstream crates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use apihub_shared::SubscriptionStatus;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeOutcome, ChargeRequest, GatewayPaymentMethod, PaymentGateway, SetupIntentSecret,
};
use crate::models::{
    BillingAddress, BillingReceipt, BillingUser, PaymentMethod, ReceiptRole, ServiceConsumer,
    ServiceSummary, SubscriptionDetails, SubscriptionTier,
};
use crate::store::BillingStore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct StoreState {
    users: HashMap<Uuid, BillingUser>,
    services: HashMap<Uuid, ServiceSummary>,
    tiers: HashMap<Uuid, SubscriptionTier>,
    consumers: HashMap<Uuid, ServiceConsumer>,
    payment_methods: HashMap<Uuid, PaymentMethod>,
    receipts: Vec<BillingReceipt>,
}

/// `BillingStore` backed by hash maps, mirroring the Postgres constraints
/// the services rely on: one consumer per (user, service) and
/// `ON DELETE SET NULL` for payment method references.
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<StoreState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, email: &str) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.state).users.insert(
            id,
            BillingUser {
                id,
                email: Some(email.to_string()),
                stripe_customer_id: None,
            },
        );
        id
    }

    pub fn add_service(&self, owner_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.state).services.insert(
            id,
            ServiceSummary {
                id,
                owner_id,
                name: name.to_string(),
            },
        );
        id
    }

    pub fn add_tier(&self, service_id: Uuid, name: &str, price_cents: i64) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.state).tiers.insert(
            id,
            SubscriptionTier {
                id,
                service_id,
                name: name.to_string(),
                price_cents,
                description: None,
            },
        );
        id
    }

    /// Seed a locally mirrored card for `user_id`
    pub fn add_payment_method(&self, user_id: Uuid, gateway_payment_method_id: &str) -> Uuid {
        let id = Uuid::new_v4();
        lock(&self.state).payment_methods.insert(
            id,
            PaymentMethod {
                id,
                user_id,
                gateway_payment_method_id: gateway_payment_method_id.to_string(),
                brand: "visa".to_string(),
                last4: "4242".to_string(),
                exp_month: 12,
                exp_year: 2030,
                cardholder_name: None,
                billing_address: BillingAddress::default(),
                created_at: OffsetDateTime::now_utc(),
            },
        );
        id
    }

    /// Seed a consumer row directly, bypassing lifecycle rules
    pub fn put_consumer(&self, consumer: ServiceConsumer) {
        lock(&self.state).consumers.insert(consumer.id, consumer);
    }

    pub fn consumers(&self) -> Vec<ServiceConsumer> {
        lock(&self.state).consumers.values().cloned().collect()
    }

    pub fn consumer(&self, id: Uuid) -> Option<ServiceConsumer> {
        lock(&self.state).consumers.get(&id).cloned()
    }

    pub fn receipts(&self) -> Vec<BillingReceipt> {
        lock(&self.state).receipts.clone()
    }

    pub fn payment_method_count(&self) -> usize {
        lock(&self.state).payment_methods.len()
    }

    pub fn customer_id(&self, user_id: Uuid) -> Option<String> {
        lock(&self.state)
            .users
            .get(&user_id)
            .and_then(|u| u.stripe_customer_id.clone())
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_service(&self, service_id: Uuid) -> BillingResult<Option<ServiceSummary>> {
        Ok(lock(&self.state).services.get(&service_id).cloned())
    }

    async fn get_tier(&self, tier_id: Uuid) -> BillingResult<Option<SubscriptionTier>> {
        Ok(lock(&self.state).tiers.get(&tier_id).cloned())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<BillingUser>> {
        Ok(lock(&self.state).users.get(&user_id).cloned())
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut state = lock(&self.state);
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        user.stripe_customer_id = Some(customer_id.to_string());
        Ok(())
    }

    async fn find_consumer(
        &self,
        user_id: Uuid,
        service_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>> {
        Ok(lock(&self.state)
            .consumers
            .values()
            .find(|c| c.user_id == user_id && c.service_id == service_id)
            .cloned())
    }

    async fn find_consumer_by_tier(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>> {
        Ok(lock(&self.state)
            .consumers
            .values()
            .find(|c| c.user_id == user_id && c.tier_id == tier_id)
            .cloned())
    }

    async fn upsert_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<ServiceConsumer> {
        let mut state = lock(&self.state);
        let existing_id = state
            .consumers
            .values()
            .find(|c| c.user_id == consumer.user_id && c.service_id == consumer.service_id)
            .map(|c| c.id);

        let stored = ServiceConsumer {
            id: existing_id.unwrap_or(consumer.id),
            ..consumer.clone()
        };
        state.consumers.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<()> {
        let mut state = lock(&self.state);
        match state.consumers.get_mut(&consumer.id) {
            Some(existing) => {
                *existing = ServiceConsumer {
                    last_renewed: existing.last_renewed,
                    ..consumer.clone()
                };
                Ok(())
            }
            None => Err(BillingError::SubscriptionNotFound(consumer.id.to_string())),
        }
    }

    async fn transition_consumer(
        &self,
        expected: &ServiceConsumer,
        status: SubscriptionStatus,
        last_renewed: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = lock(&self.state);
        let Some(row) = state.consumers.get_mut(&expected.id) else {
            return Ok(false);
        };
        let unchanged = row.subscription_status == expected.subscription_status
            && row.renewing_subscription == expected.renewing_subscription
            && row.tier_id == expected.tier_id
            && row.last_renewed == expected.last_renewed;
        if unchanged {
            row.subscription_status = status;
            row.last_renewed = last_renewed;
        }
        Ok(unchanged)
    }

    async fn delete_consumer(&self, consumer_id: Uuid) -> BillingResult<()> {
        lock(&self.state).consumers.remove(&consumer_id);
        Ok(())
    }

    async fn list_subscription_details(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionDetails>> {
        let state = lock(&self.state);
        let mut details: Vec<SubscriptionDetails> = state
            .consumers
            .values()
            .filter(|c| c.user_id == user_id)
            .filter_map(|c| {
                let tier = state.tiers.get(&c.tier_id)?;
                let service = state.services.get(&c.service_id)?;
                Some(SubscriptionDetails {
                    consumer: c.clone(),
                    tier_name: tier.name.clone(),
                    price_cents: tier.price_cents,
                    service_name: service.name.clone(),
                    current_period_end: c.period_end(),
                })
            })
            .collect();
        details.sort_by(|a, b| {
            b.consumer
                .subscription_start_date
                .cmp(&a.consumer.subscription_start_date)
        });
        Ok(details)
    }

    async fn list_due_consumers(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<ServiceConsumer>> {
        let mut due: Vec<ServiceConsumer> = lock(&self.state)
            .consumers
            .values()
            .filter(|c| c.subscription_status.is_live() && c.last_renewed <= cutoff)
            .cloned()
            .collect();
        due.sort_by_key(|c| c.last_renewed);
        Ok(due)
    }

    async fn get_payment_method(&self, id: Uuid) -> BillingResult<Option<PaymentMethod>> {
        Ok(lock(&self.state).payment_methods.get(&id).cloned())
    }

    async fn find_payment_method_by_gateway_id(
        &self,
        gateway_payment_method_id: &str,
    ) -> BillingResult<Option<PaymentMethod>> {
        Ok(lock(&self.state)
            .payment_methods
            .values()
            .find(|pm| pm.gateway_payment_method_id == gateway_payment_method_id)
            .cloned())
    }

    async fn list_payment_methods(&self, user_id: Uuid) -> BillingResult<Vec<PaymentMethod>> {
        let mut methods: Vec<PaymentMethod> = lock(&self.state)
            .payment_methods
            .values()
            .filter(|pm| pm.user_id == user_id)
            .cloned()
            .collect();
        methods.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(methods)
    }

    async fn insert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if state
            .payment_methods
            .values()
            .any(|pm| pm.gateway_payment_method_id == method.gateway_payment_method_id)
        {
            return Err(BillingError::Database(format!(
                "duplicate gateway_payment_method_id {}",
                method.gateway_payment_method_id
            )));
        }
        state.payment_methods.insert(method.id, method.clone());
        Ok(())
    }

    async fn delete_payment_method(&self, id: Uuid) -> BillingResult<()> {
        let mut state = lock(&self.state);
        state.payment_methods.remove(&id);
        for consumer in state.consumers.values_mut() {
            if consumer.payment_method_id == Some(id) {
                consumer.payment_method_id = None;
            }
        }
        for receipt in state.receipts.iter_mut() {
            if receipt.payment_method_id == Some(id) {
                receipt.payment_method_id = None;
            }
        }
        Ok(())
    }

    async fn insert_receipt(&self, receipt: &BillingReceipt) -> BillingResult<()> {
        lock(&self.state).receipts.push(receipt.clone());
        Ok(())
    }

    async fn list_receipts(
        &self,
        user_id: Uuid,
        role: ReceiptRole,
    ) -> BillingResult<Vec<BillingReceipt>> {
        let mut receipts: Vec<BillingReceipt> = lock(&self.state)
            .receipts
            .iter()
            .filter(|r| match role {
                ReceiptRole::Payer => r.from_user_id == user_id,
                ReceiptRole::Payee => r.to_user_id == user_id,
            })
            .cloned()
            .collect();
        receipts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(receipts)
    }
}

#[derive(Default)]
struct GatewayState {
    next_id: u64,
    customers: Vec<String>,
    cards: HashMap<String, GatewayPaymentMethod>,
    charges: Vec<ChargeRequest>,
    detached: Vec<String>,
    decline_reason: Option<String>,
    fail_detach: bool,
}

/// `PaymentGateway` whose answers are set up by the test
#[derive(Default)]
pub struct ScriptedGateway {
    state: Mutex<GatewayState>,
    on_charge: Mutex<Option<ChargeHook>>,
}

type ChargeHook = Arc<dyn Fn() + Send + Sync>;

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a card the gateway knows about, optionally already attached
    pub fn add_card(&self, id: &str, customer_id: Option<&str>) {
        lock(&self.state).cards.insert(
            id.to_string(),
            GatewayPaymentMethod {
                id: id.to_string(),
                customer_id: customer_id.map(str::to_string),
                brand: "visa".to_string(),
                last4: "4242".to_string(),
                exp_month: 12,
                exp_year: 2030,
                cardholder_name: Some("Test Holder".to_string()),
                address: BillingAddress {
                    line1: Some("1 Main St".to_string()),
                    city: Some("Springfield".to_string()),
                    postal_code: Some("12345".to_string()),
                    country: Some("US".to_string()),
                    ..Default::default()
                },
            },
        );
    }

    /// Decline every charge from now on with `reason`
    pub fn decline_charges(&self, reason: &str) {
        lock(&self.state).decline_reason = Some(reason.to_string());
    }

    pub fn approve_charges(&self) {
        lock(&self.state).decline_reason = None;
    }

    /// Run `hook` while each charge is in flight, before it answers
    pub fn on_charge(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_charge) = Some(Arc::new(hook));
    }

    pub fn fail_detach(&self) {
        lock(&self.state).fail_detach = true;
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        lock(&self.state).charges.clone()
    }

    pub fn customers(&self) -> Vec<String> {
        lock(&self.state).customers.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        lock(&self.state).detached.clone()
    }

    pub fn card(&self, id: &str) -> Option<GatewayPaymentMethod> {
        lock(&self.state).cards.get(id).cloned()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_customer(&self, _user_id: Uuid, _email: Option<&str>) -> BillingResult<String> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = format!("cus_test_{}", state.next_id);
        state.customers.push(id.clone());
        Ok(id)
    }

    async fn create_setup_intent(&self, customer_id: &str) -> BillingResult<SetupIntentSecret> {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = format!("seti_test_{}", state.next_id);
        Ok(SetupIntentSecret {
            client_secret: format!("{}_secret_{}", id, customer_id),
            setup_intent_id: id,
        })
    }

    async fn retrieve_payment_method(
        &self,
        payment_method_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        lock(&self.state)
            .cards
            .get(payment_method_id)
            .cloned()
            .ok_or_else(|| BillingError::PaymentMethodNotFound(payment_method_id.to_string()))
    }

    async fn attach_payment_method(
        &self,
        payment_method_id: &str,
        customer_id: &str,
    ) -> BillingResult<GatewayPaymentMethod> {
        let mut state = lock(&self.state);
        let card = state
            .cards
            .get_mut(payment_method_id)
            .ok_or_else(|| BillingError::PaymentMethodNotFound(payment_method_id.to_string()))?;
        card.customer_id = Some(customer_id.to_string());
        Ok(card.clone())
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if state.fail_detach {
            return Err(BillingError::Gateway("detach rejected".to_string()));
        }
        if let Some(card) = state.cards.get_mut(payment_method_id) {
            card.customer_id = None;
        }
        state.detached.push(payment_method_id.to_string());
        Ok(())
    }

    async fn charge(&self, request: ChargeRequest) -> BillingResult<ChargeOutcome> {
        let hook = lock(&self.on_charge).clone();
        if let Some(hook) = hook {
            hook();
        }

        let mut state = lock(&self.state);
        state.next_id += 1;
        let reference = format!("pi_test_{}", state.next_id);
        state.charges.push(request);

        Ok(match &state.decline_reason {
            Some(reason) => ChargeOutcome::Declined {
                reference: Some(reference),
                reason: reason.clone(),
            },
            None => ChargeOutcome::Succeeded { reference },
        })
    }

    fn currency(&self) -> &str {
        "usd"
    }
}

/// A seeded marketplace: one owner publishing a service with a free and a
/// $10 tier, and one consumer holding a saved card.
pub struct Marketplace {
    pub store: Arc<InMemoryBillingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub owner_id: Uuid,
    pub consumer_id: Uuid,
    pub service_id: Uuid,
    pub free_tier_id: Uuid,
    pub paid_tier_id: Uuid,
    pub card_id: Uuid,
}

impl Marketplace {
    pub const PAID_TIER_PRICE_CENTS: i64 = 1000;

    pub fn seed() -> Self {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(ScriptedGateway::new());

        let owner_id = store.add_user("owner@example.com");
        let consumer_id = store.add_user("consumer@example.com");
        let service_id = store.add_service(owner_id, "Weather API");
        let free_tier_id = store.add_tier(service_id, "Free", 0);
        let paid_tier_id = store.add_tier(service_id, "Pro", Self::PAID_TIER_PRICE_CENTS);
        let card_id = store.add_payment_method(consumer_id, "pm_consumer_visa");
        gateway.add_card("pm_consumer_visa", None);

        Self {
            store,
            gateway,
            owner_id,
            consumer_id,
            service_id,
            free_tier_id,
            paid_tier_id,
            card_id,
        }
    }

    pub fn store(&self) -> Arc<dyn BillingStore> {
        self.store.clone()
    }

    pub fn gateway(&self) -> Arc<dyn PaymentGateway> {
        self.gateway.clone()
    }
}
