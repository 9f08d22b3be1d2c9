//! Billing persistence
//!
//! Services read and write through [`BillingStore`] so lifecycle rules can be
//! exercised without a database. [`PgBillingStore`] is the Postgres
//! implementation used by the API and the worker.

use apihub_shared::{ReceiptStatus, SubscriptionStatus};
use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingAddress, BillingReceipt, BillingUser, PaymentMethod, ReceiptRole, ServiceConsumer,
    ServiceSummary, SubscriptionDetails, SubscriptionTier,
};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_service(&self, service_id: Uuid) -> BillingResult<Option<ServiceSummary>>;

    async fn get_tier(&self, tier_id: Uuid) -> BillingResult<Option<SubscriptionTier>>;

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<BillingUser>>;

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;

    /// The caller's row for a service, whatever tier it points at
    async fn find_consumer(
        &self,
        user_id: Uuid,
        service_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>>;

    async fn find_consumer_by_tier(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>>;

    /// Insert, or overwrite the existing (user, service) row. Returns the stored row.
    async fn upsert_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<ServiceConsumer>;

    /// Write user-editable fields. `last_renewed` belongs to the renewal sweep
    /// and is left as stored.
    async fn update_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<()>;

    /// Set status and `last_renewed` only while the row still matches
    /// `expected` on status, auto-renew, tier and `last_renewed`. Returns
    /// false when another writer got there first.
    async fn transition_consumer(
        &self,
        expected: &ServiceConsumer,
        status: SubscriptionStatus,
        last_renewed: OffsetDateTime,
    ) -> BillingResult<bool>;

    async fn delete_consumer(&self, consumer_id: Uuid) -> BillingResult<()>;

    async fn list_subscription_details(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionDetails>>;

    /// Live rows last renewed at or before `cutoff`
    async fn list_due_consumers(&self, cutoff: OffsetDateTime)
        -> BillingResult<Vec<ServiceConsumer>>;

    async fn get_payment_method(&self, id: Uuid) -> BillingResult<Option<PaymentMethod>>;

    async fn find_payment_method_by_gateway_id(
        &self,
        gateway_payment_method_id: &str,
    ) -> BillingResult<Option<PaymentMethod>>;

    async fn list_payment_methods(&self, user_id: Uuid) -> BillingResult<Vec<PaymentMethod>>;

    async fn insert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()>;

    async fn delete_payment_method(&self, id: Uuid) -> BillingResult<()>;

    async fn insert_receipt(&self, receipt: &BillingReceipt) -> BillingResult<()>;

    /// Receipts on one side of the ledger, newest first
    async fn list_receipts(
        &self,
        user_id: Uuid,
        role: ReceiptRole,
    ) -> BillingResult<Vec<BillingReceipt>>;
}

#[derive(Debug, sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TierRow {
    id: Uuid,
    service_id: Uuid,
    name: String,
    price_cents: i64,
    description: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: Option<String>,
    stripe_customer_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ConsumerRow {
    id: Uuid,
    user_id: Uuid,
    service_id: Uuid,
    tier_id: Uuid,
    subscription_status: String,
    renewing_subscription: bool,
    last_renewed: OffsetDateTime,
    subscription_start_date: OffsetDateTime,
    payment_method_id: Option<Uuid>,
}

impl TryFrom<ConsumerRow> for ServiceConsumer {
    type Error = BillingError;

    fn try_from(row: ConsumerRow) -> BillingResult<Self> {
        let subscription_status = row
            .subscription_status
            .parse::<SubscriptionStatus>()
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(ServiceConsumer {
            id: row.id,
            user_id: row.user_id,
            service_id: row.service_id,
            tier_id: row.tier_id,
            subscription_status,
            renewing_subscription: row.renewing_subscription,
            last_renewed: row.last_renewed,
            subscription_start_date: row.subscription_start_date,
            payment_method_id: row.payment_method_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DetailsRow {
    #[sqlx(flatten)]
    consumer: ConsumerRow,
    tier_name: String,
    price_cents: i64,
    service_name: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentMethodRow {
    id: Uuid,
    user_id: Uuid,
    gateway_payment_method_id: String,
    brand: String,
    last4: String,
    exp_month: i32,
    exp_year: i32,
    cardholder_name: Option<String>,
    address_line1: Option<String>,
    address_line2: Option<String>,
    address_city: Option<String>,
    address_state: Option<String>,
    address_postal_code: Option<String>,
    address_country: Option<String>,
    created_at: OffsetDateTime,
}

impl From<PaymentMethodRow> for PaymentMethod {
    fn from(row: PaymentMethodRow) -> Self {
        PaymentMethod {
            id: row.id,
            user_id: row.user_id,
            gateway_payment_method_id: row.gateway_payment_method_id,
            brand: row.brand,
            last4: row.last4,
            exp_month: row.exp_month,
            exp_year: row.exp_year,
            cardholder_name: row.cardholder_name,
            billing_address: BillingAddress {
                line1: row.address_line1,
                line2: row.address_line2,
                city: row.address_city,
                state: row.address_state,
                postal_code: row.address_postal_code,
                country: row.address_country,
            },
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    id: Uuid,
    from_user_id: Uuid,
    to_user_id: Uuid,
    tier_id: Uuid,
    payment_method_id: Option<Uuid>,
    amount_cents: i64,
    currency: String,
    status: String,
    gateway_reference: Option<String>,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<ReceiptRow> for BillingReceipt {
    type Error = BillingError;

    fn try_from(row: ReceiptRow) -> BillingResult<Self> {
        let status = row
            .status
            .parse::<ReceiptStatus>()
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(BillingReceipt {
            id: row.id,
            from_user_id: row.from_user_id,
            to_user_id: row.to_user_id,
            tier_id: row.tier_id,
            payment_method_id: row.payment_method_id,
            amount_cents: row.amount_cents,
            currency: row.currency,
            status,
            gateway_reference: row.gateway_reference,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

const CONSUMER_COLUMNS: &str = "id, user_id, service_id, tier_id, subscription_status, \
     renewing_subscription, last_renewed, subscription_start_date, payment_method_id";

const PAYMENT_METHOD_COLUMNS: &str = "id, user_id, gateway_payment_method_id, brand, last4, \
     exp_month, exp_year, cardholder_name, address_line1, address_line2, address_city, \
     address_state, address_postal_code, address_country, created_at";

/// Postgres-backed billing store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_service(&self, service_id: Uuid) -> BillingResult<Option<ServiceSummary>> {
        let row: Option<ServiceRow> =
            sqlx::query_as("SELECT id, owner_id, name FROM services WHERE id = $1")
                .bind(service_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| ServiceSummary {
            id: r.id,
            owner_id: r.owner_id,
            name: r.name,
        }))
    }

    async fn get_tier(&self, tier_id: Uuid) -> BillingResult<Option<SubscriptionTier>> {
        let row: Option<TierRow> = sqlx::query_as(
            r#"
            SELECT id, service_id, name, price_cents, description
            FROM subscription_tiers
            WHERE id = $1
            "#,
        )
        .bind(tier_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SubscriptionTier {
            id: r.id,
            service_id: r.service_id,
            name: r.name,
            price_cents: r.price_cents,
            description: r.description,
        }))
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<BillingUser>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, email, stripe_customer_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|r| BillingUser {
            id: r.id,
            email: r.email,
            stripe_customer_id: r.stripe_customer_id,
        }))
    }

    async fn set_customer_id(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_consumer(
        &self,
        user_id: Uuid,
        service_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>> {
        let row: Option<ConsumerRow> = sqlx::query_as(&format!(
            "SELECT {CONSUMER_COLUMNS} FROM service_consumers WHERE user_id = $1 AND service_id = $2"
        ))
        .bind(user_id)
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceConsumer::try_from).transpose()
    }

    async fn find_consumer_by_tier(
        &self,
        user_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<Option<ServiceConsumer>> {
        let row: Option<ConsumerRow> = sqlx::query_as(&format!(
            "SELECT {CONSUMER_COLUMNS} FROM service_consumers WHERE user_id = $1 AND tier_id = $2"
        ))
        .bind(user_id)
        .bind(tier_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ServiceConsumer::try_from).transpose()
    }

    async fn upsert_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<ServiceConsumer> {
        let row: ConsumerRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO service_consumers (
                id, user_id, service_id, tier_id, subscription_status,
                renewing_subscription, last_renewed, subscription_start_date, payment_method_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, service_id) DO UPDATE SET
                tier_id = EXCLUDED.tier_id,
                subscription_status = EXCLUDED.subscription_status,
                renewing_subscription = EXCLUDED.renewing_subscription,
                last_renewed = EXCLUDED.last_renewed,
                subscription_start_date = EXCLUDED.subscription_start_date,
                payment_method_id = EXCLUDED.payment_method_id,
                updated_at = NOW()
            RETURNING {CONSUMER_COLUMNS}
            "#
        ))
        .bind(consumer.id)
        .bind(consumer.user_id)
        .bind(consumer.service_id)
        .bind(consumer.tier_id)
        .bind(consumer.subscription_status.as_str())
        .bind(consumer.renewing_subscription)
        .bind(consumer.last_renewed)
        .bind(consumer.subscription_start_date)
        .bind(consumer.payment_method_id)
        .fetch_one(&self.pool)
        .await?;

        ServiceConsumer::try_from(row)
    }

    async fn update_consumer(&self, consumer: &ServiceConsumer) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE service_consumers
            SET tier_id = $2,
                subscription_status = $3,
                renewing_subscription = $4,
                payment_method_id = $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(consumer.id)
        .bind(consumer.tier_id)
        .bind(consumer.subscription_status.as_str())
        .bind(consumer.renewing_subscription)
        .bind(consumer.payment_method_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound(consumer.id.to_string()));
        }
        Ok(())
    }

    async fn transition_consumer(
        &self,
        expected: &ServiceConsumer,
        status: SubscriptionStatus,
        last_renewed: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE service_consumers
            SET subscription_status = $6,
                last_renewed = $7,
                updated_at = NOW()
            WHERE id = $1
              AND subscription_status = $2
              AND renewing_subscription = $3
              AND tier_id = $4
              AND last_renewed = $5
            "#,
        )
        .bind(expected.id)
        .bind(expected.subscription_status.as_str())
        .bind(expected.renewing_subscription)
        .bind(expected.tier_id)
        .bind(expected.last_renewed)
        .bind(status.as_str())
        .bind(last_renewed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_consumer(&self, consumer_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM service_consumers WHERE id = $1")
            .bind(consumer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_subscription_details(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionDetails>> {
        let rows: Vec<DetailsRow> = sqlx::query_as(
            r#"
            SELECT sc.id, sc.user_id, sc.service_id, sc.tier_id, sc.subscription_status,
                   sc.renewing_subscription, sc.last_renewed, sc.subscription_start_date,
                   sc.payment_method_id,
                   t.name AS tier_name, t.price_cents, s.name AS service_name
            FROM service_consumers sc
            JOIN subscription_tiers t ON t.id = sc.tier_id
            JOIN services s ON s.id = sc.service_id
            WHERE sc.user_id = $1
            ORDER BY sc.subscription_start_date DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let consumer = ServiceConsumer::try_from(row.consumer)?;
                Ok(SubscriptionDetails {
                    current_period_end: consumer.period_end(),
                    consumer,
                    tier_name: row.tier_name,
                    price_cents: row.price_cents,
                    service_name: row.service_name,
                })
            })
            .collect()
    }

    async fn list_due_consumers(
        &self,
        cutoff: OffsetDateTime,
    ) -> BillingResult<Vec<ServiceConsumer>> {
        let rows: Vec<ConsumerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONSUMER_COLUMNS}
            FROM service_consumers
            WHERE subscription_status IN ('ACTIVE', 'PENDING_CANCELLATION')
              AND last_renewed <= $1
            ORDER BY last_renewed ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ServiceConsumer::try_from).collect()
    }

    async fn get_payment_method(&self, id: Uuid) -> BillingResult<Option<PaymentMethod>> {
        let row: Option<PaymentMethodRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_METHOD_COLUMNS} FROM payment_methods WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PaymentMethod::from))
    }

    async fn find_payment_method_by_gateway_id(
        &self,
        gateway_payment_method_id: &str,
    ) -> BillingResult<Option<PaymentMethod>> {
        let row: Option<PaymentMethodRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_METHOD_COLUMNS} FROM payment_methods WHERE gateway_payment_method_id = $1"
        ))
        .bind(gateway_payment_method_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(PaymentMethod::from))
    }

    async fn list_payment_methods(&self, user_id: Uuid) -> BillingResult<Vec<PaymentMethod>> {
        let rows: Vec<PaymentMethodRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_METHOD_COLUMNS} FROM payment_methods WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PaymentMethod::from).collect())
    }

    async fn insert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()> {
        let address = &method.billing_address;
        sqlx::query(
            r#"
            INSERT INTO payment_methods (
                id, user_id, gateway_payment_method_id, brand, last4, exp_month, exp_year,
                cardholder_name, address_line1, address_line2, address_city, address_state,
                address_postal_code, address_country, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(method.id)
        .bind(method.user_id)
        .bind(&method.gateway_payment_method_id)
        .bind(&method.brand)
        .bind(&method.last4)
        .bind(method.exp_month)
        .bind(method.exp_year)
        .bind(&method.cardholder_name)
        .bind(&address.line1)
        .bind(&address.line2)
        .bind(&address.city)
        .bind(&address.state)
        .bind(&address.postal_code)
        .bind(&address.country)
        .bind(method.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_payment_method(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM payment_methods WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_receipt(&self, receipt: &BillingReceipt) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_receipts (
                id, from_user_id, to_user_id, tier_id, payment_method_id, amount_cents,
                currency, status, gateway_reference, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(receipt.id)
        .bind(receipt.from_user_id)
        .bind(receipt.to_user_id)
        .bind(receipt.tier_id)
        .bind(receipt.payment_method_id)
        .bind(receipt.amount_cents)
        .bind(&receipt.currency)
        .bind(receipt.status.as_str())
        .bind(&receipt.gateway_reference)
        .bind(&receipt.description)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_receipts(
        &self,
        user_id: Uuid,
        role: ReceiptRole,
    ) -> BillingResult<Vec<BillingReceipt>> {
        let column = match role {
            ReceiptRole::Payer => "from_user_id",
            ReceiptRole::Payee => "to_user_id",
        };

        let rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            r#"
            SELECT id, from_user_id, to_user_id, tier_id, payment_method_id, amount_cents,
                   currency, status, gateway_reference, description, created_at
            FROM billing_receipts
            WHERE {column} = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BillingReceipt::try_from).collect()
    }
}
