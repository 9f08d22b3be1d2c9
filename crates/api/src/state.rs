//! Application state

use std::sync::Arc;
use std::time::Duration;

use apihub_billing::BillingService;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtVerifier},
    config::Config,
    error::{ApiError, ApiResult},
    tester::ApiTester,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_verifier: JwtVerifier,
    /// `None` when billing is disabled or Stripe is not configured
    pub billing: Option<Arc<BillingService>>,
    pub tester: ApiTester,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(pool, config, billing)
    }

    /// Build state around an already constructed billing service
    pub fn with_billing(
        pool: PgPool,
        config: Config,
        billing: Option<Arc<BillingService>>,
    ) -> anyhow::Result<Self> {
        let jwt_verifier = JwtVerifier::new(
            &config.jwt_secret,
            config.jwt_issuer.as_deref(),
            config.jwt_audience.as_deref(),
        );
        if config.jwt_audience.is_none() {
            tracing::warn!("AUTH_JWT_AUDIENCE not set - token audience is not checked");
        }

        let tester = ApiTester::new(
            Duration::from_secs(config.tester_timeout_secs),
            config.tester_max_response_bytes,
            config.tester_allow_private_targets,
        )?;
        if config.tester_allow_private_targets {
            tracing::warn!("TESTER_ALLOW_PRIVATE_TARGETS set - tester may reach internal hosts");
        }
        tracing::info!(
            timeout_secs = config.tester_timeout_secs,
            max_response_bytes = config.tester_max_response_bytes,
            "API tester initialized"
        );

        Ok(Self {
            pool,
            config,
            jwt_verifier,
            billing,
            tester,
        })
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            verifier: self.jwt_verifier.clone(),
            pool: self.pool.clone(),
        }
    }

    /// Billing routes answer 503 when billing is off
    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing.as_deref().ok_or(ApiError::ServiceUnavailable)
    }
}
