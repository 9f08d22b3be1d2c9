//! Subscription routes
//!
//! Tier-scoped actions address the caller's subscription by tier id.

use apihub_billing::{ServiceConsumer, SubscribeRequest, SubscribeResult, SubscriptionDetails};
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    pub service_id: Uuid,
    pub tier_id: Uuid,
    pub payment_method_id: Option<Uuid>,
    #[serde(default = "default_auto_renewal")]
    pub auto_renewal: bool,
}

fn default_auto_renewal() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SwitchTierBody {
    pub new_tier_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePaymentMethodBody {
    pub payment_method_id: Uuid,
    pub auto_renewal: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionActionResponse {
    pub success: bool,
    pub subscription: ServiceConsumer,
}

impl From<ServiceConsumer> for SubscriptionActionResponse {
    fn from(subscription: ServiceConsumer) -> Self {
        Self {
            success: true,
            subscription,
        }
    }
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<SubscriptionDetails>>> {
    let billing = state.billing()?;
    let subscriptions = billing
        .subscriptions
        .list_subscriptions(auth_user.user_id)
        .await?;
    Ok(Json(subscriptions))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionDetails>> {
    let billing = state.billing()?;
    let details = billing
        .subscriptions
        .get_subscription(auth_user.user_id, tier_id)
        .await?;
    Ok(Json(details))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<SubscribeBody>,
) -> ApiResult<(StatusCode, Json<SubscribeResult>)> {
    let billing = state.billing()?;

    let result = billing
        .subscriptions
        .subscribe(
            auth_user.user_id,
            SubscribeRequest {
                service_id: body.service_id,
                tier_id: body.tier_id,
                payment_method_id: body.payment_method_id,
                auto_renewal: body.auto_renewal,
            },
        )
        .await
        .inspect_err(|e| {
            tracing::warn!(
                user_id = %auth_user.user_id,
                tier_id = %body.tier_id,
                error = %e,
                "subscribe failed"
            );
        })?;

    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionActionResponse>> {
    let billing = state.billing()?;
    let subscription = billing
        .subscriptions
        .unsubscribe(auth_user.user_id, tier_id)
        .await?;
    Ok(Json(subscription.into()))
}

pub async fn resume(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionActionResponse>> {
    let billing = state.billing()?;
    let subscription = billing
        .subscriptions
        .resume(auth_user.user_id, tier_id)
        .await?;
    Ok(Json(subscription.into()))
}

pub async fn switch_tier(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
    Json(body): Json<SwitchTierBody>,
) -> ApiResult<Json<SubscriptionActionResponse>> {
    let billing = state.billing()?;
    let subscription = billing
        .subscriptions
        .switch_tier(auth_user.user_id, tier_id, body.new_tier_id)
        .await?;
    Ok(Json(subscription.into()))
}

pub async fn update_payment_method(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
    Json(body): Json<UpdatePaymentMethodBody>,
) -> ApiResult<Json<SubscriptionActionResponse>> {
    let billing = state.billing()?;
    let subscription = billing
        .subscriptions
        .update_payment_method(
            auth_user.user_id,
            tier_id,
            body.payment_method_id,
            body.auto_renewal,
        )
        .await?;
    Ok(Json(subscription.into()))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(tier_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = state.billing()?;
    billing
        .subscriptions
        .delete_subscription(auth_user.user_id, tier_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}
