//! Payment method routes

use apihub_billing::{PaymentMethod, SetupIntentSecret};
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct SavePaymentMethodRequest {
    /// Gateway id of a card confirmed through a setup intent
    pub payment_method_id: String,
}

/// Start card collection in the browser
pub async fn create_setup_intent(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SetupIntentSecret>> {
    let billing = state.billing()?;
    let secret = billing
        .payment_methods
        .create_setup_intent(auth_user.user_id)
        .await?;
    Ok(Json(secret))
}

pub async fn save_payment_method(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<SavePaymentMethodRequest>,
) -> ApiResult<(StatusCode, Json<PaymentMethod>)> {
    let billing = state.billing()?;
    let method = billing
        .payment_methods
        .save_payment_method(auth_user.user_id, &req.payment_method_id)
        .await?;
    Ok((StatusCode::CREATED, Json(method)))
}

pub async fn list_payment_methods(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<PaymentMethod>>> {
    let billing = state.billing()?;
    let methods = billing
        .payment_methods
        .list_payment_methods(auth_user.user_id)
        .await?;
    Ok(Json(methods))
}

pub async fn delete_payment_method(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(payment_method_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let billing = state.billing()?;
    billing
        .payment_methods
        .delete_payment_method(auth_user.user_id, payment_method_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::state_for;
    use apihub_billing::testing::Marketplace;

    fn caller(m: &Marketplace) -> Extension<AuthUser> {
        Extension(AuthUser {
            user_id: m.consumer_id,
            email: None,
        })
    }

    #[tokio::test]
    async fn test_setup_intent_returns_client_secret() {
        let m = Marketplace::seed();

        let Json(secret) = create_setup_intent(State(state_for(&m)), caller(&m))
            .await
            .unwrap();

        assert!(!secret.client_secret.is_empty());
        assert_eq!(m.gateway.customers().len(), 1);
    }

    #[tokio::test]
    async fn test_save_then_list() {
        let m = Marketplace::seed();
        m.gateway.add_card("pm_new_card", None);
        let state = state_for(&m);

        let (status, Json(saved)) = save_payment_method(
            State(state.clone()),
            caller(&m),
            Json(SavePaymentMethodRequest {
                payment_method_id: "pm_new_card".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(saved.gateway_payment_method_id, "pm_new_card");

        let Json(methods) = list_payment_methods(State(state), caller(&m)).await.unwrap();
        assert!(methods.iter().any(|pm| pm.id == saved.id));
    }

    #[tokio::test]
    async fn test_blank_id_is_bad_request() {
        let m = Marketplace::seed();

        let err = save_payment_method(
            State(state_for(&m)),
            caller(&m),
            Json(SavePaymentMethodRequest {
                payment_method_id: "  ".to_string(),
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_someone_elses_card_is_refused() {
        let m = Marketplace::seed();
        let owner = Extension(AuthUser {
            user_id: m.owner_id,
            email: None,
        });

        let err = delete_payment_method(State(state_for(&m)), owner, Path(m.card_id))
            .await
            .unwrap_err();

        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(m.store.payment_method_count(), 1);
    }
}
