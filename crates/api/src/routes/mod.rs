//! HTTP routes

pub mod analytics;
pub mod endpoints;
pub mod payment_methods;
pub mod receipts;
pub mod services;
pub mod subscriptions;
pub mod tester;
pub mod users;
pub mod versions;

use axum::{
    extract::State,
    middleware,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde_json::json;

use crate::{
    auth::{optional_auth, require_auth},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Catalog reads work anonymously; a token only widens what the caller can see
    let public = Router::new()
        .route("/marketplace", get(services::marketplace))
        .route("/services/{service_id}", get(services::get_service))
        .route("/services/{service_id}/tiers", get(services::list_tiers))
        .route("/services/{service_id}/versions", get(versions::list_versions))
        .route(
            "/versions/{version_id}/endpoints",
            get(endpoints::list_endpoints),
        )
        .route("/endpoints/{endpoint_id}", get(endpoints::get_endpoint))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            optional_auth,
        ));

    let protected = Router::new()
        // Profile
        .route("/users/me", get(users::get_me).patch(users::update_me))
        // Catalog management
        .route("/services", post(services::create_service))
        .route("/services/mine", get(services::list_my_services))
        .route(
            "/services/{service_id}",
            patch(services::update_service).delete(services::delete_service),
        )
        .route("/services/{service_id}/tiers", post(services::create_tier))
        .route(
            "/services/{service_id}/versions",
            post(versions::create_version),
        )
        .route(
            "/services/{service_id}/analytics",
            get(analytics::service_analytics),
        )
        .route(
            "/versions/{version_id}",
            patch(versions::update_version).delete(versions::delete_version),
        )
        .route(
            "/versions/{version_id}/endpoints",
            post(endpoints::create_endpoint),
        )
        .route(
            "/endpoints/{endpoint_id}",
            patch(endpoints::update_endpoint).delete(endpoints::delete_endpoint),
        )
        // Subscriptions
        .route(
            "/subscriptions",
            get(subscriptions::list_subscriptions).post(subscriptions::subscribe),
        )
        .route(
            "/subscriptions/{tier_id}",
            get(subscriptions::get_subscription).delete(subscriptions::delete_subscription),
        )
        .route(
            "/subscriptions/{tier_id}/unsubscribe",
            post(subscriptions::unsubscribe),
        )
        .route("/subscriptions/{tier_id}/resume", post(subscriptions::resume))
        .route(
            "/subscriptions/{tier_id}/switch",
            post(subscriptions::switch_tier),
        )
        .route(
            "/subscriptions/{tier_id}/payment-method",
            put(subscriptions::update_payment_method),
        )
        // Payment methods
        .route(
            "/payment-methods/setup-intent",
            post(payment_methods::create_setup_intent),
        )
        .route(
            "/payment-methods",
            get(payment_methods::list_payment_methods).post(payment_methods::save_payment_method),
        )
        .route(
            "/payment-methods/{payment_method_id}",
            axum::routing::delete(payment_methods::delete_payment_method),
        )
        // Receipts
        .route("/receipts", get(receipts::list_receipts))
        // API tester
        .route("/tester/execute", post(tester::execute_test))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", public.merge(protected))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "billing": state.billing.is_some(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::test_tokens;
    use crate::test_support::state_without_billing;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn send(request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = create_router(state_without_billing())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(get_request("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["billing"], false);
    }

    #[tokio::test]
    async fn test_protected_route_without_token_is_401() {
        let (status, body) = send(get_request("/api/v1/subscriptions")).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);
    }

    #[tokio::test]
    async fn test_malformed_authorization_header_is_401() {
        let request = Request::builder()
            .uri("/api/v1/users/me")
            .header(header::AUTHORIZATION, "Basic abc")
            .body(Body::empty())
            .unwrap();

        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_expired_token_is_401() {
        let mut claims = test_tokens::claims_for(Uuid::new_v4());
        claims.exp = OffsetDateTime::now_utc().unix_timestamp() - 600;
        let token = test_tokens::sign(&claims, test_tokens::SECRET);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/tester/execute")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let (status, _) = send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_marketplace_rejects_bad_paging_before_querying() {
        let (status, body) = send(get_request("/api/v1/marketplace?limit=0")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (status, _) = send(get_request("/api/v1/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
