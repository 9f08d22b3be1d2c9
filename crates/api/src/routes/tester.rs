//! API tester route

use std::collections::BTreeMap;

use apihub_shared::HttpMethod;
use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::versions,
    state::AppState,
    tester::{self, TestResult},
};

#[derive(Debug, Deserialize)]
pub struct ExecuteTestRequest {
    pub version_id: Uuid,
    pub method: String,
    /// Path template, e.g. `/users/{id}`
    pub path: String,
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<serde_json::Value>,
}

pub async fn execute_test(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ExecuteTestRequest>,
) -> ApiResult<Json<TestResult>> {
    let method: HttpMethod = req
        .method
        .trim()
        .parse()
        .map_err(|e: apihub_shared::ParseEnumError| ApiError::Validation(e.to_string()))?;

    let (version, _service) =
        versions::visible_version(&state.pool, req.version_id, Some(auth_user.user_id)).await?;

    let url = tester::build_url(&version.base_url, &req.path, &req.path_params, &req.query)?;

    tracing::info!(
        user_id = %auth_user.user_id,
        version_id = %version.id,
        method = %method,
        url = %url,
        "Executing API test request"
    );

    let result = state
        .tester
        .execute(method, url, &req.headers, req.body.as_ref())
        .await?;

    Ok(Json(result))
}
