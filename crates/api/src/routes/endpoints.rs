//! Endpoint documentation routes

use apihub_shared::HttpMethod;
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{types::Json as SqlJson, FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{AuthUser, OptionalAuthUser},
    error::{ApiError, ApiResult},
    routes::versions,
    state::AppState,
};

const ENDPOINT_COLUMNS: &str = "id, version_id, method, path, summary, description, parameters, \
                                request_body, responses, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterLocation {
    Path,
    Query,
    Header,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointParameter {
    pub name: String,
    #[serde(rename = "in")]
    pub location: ParameterLocation,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

#[derive(Debug, FromRow)]
struct EndpointRow {
    id: Uuid,
    version_id: Uuid,
    method: String,
    path: String,
    summary: Option<String>,
    description: Option<String>,
    parameters: SqlJson<Vec<EndpointParameter>>,
    request_body: Option<SqlJson<Value>>,
    responses: SqlJson<Value>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub version_id: Uuid,
    pub method: HttpMethod,
    pub path: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub parameters: Vec<EndpointParameter>,
    pub request_body: Option<Value>,
    pub responses: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl TryFrom<EndpointRow> for Endpoint {
    type Error = ApiError;

    fn try_from(row: EndpointRow) -> Result<Self, Self::Error> {
        let method = row
            .method
            .parse()
            .map_err(|e: apihub_shared::ParseEnumError| ApiError::Internal(e.to_string()))?;

        Ok(Self {
            id: row.id,
            version_id: row.version_id,
            method,
            path: row.path,
            summary: row.summary,
            description: row.description,
            parameters: row.parameters.0,
            request_body: row.request_body.map(|b| b.0),
            responses: row.responses.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateEndpointRequest {
    pub method: String,
    pub path: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Vec<EndpointParameter>,
    pub request_body: Option<Value>,
    pub responses: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEndpointRequest {
    pub method: Option<String>,
    pub path: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub parameters: Option<Vec<EndpointParameter>>,
    pub request_body: Option<Value>,
    pub responses: Option<Value>,
}

fn parse_method(raw: &str) -> ApiResult<HttpMethod> {
    raw.trim()
        .parse()
        .map_err(|e: apihub_shared::ParseEnumError| ApiError::Validation(e.to_string()))
}

fn validate_path(path: &str) -> ApiResult<String> {
    let path = path.trim();
    if !path.starts_with('/') {
        return Err(ApiError::Validation("path must start with '/'".to_string()));
    }
    Ok(path.to_string())
}

/// Names must be non-empty; path parameters are always required
fn normalize_parameters(mut params: Vec<EndpointParameter>) -> ApiResult<Vec<EndpointParameter>> {
    for param in &mut params {
        param.name = param.name.trim().to_string();
        if param.name.is_empty() {
            return Err(ApiError::Validation(
                "parameter name is required".to_string(),
            ));
        }
        if param.location == ParameterLocation::Path {
            param.required = true;
        }
    }
    Ok(params)
}

fn validate_responses(responses: &Value) -> ApiResult<()> {
    if !responses.is_object() {
        return Err(ApiError::Validation(
            "responses must be a JSON object keyed by status code".to_string(),
        ));
    }
    Ok(())
}

async fn fetch_endpoint(pool: &PgPool, endpoint_id: Uuid) -> ApiResult<Endpoint> {
    sqlx::query_as::<_, EndpointRow>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE id = $1"
    ))
    .bind(endpoint_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("Endpoint not found".to_string()))?
    .try_into()
}

/// Endpoint whose service the caller owns
async fn owned_endpoint(pool: &PgPool, endpoint_id: Uuid, user_id: Uuid) -> ApiResult<Endpoint> {
    let endpoint = fetch_endpoint(pool, endpoint_id).await?;
    versions::owned_version(pool, endpoint.version_id, user_id).await?;
    Ok(endpoint)
}

fn conflict_message(e: sqlx::Error, method: HttpMethod, path: &str) -> ApiError {
    match ApiError::from(e) {
        ApiError::Conflict(_) => {
            ApiError::Conflict(format!("{method} {path} is already documented in this version"))
        }
        other => other,
    }
}

pub async fn list_endpoints(
    State(state): State<AppState>,
    Extension(viewer): Extension<OptionalAuthUser>,
    Path(version_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Endpoint>>> {
    versions::visible_version(&state.pool, version_id, viewer.user_id()).await?;

    let rows = sqlx::query_as::<_, EndpointRow>(&format!(
        "SELECT {ENDPOINT_COLUMNS} FROM endpoints WHERE version_id = $1 ORDER BY path, method"
    ))
    .bind(version_id)
    .fetch_all(&state.pool)
    .await?;

    let endpoints = rows
        .into_iter()
        .map(Endpoint::try_from)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Json(endpoints))
}

pub async fn get_endpoint(
    State(state): State<AppState>,
    Extension(viewer): Extension<OptionalAuthUser>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<Json<Endpoint>> {
    let endpoint = fetch_endpoint(&state.pool, endpoint_id).await?;
    versions::visible_version(&state.pool, endpoint.version_id, viewer.user_id())
        .await
        .map_err(|_| ApiError::NotFound("Endpoint not found".to_string()))?;

    Ok(Json(endpoint))
}

pub async fn create_endpoint(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(version_id): Path<Uuid>,
    Json(req): Json<CreateEndpointRequest>,
) -> ApiResult<(StatusCode, Json<Endpoint>)> {
    versions::owned_version(&state.pool, version_id, auth_user.user_id).await?;

    let method = parse_method(&req.method)?;
    let path = validate_path(&req.path)?;
    let parameters = normalize_parameters(req.parameters)?;
    let responses = req.responses.unwrap_or_else(|| json!({}));
    validate_responses(&responses)?;

    let row = sqlx::query_as::<_, EndpointRow>(&format!(
        r#"
        INSERT INTO endpoints
            (id, version_id, method, path, summary, description, parameters, request_body, responses)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {ENDPOINT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(version_id)
    .bind(method.as_str())
    .bind(&path)
    .bind(&req.summary)
    .bind(&req.description)
    .bind(SqlJson(&parameters))
    .bind(req.request_body.as_ref().map(SqlJson))
    .bind(SqlJson(&responses))
    .fetch_one(&state.pool)
    .await
    .map_err(|e| conflict_message(e, method, &path))?;

    let endpoint = Endpoint::try_from(row)?;

    tracing::info!(
        user_id = %auth_user.user_id,
        version_id = %version_id,
        method = %endpoint.method,
        path = %endpoint.path,
        "Endpoint created"
    );

    Ok((StatusCode::CREATED, Json(endpoint)))
}

pub async fn update_endpoint(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(endpoint_id): Path<Uuid>,
    Json(req): Json<UpdateEndpointRequest>,
) -> ApiResult<Json<Endpoint>> {
    let current = owned_endpoint(&state.pool, endpoint_id, auth_user.user_id).await?;

    let method = req.method.as_deref().map(parse_method).transpose()?;
    let path = req.path.as_deref().map(validate_path).transpose()?;
    let parameters = req.parameters.map(normalize_parameters).transpose()?;
    if let Some(responses) = &req.responses {
        validate_responses(responses)?;
    }

    let effective_method = method.unwrap_or(current.method);
    let effective_path = path.clone().unwrap_or_else(|| current.path.clone());

    let row = sqlx::query_as::<_, EndpointRow>(&format!(
        r#"
        UPDATE endpoints
        SET method = COALESCE($2, method),
            path = COALESCE($3, path),
            summary = COALESCE($4, summary),
            description = COALESCE($5, description),
            parameters = COALESCE($6, parameters),
            request_body = COALESCE($7, request_body),
            responses = COALESCE($8, responses),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {ENDPOINT_COLUMNS}
        "#
    ))
    .bind(endpoint_id)
    .bind(method.map(|m| m.as_str()))
    .bind(path)
    .bind(&req.summary)
    .bind(&req.description)
    .bind(parameters.as_ref().map(SqlJson))
    .bind(req.request_body.as_ref().map(SqlJson))
    .bind(req.responses.as_ref().map(SqlJson))
    .fetch_one(&state.pool)
    .await
    .map_err(|e| conflict_message(e, effective_method, &effective_path))?;

    tracing::info!(user_id = %auth_user.user_id, endpoint_id = %endpoint_id, "Endpoint updated");

    Ok(Json(Endpoint::try_from(row)?))
}

pub async fn delete_endpoint(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(endpoint_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    owned_endpoint(&state.pool, endpoint_id, auth_user.user_id).await?;

    sqlx::query("DELETE FROM endpoints WHERE id = $1")
        .bind(endpoint_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, endpoint_id = %endpoint_id, "Endpoint deleted");

    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method() {
        assert_eq!(parse_method(" post ").unwrap(), HttpMethod::Post);
        assert!(matches!(parse_method("TRACE"), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_path_must_start_with_slash() {
        assert_eq!(validate_path("/users/{id}").unwrap(), "/users/{id}");
        assert!(validate_path("users").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn test_path_parameters_forced_required() {
        let params: Vec<EndpointParameter> = serde_json::from_value(json!([
            { "name": " id ", "in": "path" },
            { "name": "verbose", "in": "query" }
        ]))
        .unwrap();

        let params = normalize_parameters(params).unwrap();

        assert_eq!(params[0].name, "id");
        assert!(params[0].required);
        assert!(!params[1].required);
    }

    #[test]
    fn test_blank_parameter_name_rejected() {
        let params = vec![EndpointParameter {
            name: "  ".to_string(),
            location: ParameterLocation::Header,
            required: false,
            description: None,
            schema: None,
        }];
        assert!(normalize_parameters(params).is_err());
    }

    #[test]
    fn test_unknown_parameter_location_rejected() {
        let parsed: Result<EndpointParameter, _> =
            serde_json::from_value(json!({ "name": "session", "in": "cookie" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_responses_must_be_object() {
        assert!(validate_responses(&json!({ "200": { "description": "OK" } })).is_ok());
        assert!(validate_responses(&json!(["200"])).is_err());
    }

    #[test]
    fn test_row_with_unknown_method_is_internal() {
        let now = OffsetDateTime::now_utc();
        let row = EndpointRow {
            id: Uuid::new_v4(),
            version_id: Uuid::new_v4(),
            method: "TRACE".to_string(),
            path: "/".to_string(),
            summary: None,
            description: None,
            parameters: SqlJson(vec![]),
            request_body: None,
            responses: SqlJson(json!({})),
            created_at: now,
            updated_at: now,
        };

        assert!(matches!(Endpoint::try_from(row), Err(ApiError::Internal(_))));
    }
}
