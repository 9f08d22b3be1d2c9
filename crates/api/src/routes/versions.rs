//! Version routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::{AuthUser, OptionalAuthUser},
    error::{ApiError, ApiResult},
    routes::services::{self, ServiceRecord},
    state::AppState,
    tester,
};

const VERSION_COLUMNS: &str =
    "id, service_id, version, base_url, changelog, is_published, created_at, updated_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct VersionRecord {
    pub id: Uuid,
    pub service_id: Uuid,
    pub version: String,
    pub base_url: String,
    pub changelog: Option<String>,
    pub is_published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl VersionRecord {
    /// Drafts are visible only to the service owner
    pub fn is_visible_to(&self, service: &ServiceRecord, viewer: Option<Uuid>) -> bool {
        service.is_visible_to(viewer) && (self.is_published || viewer == Some(service.owner_id))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateVersionRequest {
    pub version: String,
    pub base_url: String,
    pub changelog: Option<String>,
    #[serde(default)]
    pub is_published: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVersionRequest {
    pub version: Option<String>,
    pub base_url: Option<String>,
    pub changelog: Option<String>,
    pub is_published: Option<bool>,
}

/// Base URLs must be absolute http(s) URLs with a host. Internal hosts are
/// refused unless the tester may reach them.
pub(crate) fn validate_base_url(raw: &str, allow_private: bool) -> ApiResult<String> {
    let raw = raw.trim();
    let url = Url::parse(raw)
        .map_err(|e| ApiError::Validation(format!("base_url is not a valid URL: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::Validation(
            "base_url must use http or https".to_string(),
        ));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ApiError::Validation("base_url must include a host".to_string()));
    }
    if !allow_private {
        tester::ensure_public_target(&url)
            .map_err(|_| ApiError::Validation("base_url must point to a public host".to_string()))?;
    }

    Ok(raw.to_string())
}

fn validate_label(label: &str) -> ApiResult<String> {
    let label = label.trim();
    if label.is_empty() {
        return Err(ApiError::Validation("version label is required".to_string()));
    }
    if label.len() > 50 {
        return Err(ApiError::Validation(
            "version label must be at most 50 characters".to_string(),
        ));
    }
    Ok(label.to_string())
}

/// Versions of `service` that `viewer` may see, newest first
pub(crate) async fn versions_for(
    pool: &PgPool,
    service: &ServiceRecord,
    viewer: Option<Uuid>,
) -> ApiResult<Vec<VersionRecord>> {
    let versions = sqlx::query_as::<_, VersionRecord>(&format!(
        "SELECT {VERSION_COLUMNS} FROM service_versions WHERE service_id = $1 ORDER BY created_at DESC"
    ))
    .bind(service.id)
    .fetch_all(pool)
    .await?;

    Ok(versions
        .into_iter()
        .filter(|v| v.is_visible_to(service, viewer))
        .collect())
}

/// Version plus its parent service
pub(crate) async fn version_with_service(
    pool: &PgPool,
    version_id: Uuid,
) -> ApiResult<(VersionRecord, ServiceRecord)> {
    let version = sqlx::query_as::<_, VersionRecord>(&format!(
        "SELECT {VERSION_COLUMNS} FROM service_versions WHERE id = $1"
    ))
    .bind(version_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("Version not found".to_string()))?;

    let service = services::fetch_service(pool, version.service_id).await?;
    Ok((version, service))
}

/// Version as seen by `viewer`; hidden versions read as missing
pub(crate) async fn visible_version(
    pool: &PgPool,
    version_id: Uuid,
    viewer: Option<Uuid>,
) -> ApiResult<(VersionRecord, ServiceRecord)> {
    let (version, service) = version_with_service(pool, version_id).await?;
    if !version.is_visible_to(&service, viewer) {
        return Err(ApiError::NotFound("Version not found".to_string()));
    }
    Ok((version, service))
}

/// Version whose service the caller owns
pub(crate) async fn owned_version(
    pool: &PgPool,
    version_id: Uuid,
    user_id: Uuid,
) -> ApiResult<VersionRecord> {
    let (version, service) = version_with_service(pool, version_id).await?;
    services::ensure_owner(&service, user_id)?;
    Ok(version)
}

pub async fn list_versions(
    State(state): State<AppState>,
    Extension(viewer): Extension<OptionalAuthUser>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<Vec<VersionRecord>>> {
    let service = services::visible_service(&state.pool, service_id, viewer.user_id()).await?;
    Ok(Json(
        versions_for(&state.pool, &service, viewer.user_id()).await?,
    ))
}

pub async fn create_version(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(service_id): Path<Uuid>,
    Json(req): Json<CreateVersionRequest>,
) -> ApiResult<(StatusCode, Json<VersionRecord>)> {
    services::owned_service(&state.pool, service_id, auth_user.user_id).await?;
    let label = validate_label(&req.version)?;
    let base_url = validate_base_url(&req.base_url, state.config.tester_allow_private_targets)?;

    let version = sqlx::query_as::<_, VersionRecord>(&format!(
        r#"
        INSERT INTO service_versions (id, service_id, version, base_url, changelog, is_published)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {VERSION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(service_id)
    .bind(&label)
    .bind(&base_url)
    .bind(&req.changelog)
    .bind(req.is_published)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| match ApiError::from(e) {
        ApiError::Conflict(_) => ApiError::Conflict(format!("Version {label} already exists")),
        other => other,
    })?;

    tracing::info!(
        user_id = %auth_user.user_id,
        service_id = %service_id,
        version = %version.version,
        "Version created"
    );

    Ok((StatusCode::CREATED, Json(version)))
}

pub async fn update_version(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(version_id): Path<Uuid>,
    Json(req): Json<UpdateVersionRequest>,
) -> ApiResult<Json<VersionRecord>> {
    owned_version(&state.pool, version_id, auth_user.user_id).await?;

    let label = req.version.as_deref().map(validate_label).transpose()?;
    let base_url = req
        .base_url
        .as_deref()
        .map(|raw| validate_base_url(raw, state.config.tester_allow_private_targets))
        .transpose()?;

    let version = sqlx::query_as::<_, VersionRecord>(&format!(
        r#"
        UPDATE service_versions
        SET version = COALESCE($2, version),
            base_url = COALESCE($3, base_url),
            changelog = COALESCE($4, changelog),
            is_published = COALESCE($5, is_published),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {VERSION_COLUMNS}
        "#
    ))
    .bind(version_id)
    .bind(label)
    .bind(base_url)
    .bind(&req.changelog)
    .bind(req.is_published)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %auth_user.user_id, version_id = %version_id, "Version updated");

    Ok(Json(version))
}

pub async fn delete_version(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(version_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_version(&state.pool, version_id, auth_user.user_id).await?;

    sqlx::query("DELETE FROM service_versions WHERE id = $1")
        .bind(version_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, version_id = %version_id, "Version deleted");

    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(owner_id: Uuid, service_published: bool, version_published: bool) -> (VersionRecord, ServiceRecord) {
        let now = OffsetDateTime::now_utc();
        let service = ServiceRecord {
            id: Uuid::new_v4(),
            owner_id,
            name: "Weather API".to_string(),
            slug: "weather-api".to_string(),
            description: String::new(),
            category: None,
            tags: vec![],
            is_published: service_published,
            created_at: now,
            updated_at: now,
        };
        let version = VersionRecord {
            id: Uuid::new_v4(),
            service_id: service.id,
            version: "v1".to_string(),
            base_url: "https://api.example.com".to_string(),
            changelog: None,
            is_published: version_published,
            created_at: now,
            updated_at: now,
        };
        (version, service)
    }

    #[test]
    fn test_base_url_must_be_absolute_http() {
        assert!(validate_base_url("https://api.example.com/v1", false).is_ok());
        assert!(validate_base_url("/v1", false).is_err());
        assert!(validate_base_url("ftp://files.example.com", false).is_err());
        assert!(validate_base_url("mailto:someone@example.com", false).is_err());
    }

    #[test]
    fn test_base_url_internal_hosts_need_opt_in() {
        for raw in [
            "http://169.254.169.254/latest",
            "http://127.0.0.1:5432",
            "http://localhost:8080",
            "http://10.0.0.7/api",
            "http://[fd00::1]/",
        ] {
            assert!(validate_base_url(raw, false).is_err(), "{raw}");
        }
        assert!(validate_base_url(" http://localhost:8080 ", true).is_ok());
    }

    #[test]
    fn test_base_url_is_trimmed() {
        assert_eq!(
            validate_base_url("  https://api.example.com  ", false).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn test_label_rules() {
        assert_eq!(validate_label(" v2.1 ").unwrap(), "v2.1");
        assert!(validate_label("").is_err());
        assert!(validate_label(&"9".repeat(51)).is_err());
    }

    #[test]
    fn test_draft_version_hidden_from_others() {
        let owner = Uuid::new_v4();
        let (draft, service) = records(owner, true, false);

        assert!(draft.is_visible_to(&service, Some(owner)));
        assert!(!draft.is_visible_to(&service, Some(Uuid::new_v4())));
        assert!(!draft.is_visible_to(&service, None));
    }

    #[test]
    fn test_published_version_of_unpublished_service_hidden() {
        let owner = Uuid::new_v4();
        let (version, service) = records(owner, false, true);

        assert!(!version.is_visible_to(&service, None));
        assert!(version.is_visible_to(&service, Some(owner)));
    }
}
