//! Service catalog routes: services, tiers and the marketplace listing

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::{AuthUser, OptionalAuthUser},
    error::{ApiError, ApiResult},
    routes::versions::{self, VersionRecord},
    state::AppState,
};

const MAX_NAME_LEN: usize = 100;
const MAX_TAGS: usize = 20;
const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 100;

const SERVICE_COLUMNS: &str = "s.id, s.owner_id, s.name, s.slug, s.description, s.category, \
                               s.tags, s.is_published, s.created_at, s.updated_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServiceRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub is_published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ServiceRecord {
    /// Unpublished services are visible only to their owner
    pub fn is_visible_to(&self, viewer: Option<Uuid>) -> bool {
        self.is_published || viewer == Some(self.owner_id)
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TierRecord {
    pub id: Uuid,
    pub service_id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub service: ServiceRecord,
    pub versions: Vec<VersionRecord>,
    pub tiers: Vec<TierRecord>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct MarketplaceListing {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub service: ServiceRecord,
    /// Cheapest tier, `None` when the service has no tiers yet
    pub min_price_cents: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MarketplacePage {
    pub services: Vec<MarketplaceListing>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketplaceSort {
    #[default]
    Newest,
    Name,
    Price,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarketplaceQuery {
    pub q: Option<String>,
    pub category: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub free_only: bool,
    pub max_price_cents: Option<i64>,
    #[serde(default)]
    pub sort: MarketplaceSort,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl MarketplaceQuery {
    /// (page, limit) after validation
    fn paging(&self) -> ApiResult<(u32, u32)> {
        let page = self.page.unwrap_or(1);
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if page == 0 {
            return Err(ApiError::Validation("page must be at least 1".to_string()));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(ApiError::Validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        if self.max_price_cents.is_some_and(|p| p < 0) {
            return Err(ApiError::Validation(
                "max_price_cents cannot be negative".to_string(),
            ));
        }
        Ok((page, limit))
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_published: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTierRequest {
    pub name: String,
    pub price_cents: i64,
    pub description: Option<String>,
}

/// Escape LIKE wildcards so user text matches literally
fn like_pattern(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn push_marketplace_filters(builder: &mut QueryBuilder<'static, Postgres>, query: &MarketplaceQuery) {
    builder.push(" WHERE s.is_published = TRUE");

    if let Some(q) = non_blank(&query.q) {
        let pattern = like_pattern(&q);
        builder
            .push(" AND (s.name ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR s.description ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(category) = non_blank(&query.category) {
        builder.push(" AND s.category = ").push_bind(category);
    }
    if let Some(tag) = non_blank(&query.tag) {
        builder
            .push(" AND ")
            .push_bind(tag.to_lowercase())
            .push(" = ANY(s.tags)");
    }
    if query.free_only {
        builder.push(
            " AND EXISTS (SELECT 1 FROM subscription_tiers t \
             WHERE t.service_id = s.id AND t.price_cents = 0)",
        );
    }
    if let Some(max_price) = query.max_price_cents {
        builder
            .push(
                " AND EXISTS (SELECT 1 FROM subscription_tiers t \
                 WHERE t.service_id = s.id AND t.price_cents <= ",
            )
            .push_bind(max_price)
            .push(")");
    }
}

fn marketplace_count_query(query: &MarketplaceQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM services s");
    push_marketplace_filters(&mut builder, query);
    builder
}

fn marketplace_page_query(
    query: &MarketplaceQuery,
    page: u32,
    limit: u32,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT {SERVICE_COLUMNS}, \
         (SELECT MIN(t.price_cents) FROM subscription_tiers t WHERE t.service_id = s.id) \
         AS min_price_cents FROM services s"
    ));
    push_marketplace_filters(&mut builder, query);

    builder.push(match query.sort {
        MarketplaceSort::Newest => " ORDER BY s.created_at DESC, s.id",
        MarketplaceSort::Name => " ORDER BY LOWER(s.name) ASC, s.id",
        MarketplaceSort::Price => " ORDER BY min_price_cents ASC NULLS LAST, s.created_at DESC",
    });

    builder
        .push(" LIMIT ")
        .push_bind(i64::from(limit))
        .push(" OFFSET ")
        .push_bind(i64::from(page - 1) * i64::from(limit));
    builder
}

fn validate_name(name: &str, what: &str) -> ApiResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation(format!("{what} name is required")));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ApiError::Validation(format!(
            "{what} name must be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

/// Lowercased, trimmed, de-duplicated tags
fn normalize_tags(tags: &[String]) -> ApiResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    if out.len() > MAX_TAGS {
        return Err(ApiError::Validation(format!(
            "at most {MAX_TAGS} tags are allowed"
        )));
    }
    Ok(out)
}

/// URL-safe slug; an id suffix keeps equal names from colliding
fn slugify(name: &str, id: Uuid) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let base = slug.trim_end_matches('-');
    let suffix = &id.simple().to_string()[..8];
    if base.is_empty() {
        format!("service-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

pub(crate) async fn fetch_service(pool: &PgPool, service_id: Uuid) -> ApiResult<ServiceRecord> {
    sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services s WHERE s.id = $1"
    ))
    .bind(service_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("Service not found".to_string()))
}

/// Service as seen by `viewer`; hidden services read as missing
pub(crate) async fn visible_service(
    pool: &PgPool,
    service_id: Uuid,
    viewer: Option<Uuid>,
) -> ApiResult<ServiceRecord> {
    let service = fetch_service(pool, service_id).await?;
    if !service.is_visible_to(viewer) {
        return Err(ApiError::NotFound("Service not found".to_string()));
    }
    Ok(service)
}

/// Service the caller may mutate
pub(crate) async fn owned_service(
    pool: &PgPool,
    service_id: Uuid,
    user_id: Uuid,
) -> ApiResult<ServiceRecord> {
    let service = fetch_service(pool, service_id).await?;
    ensure_owner(&service, user_id)?;
    Ok(service)
}

pub(crate) fn ensure_owner(service: &ServiceRecord, user_id: Uuid) -> ApiResult<()> {
    if service.owner_id != user_id {
        return Err(ApiError::Forbidden(
            "Only the service owner can change this service".to_string(),
        ));
    }
    Ok(())
}

async fn tiers_for(pool: &PgPool, service_id: Uuid) -> ApiResult<Vec<TierRecord>> {
    let tiers = sqlx::query_as::<_, TierRecord>(
        r#"
        SELECT id, service_id, name, price_cents, description, created_at
        FROM subscription_tiers
        WHERE service_id = $1
        ORDER BY price_cents ASC, created_at ASC
        "#,
    )
    .bind(service_id)
    .fetch_all(pool)
    .await?;

    Ok(tiers)
}

/// Browse published services
pub async fn marketplace(
    State(state): State<AppState>,
    Query(query): Query<MarketplaceQuery>,
) -> ApiResult<Json<MarketplacePage>> {
    let (page, limit) = query.paging()?;

    let total = marketplace_count_query(&query)
        .build_query_scalar::<i64>()
        .fetch_one(&state.pool)
        .await?;

    let services = marketplace_page_query(&query, page, limit)
        .build_query_as::<MarketplaceListing>()
        .fetch_all(&state.pool)
        .await?;

    Ok(Json(MarketplacePage {
        services,
        page,
        limit,
        total,
    }))
}

pub async fn create_service(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateServiceRequest>,
) -> ApiResult<(StatusCode, Json<ServiceRecord>)> {
    let name = validate_name(&req.name, "Service")?;
    let tags = normalize_tags(&req.tags)?;
    let id = Uuid::new_v4();
    let slug = slugify(&name, id);

    let service = sqlx::query_as::<_, ServiceRecord>(&format!(
        r#"
        INSERT INTO services AS s (id, owner_id, name, slug, description, category, tags, is_published)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {SERVICE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(auth_user.user_id)
    .bind(&name)
    .bind(&slug)
    .bind(req.description.trim())
    .bind(non_blank(&req.category))
    .bind(&tags)
    .bind(req.is_published)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        service_id = %service.id,
        slug = %service.slug,
        "Service created"
    );

    Ok((StatusCode::CREATED, Json(service)))
}

pub async fn list_my_services(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Vec<ServiceRecord>>> {
    let services = sqlx::query_as::<_, ServiceRecord>(&format!(
        "SELECT {SERVICE_COLUMNS} FROM services s WHERE s.owner_id = $1 ORDER BY s.created_at DESC"
    ))
    .bind(auth_user.user_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(services))
}

/// Service with its versions and tiers
pub async fn get_service(
    State(state): State<AppState>,
    Extension(viewer): Extension<OptionalAuthUser>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<ServiceDetail>> {
    let service = visible_service(&state.pool, service_id, viewer.user_id()).await?;
    let versions = versions::versions_for(&state.pool, &service, viewer.user_id()).await?;
    let tiers = tiers_for(&state.pool, service.id).await?;

    Ok(Json(ServiceDetail {
        service,
        versions,
        tiers,
    }))
}

pub async fn update_service(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(service_id): Path<Uuid>,
    Json(req): Json<UpdateServiceRequest>,
) -> ApiResult<Json<ServiceRecord>> {
    owned_service(&state.pool, service_id, auth_user.user_id).await?;

    let name = req
        .name
        .as_deref()
        .map(|n| validate_name(n, "Service"))
        .transpose()?;
    let tags = req.tags.as_deref().map(normalize_tags).transpose()?;

    let service = sqlx::query_as::<_, ServiceRecord>(&format!(
        r#"
        UPDATE services AS s
        SET name = COALESCE($2, s.name),
            description = COALESCE($3, s.description),
            category = COALESCE($4, s.category),
            tags = COALESCE($5, s.tags),
            is_published = COALESCE($6, s.is_published),
            updated_at = NOW()
        WHERE s.id = $1
        RETURNING {SERVICE_COLUMNS}
        "#
    ))
    .bind(service_id)
    .bind(name)
    .bind(req.description.as_deref().map(str::trim))
    .bind(non_blank(&req.category))
    .bind(tags)
    .bind(req.is_published)
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(user_id = %auth_user.user_id, service_id = %service_id, "Service updated");

    Ok(Json(service))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_service(&state.pool, service_id, auth_user.user_id).await?;

    let live: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM service_consumers
        WHERE service_id = $1
          AND subscription_status IN ('ACTIVE', 'PENDING_CANCELLATION')
        "#,
    )
    .bind(service_id)
    .fetch_one(&state.pool)
    .await?;
    if live > 0 {
        return Err(ApiError::Conflict(format!(
            "Service has {live} active subscriber(s)"
        )));
    }

    sqlx::query("DELETE FROM services WHERE id = $1")
        .bind(service_id)
        .execute(&state.pool)
        .await?;

    tracing::info!(user_id = %auth_user.user_id, service_id = %service_id, "Service deleted");

    Ok(Json(json!({ "success": true })))
}

pub async fn list_tiers(
    State(state): State<AppState>,
    Extension(viewer): Extension<OptionalAuthUser>,
    Path(service_id): Path<Uuid>,
) -> ApiResult<Json<Vec<TierRecord>>> {
    let service = visible_service(&state.pool, service_id, viewer.user_id()).await?;
    Ok(Json(tiers_for(&state.pool, service.id).await?))
}

pub async fn create_tier(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(service_id): Path<Uuid>,
    Json(req): Json<CreateTierRequest>,
) -> ApiResult<(StatusCode, Json<TierRecord>)> {
    owned_service(&state.pool, service_id, auth_user.user_id).await?;

    let name = validate_name(&req.name, "Tier")?;
    if req.price_cents < 0 {
        return Err(ApiError::Validation(
            "price_cents cannot be negative".to_string(),
        ));
    }

    let tier = sqlx::query_as::<_, TierRecord>(
        r#"
        INSERT INTO subscription_tiers (id, service_id, name, price_cents, description)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, service_id, name, price_cents, description, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(service_id)
    .bind(&name)
    .bind(req.price_cents)
    .bind(non_blank(&req.description))
    .fetch_one(&state.pool)
    .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        service_id = %service_id,
        tier_id = %tier.id,
        price_cents = tier.price_cents,
        "Tier created"
    );

    Ok((StatusCode::CREATED, Json(tier)))
}
