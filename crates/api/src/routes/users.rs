//! Profile of the signed-in user

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const MAX_DISPLAY_NAME_LEN: usize = 100;

#[derive(Debug, Serialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// A gateway customer exists, so saved cards can be listed
    pub has_billing_profile: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    /// Blank clears the name
    pub display_name: Option<String>,
}

fn normalize_display_name(name: Option<&str>) -> ApiResult<Option<String>> {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return Ok(None);
    };
    if name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(ApiError::Validation(format!(
            "display_name must be at most {MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(Some(name.to_string()))
}

pub async fn get_me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UserProfile>> {
    let profile = sqlx::query_as::<_, UserProfile>(
        r#"
        SELECT id, email, display_name,
               stripe_customer_id IS NOT NULL AS has_billing_profile,
               created_at
        FROM users
        WHERE id = $1
        "#,
    )
    .bind(auth_user.user_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    Ok(Json(profile))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<UserProfile>> {
    let display_name = normalize_display_name(req.display_name.as_deref())?;

    let profile = sqlx::query_as::<_, UserProfile>(
        r#"
        UPDATE users
        SET display_name = $2, updated_at = NOW()
        WHERE id = $1
        RETURNING id, email, display_name,
                  stripe_customer_id IS NOT NULL AS has_billing_profile,
                  created_at
        "#,
    )
    .bind(auth_user.user_id)
    .bind(&display_name)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    tracing::info!(user_id = %auth_user.user_id, "Profile updated");

    Ok(Json(profile))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_trimmed() {
        assert_eq!(
            normalize_display_name(Some("  Ada  ")).unwrap(),
            Some("Ada".to_string())
        );
    }

    #[test]
    fn test_blank_display_name_clears() {
        assert_eq!(normalize_display_name(Some("   ")).unwrap(), None);
        assert_eq!(normalize_display_name(None).unwrap(), None);
    }

    #[test]
    fn test_long_display_name_rejected() {
        let long = "n".repeat(101);
        assert!(normalize_display_name(Some(&long)).is_err());
    }
}
