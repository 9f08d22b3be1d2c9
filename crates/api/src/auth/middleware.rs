//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::jwt::{Claims, JwtError, JwtVerifier};

/// Cookie set by the web client after sign-in
const AUTH_COOKIE: &str = "apihub_auth_token";

/// Authenticated caller, resolved from a verified provider token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: Option<String>,
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            email: claims.email,
        }
    }
}

/// Caller on public routes; `None` for anonymous requests
#[derive(Debug, Clone, Default)]
pub struct OptionalAuthUser(pub Option<AuthUser>);

impl OptionalAuthUser {
    pub fn user_id(&self) -> Option<Uuid> {
        self.0.as_ref().map(|u| u.user_id)
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub verifier: JwtVerifier,
    pub pool: PgPool,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|cookie| cookie.strip_prefix(&format!("{AUTH_COOKIE}=")).map(String::from))
        })
}

/// Extract bearer token from Authorization header or cookie.
/// The header wins when both are present.
fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    extract_token_from_cookie(request)
}

/// Insert the caller on first sight, refresh the email otherwise
async fn ensure_user(pool: &PgPool, user: &AuthUser) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users (id, email)
        VALUES ($1, $2)
        ON CONFLICT (id) DO UPDATE
        SET email = COALESCE(EXCLUDED.email, users.email),
            updated_at = NOW()
        WHERE users.email IS DISTINCT FROM COALESCE(EXCLUDED.email, users.email)
        "#,
    )
    .bind(user.user_id)
    .bind(&user.email)
    .execute(pool)
    .await?;

    Ok(())
}

fn authenticate(auth_state: &AuthState, request: &Request) -> Result<AuthUser, AuthError> {
    let token = extract_bearer_token(request).ok_or(AuthError::MissingAuth)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthFormat);
    }

    auth_state
        .verifier
        .verify(&token)
        .map(AuthUser::from)
        .map_err(|e| match e {
            JwtError::Expired => AuthError::ExpiredToken,
            JwtError::Invalid(_) => AuthError::InvalidToken,
        })
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_user = match authenticate(&auth_state, &request) {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            return err.into_response();
        }
    };

    if let Err(e) = ensure_user(&auth_state.pool, &auth_user).await {
        tracing::error!(
            user_id = %auth_user.user_id,
            error = %e,
            "require_auth: failed to record user"
        );
        return AuthError::DatabaseError.into_response();
    }

    tracing::debug!(path = %path, user_id = %auth_user.user_id, "require_auth: authenticated");
    request.extensions_mut().insert(auth_user);
    next.run(request).await
}

/// Middleware that optionally authenticates (for public endpoints that benefit from auth)
pub async fn optional_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let caller = authenticate(&auth_state, &request).ok();
    request.extensions_mut().insert(OptionalAuthUser(caller));
    next.run(request).await
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token has expired")]
    ExpiredToken,
    #[error("Database error")]
    DatabaseError,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "Invalid authentication format")
            }
            AuthError::InvalidToken | AuthError::ExpiredToken => {
                (StatusCode::UNAUTHORIZED, "Invalid or expired token")
            }
            AuthError::DatabaseError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: Option<(&str, &str)>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/api/v1/users/me");
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_header_extracted() {
        let request = request_with(Some(("Authorization", "Bearer abc.def.ghi")));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn test_other_schemes_ignored() {
        let request = request_with(Some(("Authorization", "Basic dXNlcjpwYXNz")));
        assert_eq!(extract_bearer_token(&request), None);
    }

    #[test]
    fn test_cookie_fallback() {
        let request = request_with(Some(("Cookie", "theme=dark; apihub_auth_token=tok123")));
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_header_preferred_over_cookie() {
        let request = axum::http::Request::builder()
            .header("Authorization", "Bearer from-header")
            .header("Cookie", "apihub_auth_token=from-cookie")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer_token(&request).as_deref(), Some("from-header"));
    }

    #[tokio::test]
    async fn test_auth_error_body() {
        let response = AuthError::ExpiredToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Invalid or expired token");
        assert_eq!(body["code"], 401);
    }
}
