//! Verification of tokens issued by the external auth provider

use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clock skew tolerated on `exp`
const LEEWAY_SECS: u64 = 60;

/// Claims this service reads from a provider token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id; becomes the primary key of `users`
    pub sub: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// HS256 verifier configured with the provider's shared secret
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                kind => JwtError::Invalid(format!("{kind:?}")),
            })
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use super::Claims;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;
    use uuid::Uuid;

    pub const SECRET: &str = "test-provider-secret";

    pub fn claims_for(user_id: Uuid) -> Claims {
        Claims {
            sub: user_id,
            email: Some("user@example.com".to_string()),
            exp: OffsetDateTime::now_utc().unix_timestamp() + 3600,
            iss: None,
            aud: None,
        }
    }

    pub fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    pub fn token_for(user_id: Uuid) -> String {
        sign(&claims_for(user_id), SECRET)
    }
}

#[cfg(test)]
mod tests {
    use super::test_tokens::*;
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn test_valid_token_yields_claims() {
        let user_id = Uuid::new_v4();
        let verifier = JwtVerifier::new(SECRET, None, None);

        let claims = verifier.verify(&token_for(user_id)).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("another-secret", None, None);

        let err = verifier.verify(&token_for(Uuid::new_v4())).unwrap_err();
        assert!(matches!(err, JwtError::Invalid(_)));
    }

    #[test]
    fn test_audience_checked_when_configured() {
        let mut claims = claims_for(Uuid::new_v4());
        claims.aud = Some("authenticated".to_string());
        let token = sign(&claims, SECRET);

        assert!(JwtVerifier::new(SECRET, None, Some("authenticated"))
            .verify(&token)
            .is_ok());
        assert!(JwtVerifier::new(SECRET, None, Some("admin"))
            .verify(&token)
            .is_err());
        // Audience present but not configured is accepted
        assert!(JwtVerifier::new(SECRET, None, None).verify(&token).is_ok());
    }

    #[test]
    fn test_issuer_checked_when_configured() {
        let mut claims = claims_for(Uuid::new_v4());
        claims.iss = Some("https://auth.example.com".to_string());
        let token = sign(&claims, SECRET);

        assert!(JwtVerifier::new(SECRET, Some("https://auth.example.com"), None)
            .verify(&token)
            .is_ok());
        assert!(JwtVerifier::new(SECRET, Some("https://evil.example.com"), None)
            .verify(&token)
            .is_err());
    }

    #[test]
    fn test_expired_token_reports_expired() {
        let mut claims = claims_for(Uuid::new_v4());
        claims.exp = OffsetDateTime::now_utc().unix_timestamp() - 3600;

        let err = JwtVerifier::new(SECRET, None, None)
            .verify(&sign(&claims, SECRET))
            .unwrap_err();
        assert_eq!(err, JwtError::Expired);
    }
}
