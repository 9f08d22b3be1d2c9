//! Authentication for ApiHub
//!
//! Sign-in lives with the external auth provider. This module only verifies
//! the provider's HS256 tokens and resolves the caller.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtError, JwtVerifier};
pub use middleware::{optional_auth, require_auth, AuthError, AuthState, AuthUser, OptionalAuthUser};
