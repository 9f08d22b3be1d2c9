// API crate clippy configuration
#![allow(clippy::single_match)] // Clearer in some cases
#![allow(clippy::needless_borrows_for_generic_args)] // Sometimes needed for clarity
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ApiHub API Library
//!
//! HTTP server components for the ApiHub marketplace: catalog, subscriptions,
//! payment methods, receipts and the API tester.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod tester;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
