#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ApiHub Shared
//!
//! Types and database helpers used by the API server, the billing crate and
//! the background worker.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DEFAULT_MAX_CONNECTIONS};
pub use types::{HttpMethod, ParseEnumError, ReceiptStatus, SubscriptionStatus};
