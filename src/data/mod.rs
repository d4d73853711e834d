//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite database operations
//! - Token validation cache (volatile)
//! - Generic TTL cache backing OAuth state and profile pictures (volatile)

mod cache;
mod database;
mod models;

pub use cache::{TokenValidationCache, TtlCache, token_fingerprint};
pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
