//! `PostgreSQL` aggregate store for Turnstile.
//!
//! This crate provides the production implementation of
//! [`AggregateStore`](turnstile_core::AggregateStore). It uses sqlx with
//! runtime-checked queries and supports:
//!
//! - Conditional writes against per-row versions
//! - Configurable isolation (`SERIALIZABLE` by default)
//! - Unique constraints for payments and idempotency keys, reported by name
//! - Connection pooling and embedded migrations
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use turnstile_postgres::{PostgresConfig, PostgresStore};
//! use turnstile_runtime::{RegistrationService, TurnstileConfig};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect(&PostgresConfig::from_env()?).await?;
//!     store.migrate().await?;
//!     let service = RegistrationService::new(Arc::new(store), &TurnstileConfig::from_env());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod rows;
mod store;

pub use config::{ConfigError, IsolationLevel, PostgresConfig};
pub use store::PostgresStore;
