//! Persistence seams, Postgres/in-memory stores, job locks and the HTTP fetcher for fundsync.

use thiserror::Error;

pub mod cache;
pub mod http;
pub mod lock;
pub mod memory;
pub mod postgres;
pub mod store;

pub use cache::{ConfigCache, TtlCache};
pub use http::{
    retryable_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    HttpRequest, TokenBucketConfig,
};
pub use lock::{HeldLock, LockGuard, LockManager, PgAdvisoryLock};
pub use memory::{MemoryLock, MemoryStore, MemoryUser};
pub use postgres::{PgStore, PoolConfig};
pub use store::*;

pub const CRATE_NAME: &str = "fundsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding stored value: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub fn message(msg: impl Into<String>) -> Self {
        StoreError::Message(msg.into())
    }
}
