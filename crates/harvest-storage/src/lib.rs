//! Persistence collaborators (company rows, execution history, crawl cursors) and the
//! rate-limited HTTP fetcher used by the site adapters.

use harvest_core::BatchError;
use thiserror::Error;

pub mod company;
pub mod cursor;
pub mod execution;
pub mod fetch;
pub mod postgres;

pub use company::{CompanyStore, CompanyTx, MemoryCompanyStore};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use execution::{ExecutionStore, MemoryExecutionStore};
pub use fetch::{
    BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, RetryDisposition,
    TokenBucketConfig,
};
pub use postgres::{connect_pool, run_migrations, PgCompanyStore, PgExecutionStore};

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store access failure: {0}")]
    Access(String),
    #[error("corrupt stored state: {0}")]
    Corrupt(String),
}

/// SQLSTATEs worth retrying: serialization failure, deadlock, lock timeout, admin shutdown.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01"];

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db)
                if db
                    .code()
                    .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref())) =>
            {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Access(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<StoreError> for BatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(msg) => BatchError::StoreTransient(msg),
            StoreError::Access(msg) => BatchError::StoreAccess(msg),
            StoreError::Corrupt(msg) => BatchError::IllegalArgument(msg),
        }
    }
}

impl From<FetchError> for BatchError {
    fn from(err: FetchError) -> Self {
        BatchError::Io(err.to_string())
    }
}
