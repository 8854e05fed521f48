use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("no connection available after {0:?}")]
    PoolExhausted(Duration),
    #[error("invalid pool size: min {min}, max {max}")]
    PoolMisconfigured { min: usize, max: usize },
    #[error("pool is shutting down")]
    ShuttingDown,
    #[error("unknown database pool: {0}")]
    UnknownPool(String),
}
