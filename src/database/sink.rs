/// Upstream store interface
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Duration;

use crate::models::Batch;

#[derive(Debug, Error)]
pub enum SinkConnectError {
    #[error("invalid database URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("connection failed: {0}")]
    Connect(#[from] tokio_postgres::Error),

    #[error("failed to prepare schema: {0}")]
    Schema(#[source] tokio_postgres::Error),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("sink unreachable: {0}")]
    Unreachable(String),

    #[error("write timed out after {0:?}")]
    Timeout(Duration),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

impl WriteError {
    /// Whether retrying the same batch can reasonably succeed
    pub fn is_transient(&self) -> bool {
        match self {
            WriteError::Unreachable(_) | WriteError::Timeout(_) => true,
            WriteError::Database(e) => match e.code() {
                // No SQLSTATE means the failure happened below the protocol (I/O, closed socket)
                None => true,
                // connection exception, transaction rollback, insufficient resources, operator intervention
                Some(state) => matches!(state.code().get(..2), Some("08" | "40" | "53" | "57")),
            },
            WriteError::Rejected(_) => false,
        }
    }
}

/// A store that accepts tagged, timestamped points in batches.
///
/// `write` reports success or failure for the whole batch and returns how
/// many points were stored. The store is not assumed to be idempotent.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, batch: &Batch) -> Result<usize, WriteError>;
}
