//! CLI error types and conversions

use crate::client::ClientError;
use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Client error
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Orchestrator error
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
