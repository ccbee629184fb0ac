use rust_decimal::Decimal;
use thiserror::Error;

/// Errors an adapter surfaces to the orchestrator/reconciler. Maps onto the
/// error taxonomy of spec §7.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("malformed market data: {0}")]
    DataShape(String),

    #[error("operation not supported by this adapter: {0}")]
    NotSupported(String),
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("would leave balance negative: {balance}")]
    NegativeBalance { balance: Decimal },

    #[error("would leave position negative: {position}")]
    NegativePosition { position: Decimal },
}

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("failed to fetch adapter truth: {0}")]
    FetchFailed(String),

    #[error("reconciliation already in progress")]
    Busy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid feature flag file: {0}")]
    InvalidFlagFile(String),

    #[error("invalid tier parameters: {0}")]
    InvalidTierParameters(String),
}
