//! Error Types for paywatch
//!
//! Component errors convert into [`PaymentError`] so callers can use `?`
//! across the crate.

use thiserror::Error;

use crate::config::ConfigError;
use crate::esplora::EsploraError;
use crate::logging::LoggingError;
use crate::payment::{
    AddressError, BalanceQueryError, ConnectionError, KeyGenerationError, TransferError,
};

/// Root error type
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Receiving keypair could not be generated
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] KeyGenerationError),

    #[error(transparent)]
    Address(#[from] AddressError),

    /// Live feed could not be established
    #[error("feed error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("balance query error: {0}")]
    BalanceQuery(#[from] BalanceQueryError),

    /// Forwarding failed; funds remain at the receiver
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("esplora error: {0}")]
    Esplora(#[from] EsploraError),

    #[error("validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),
}

impl PaymentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check if retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::Connection(_)
            | PaymentError::BalanceQuery(_)
            | PaymentError::Esplora(_) => true,
            PaymentError::Transfer(e) => !matches!(
                e,
                TransferError::InvalidDestination(_) | TransferError::NoKeyMaterial
            ),
            _ => false,
        }
    }

    /// Stable code for logs
    pub fn error_code(&self) -> &'static str {
        match self {
            PaymentError::KeyGeneration(_) => "KEY_GENERATION_ERROR",
            PaymentError::Address(_) => "ADDRESS_ERROR",
            PaymentError::Connection(_) => "CONNECTION_ERROR",
            PaymentError::BalanceQuery(_) => "BALANCE_QUERY_ERROR",
            PaymentError::Transfer(_) => "TRANSFER_ERROR",
            PaymentError::Esplora(_) => "ESPLORA_ERROR",
            PaymentError::Validation(_) => "VALIDATION_ERROR",
            PaymentError::InvalidState(_) => "INVALID_STATE",
            PaymentError::Config(_) => "CONFIG_ERROR",
            PaymentError::Logging(_) => "LOGGING_ERROR",
        }
    }
}

/// Result type alias using PaymentError
pub type Result<T> = std::result::Result<T, PaymentError>;
