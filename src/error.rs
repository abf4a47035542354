//! Error types for the withdrawal engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the withdrawal engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Contract artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Key decryption failed: {0}")]
    Decryption(String),

    // Validation errors (raised before any network call)
    #[error("Invalid destination address: {0}")]
    InvalidAddress(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    // Funding errors
    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: f64, required: f64 },

    #[error("Gas payer balance too low: needs at least {required} in reserve")]
    InsufficientGasFunds { required: u128 },

    #[error("No active custodial wallet holds enough balance on {0}")]
    NoCustodialFunds(String),

    #[error("Insufficient UTXOs: {total_sats} sats selected, {required_sats} sats required")]
    InsufficientUtxos { total_sats: u64, required_sats: u64 },

    // Signing errors
    #[error("Permit signature mismatch: recovered {recovered}, expected {expected}")]
    SignatureMismatch { recovered: String, expected: String },

    #[error("Gas estimation failed: {0}")]
    GasEstimation(String),

    // Network errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("Confirmation timeout after {0}s")]
    ConfirmationTimeout(u64),

    #[error("Transaction not found after {attempts} polling attempts")]
    NotFoundTimeout { attempts: u32 },

    // Store errors
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::Broadcast(_) | Error::NotFoundTimeout { .. }
        )
    }

    /// Check if this error should fail the request and refund the
    /// originating wallet. Timeouts are excluded: the request stays
    /// pending and is re-checked on the next scheduler pass.
    pub fn is_refundable(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds { .. }
                | Error::InsufficientGasFunds { .. }
                | Error::NoCustodialFunds(_)
                | Error::InsufficientUtxos { .. }
                | Error::InvalidAddress(_)
                | Error::SignatureMismatch { .. }
                | Error::Broadcast(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Rpc(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Rpc("connection reset".into()).is_retryable());
        assert!(Error::Broadcast("relay rejected".into()).is_retryable());
        assert!(!Error::Config("missing rpc url".into()).is_retryable());
        assert!(!Error::Decryption("bad ciphertext".into()).is_retryable());
        assert!(!Error::ConfirmationTimeout(300).is_retryable());
    }

    #[test]
    fn test_refundable_classification() {
        assert!(Error::InsufficientFunds {
            available: 1.0,
            required: 2.0
        }
        .is_refundable());
        assert!(Error::InvalidAddress("0xzz".into()).is_refundable());
        // A confirmation timeout leaves the request pending, never refunds
        assert!(!Error::ConfirmationTimeout(300).is_refundable());
        assert!(!Error::Rpc("flaky".into()).is_refundable());
    }
}
