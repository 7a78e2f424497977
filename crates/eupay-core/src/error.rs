use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage of a peer-to-peer transfer at which it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStage {
    Validation,
    Unlocking,
    KeyResolution,
    Encryption,
    Submission,
    Acknowledgment,
}

impl fmt::Display for TransferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStage::Validation => "validation",
            TransferStage::Unlocking => "unlocking",
            TransferStage::KeyResolution => "key resolution",
            TransferStage::Encryption => "encryption",
            TransferStage::Submission => "submission",
            TransferStage::Acknowledgment => "acknowledgment",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Locked: no valid unlock ticket")]
    Locked,

    #[error("Identity key unavailable: {0}")]
    KeyUnavailable(#[source] StoreError),

    #[error("Identity key slot corrupted: {0}")]
    Corrupted(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Payload authentication failed (tag mismatch, possible tampering)")]
    TamperedPayload,

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Unauthenticated: re-login required")]
    Unauthenticated,

    #[error("Passkey prompt cancelled by user")]
    UserCancelled,

    #[error("Passkey assertion invalid: {0}")]
    AssertionInvalid(String),

    #[error("Transfer failed at {stage}: {reason}")]
    TransferFailed { stage: TransferStage, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Secure storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto primitive failure: {0}")]
    Crypto(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl SecurityError {
    /// Crypto validation failures indicate corruption or an active attack and
    /// are never retried.
    pub fn is_crypto_rejection(&self) -> bool {
        matches!(
            self,
            SecurityError::TamperedPayload | SecurityError::MalformedPayload(_)
        )
    }
}

/// Failure reported by a `SecureStore` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("secure store unavailable: {0}")]
    Unavailable(String),

    #[error("secure store write failed: {0}")]
    WriteFailed(String),

    #[error("secure store read failed: {0}")]
    ReadFailed(String),
}

/// Failure reported by a `Transport` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 401/403 from the server; drives the refresh cycle.
    #[error("authorization rejected by server")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Failure reported by a `PasskeyProvider`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PasskeyError {
    #[error("user cancelled the passkey prompt")]
    Cancelled,

    #[error("platform provider rejected the request: {0}")]
    Rejected(String),

    #[error("no passkey available for this relying party")]
    NoCredential,
}

impl From<PasskeyError> for SecurityError {
    fn from(err: PasskeyError) -> Self {
        match err {
            PasskeyError::Cancelled => SecurityError::UserCancelled,
            PasskeyError::Rejected(reason) => SecurityError::AssertionInvalid(reason),
            PasskeyError::NoCredential => {
                SecurityError::AssertionInvalid("no passkey registered".into())
            }
        }
    }
}

pub type Result<T, E = SecurityError> = std::result::Result<T, E>;
