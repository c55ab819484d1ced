//! Errors raised by the shared utilities

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FanoutError>;

#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Content no longer hashes to the fingerprint recorded at listing time
    #[error("Fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },
}
