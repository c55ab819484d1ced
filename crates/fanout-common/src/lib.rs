//! Fanout Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and fingerprint utilities for the fanout
//! workspace.
//!
//! - **Error Handling**: [`FanoutError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables
//! - **Checksums**: SHA-256 content fingerprints for artifacts
//!
//! # Example
//!
//! ```no_run
//! use fanout_common::checksum::sha256_hex;
//! use fanout_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!(fingerprint = %sha256_hex(b"payload"), "Fingerprinted");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{FanoutError, Result};
