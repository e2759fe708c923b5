//! Regroup Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Regroup workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber bootstrap shared by every binary
//! - **Checksums**: content digests recorded in message manifests
//!
//! # Example
//!
//! ```no_run
//! use regroup_common::checksum::{digest_bytes, ChecksumAlgorithm};
//! use regroup_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     let digest = digest_bytes(b"id,name\n1,a\n", ChecksumAlgorithm::Sha256);
//!     tracing::info!(%digest, "digest computed");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
