//! Snapdex Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the Snapdex workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `SnapdexError` and the `Result` alias
//! - **Identity**: content-derived image identity (`ImageIdentity`)
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use snapdex_common::{ImageIdentity, Result};
//!
//! fn name_image(bytes: &[u8]) -> Result<String> {
//!     let identity = ImageIdentity::of(bytes);
//!     Ok(identity.to_string())
//! }
//! ```

pub mod error;
pub mod identity;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SnapdexError};
pub use identity::ImageIdentity;
