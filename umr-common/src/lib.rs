//! # UMR Common Library
//!
//! Shared code for the utility meter reader crates:
//! - Error type used across crates
//! - TOML bootstrap configuration and root folder resolution
//! - Credential resolution (environment → TOML)
//! - Durable file helpers (write + fsync + rename)
//! - Timestamp stems used for archive file names

pub mod config;
pub mod error;
pub mod fs;
pub mod meter;
pub mod time;

pub use error::{Error, Result};
pub use meter::MeterType;
