//! BlobIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error taxonomy, checksums and
//! configuration types shared by the BlobIO client data path and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{content_checksum, header_checksum, verify_content};
pub use config::{ClientConfig, DispatchConfig, LoggingConfig, StreamConfig};
pub use error::{Error, Result};
pub use types::*;
