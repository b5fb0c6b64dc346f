//! Ferrule Common Library
//!
//! Shared error taxonomy, settings and TLS helpers for the ferrule crates.

pub mod config;
pub mod error;
pub mod tls;

// Re-export commonly used types
pub use config::ClickHouseSettings;
pub use error::{FerruleError, Result, ALL_REPLICAS_STALE_MARKER};
pub use tls::{create_client_tls_config, TlsSettings};
