//! Base types and error handling.
//!
//! Provides the crate-wide error taxonomy:
//! - [`FetchError`]: every failure a fetch can surface, with a stable
//!   string code per variant
//! - [`TransportCode`]: classified socket/DNS/TLS failure classes

pub mod error;

pub use error::{FetchError, TransportCode};
