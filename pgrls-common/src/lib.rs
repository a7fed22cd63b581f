//! Common types and utilities shared by the pgrls crates
//!
//! - Error taxonomy (configuration, policy, compile errors)
//! - Configuration loaded from TOML
//! - Identifier validation and SQL quoting
//! - The `Session` seam every database call goes through
//! - An in-memory session for tests and dry runs

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod ident;
pub mod memory;
pub mod session;
pub mod types;

pub use config::RlsConfig;
pub use error::{CompileError, Error, PolicyError, Result};
pub use ident::{escape_like, format_literal, quote_ident, Ident};
pub use session::Session;
pub use types::{Row, SqlValue};
