//! Core type definitions for uniseq
//!
//! This crate holds the error taxonomy, lane identities, configuration and
//! the small enumerations shared by the runtime, communication and attention
//! crates. It is kept free of any threading or tensor logic so every other
//! crate can depend on it.

pub mod attention;
pub mod config;
pub mod errors;
pub mod parallel;

pub use attention::*;
pub use config::*;
pub use errors::*;
pub use parallel::*;

/// Result type used throughout uniseq
pub type Result<T> = std::result::Result<T, UniseqError>;
