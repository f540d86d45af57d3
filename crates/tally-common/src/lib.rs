//! Tally Common - Shared types and utilities
//!
//! This crate provides the counter identifiers, the error taxonomy and the
//! configuration structures used across all Tally components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
