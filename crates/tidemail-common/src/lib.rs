//! Tidemail Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy and domain types
//! shared across all Tidemail components.

pub mod config;
pub mod error;
pub mod password;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
