//! Tidemail Storage - Database access
//!
//! This crate provides the SQLite connection pool, embedded migrations and the
//! message and account repositories.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
