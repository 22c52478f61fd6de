//! Repository layer for data access

pub mod messages;
pub mod users;

pub use messages::{DbMessageRepository, MessageRepository};
pub use users::{DbUserRepository, UserRepository};
