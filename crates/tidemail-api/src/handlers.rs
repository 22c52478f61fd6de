//! API request handlers

pub mod acme;
pub mod email;
pub mod settings;
pub mod setup;
