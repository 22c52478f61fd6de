//! Tidemail API - HTTP surface
//!
//! This crate provides the outbound-send and status endpoints, the setup
//! wizard, the restart trigger and the certificate challenge responder.

pub mod auth;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod server;
pub mod state;

pub use routes::{create_router, create_setup_router};
pub use server::HttpHandler;
pub use state::{AppState, LifecycleSignals, SetupState};
