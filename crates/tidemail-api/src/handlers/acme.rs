//! HTTP-01 certificate challenge responder

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tidemail_core::ChallengeStore;
use tracing::{info, warn};

/// GET /.well-known/acme-challenge/:token
pub async fn challenge(State(store): State<ChallengeStore>, Path(token): Path<String>) -> Response {
    match store.get(&token) {
        Some(key_authorization) => {
            info!(token = %token, "Answering certificate challenge");
            key_authorization.into_response()
        }
        None => {
            warn!(token = %token, "Unknown certificate challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
