//! Outbound send and status handlers

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Extension, Json,
};
use serde::Serialize;
use std::sync::Arc;
use tidemail_common::types::{MessageId, RequestContext};
use tidemail_common::Error;
use tidemail_core::SendRequest;
use tidemail_storage::MessageStatusRecord;
use tracing::{info, warn};

use crate::response::{ApiResponse, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub id: MessageId,
}

/// Queue a message for delivery
///
/// POST /api/email/send
///
/// Returns as soon as the message is stored; delivery and plugin hooks
/// continue in the background.
pub async fn send_email(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<SendResponse> {
    let Json(request) = body.map_err(|e| {
        warn!(log_id = %ctx.log_id, "Malformed send request: {}", e);
        Error::Params("params error".to_string())
    })?;

    info!(log_id = %ctx.log_id, user = %ctx.user_account, "Send request");
    let receipt = state.send.send(ctx, request).await?;

    // the background phase outlives the request
    drop(receipt.completion);
    Ok(ApiResponse::success(SendResponse {
        id: receipt.message_id,
    }))
}

/// Current delivery status of a message
///
/// GET /api/email/:id/status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<MessageId>,
) -> ApiResult<MessageStatusRecord> {
    let record = state
        .messages
        .status(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
    Ok(ApiResponse::success(record))
}
