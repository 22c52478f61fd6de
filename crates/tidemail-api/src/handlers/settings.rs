//! Runtime settings

use axum::{extract::State, Extension};
use std::sync::Arc;
use tidemail_common::types::RequestContext;
use tracing::info;

use crate::response::{ApiResponse, ApiResult};
use crate::state::AppState;

/// Restart every listener with a freshly loaded configuration
///
/// POST /api/settings/restart
pub async fn restart(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
) -> ApiResult<&'static str> {
    info!(log_id = %ctx.log_id, user = %ctx.user_account, "Restart requested");
    state.signals.restart.notify_one();
    Ok(ApiResponse::success("Succ"))
}
