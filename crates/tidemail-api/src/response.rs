//! JSON response envelope shared by every endpoint

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tidemail_common::Error;
use tracing::error;

/// `{errorNo, errorMsg, data}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    #[serde(rename = "errorNo")]
    pub error_no: i32,
    #[serde(rename = "errorMsg", skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            error_no: 0,
            error_msg: String::new(),
            data,
        })
    }
}

/// Handler error, rendered through the error taxonomy
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if !self.0.is_client_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ApiResponse {
            error_no: self.0.error_no(),
            error_msg: self.0.public_message(),
            data: "",
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;
