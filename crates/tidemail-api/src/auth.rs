//! Authentication middleware

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::sync::Arc;
use tidemail_common::password;
use tidemail_common::types::{local_part, RequestContext};
use tidemail_common::Error;
use tracing::{debug, error, warn};

use crate::response::ApiError;
use crate::state::AppState;

/// Extract `account:secret` from an `Authorization: Basic` header
pub fn extract_credentials(req: &Request) -> Option<(String, String)> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (account, secret) = decoded.split_once(':')?;
    Some((local_part(account).to_string(), secret.to_string()))
}

/// Resolve the caller's account and attach a [`RequestContext`] to the request
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut ctx = RequestContext::new();

    let Some((account, secret)) = extract_credentials(&request) else {
        warn!(log_id = %ctx.log_id, path = %request.uri().path(), "Missing credentials");
        return ApiError(Error::Auth("missing credentials".to_string())).into_response();
    };

    match state
        .users
        .find_by_credentials(&account, &password::encode(&secret))
        .await
    {
        Ok(Some(user)) => {
            debug!(log_id = %ctx.log_id, account = %user.account, "Request authenticated");
            ctx = ctx.with_user(user.id, user.name, user.account);
        }
        Ok(None) => {
            warn!(log_id = %ctx.log_id, account = %account, "Credentials rejected");
            return ApiError(Error::Auth("invalid credentials".to_string())).into_response();
        }
        Err(e) => {
            error!(log_id = %ctx.log_id, "Account lookup failed: {}", e);
            return ApiError(e).into_response();
        }
    }

    request.extensions_mut().insert(ctx);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: &str) -> Request {
        Request::builder()
            .uri("/")
            .header("authorization", header)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_extract_credentials() {
        let req = request_with(&format!("Basic {}", BASE64.encode("admin@example.com:s3:cret")));
        assert_eq!(
            extract_credentials(&req),
            Some(("admin".to_string(), "s3:cret".to_string()))
        );
    }

    #[test]
    fn test_extract_credentials_rejects_other_schemes() {
        assert_eq!(extract_credentials(&request_with("Bearer abc")), None);
        assert_eq!(extract_credentials(&request_with("Basic !!!")), None);
    }
}
