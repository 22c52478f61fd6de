//! API routes

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tidemail_core::ChallengeStore;
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::handlers::{acme, email, settings, setup};
use crate::state::{AppState, SetupState};

fn challenge_routes(store: ChallengeStore) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", get(acme::challenge))
        .with_state(store)
}

/// Router of a running server generation
pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/email/send", post(email::send_email))
        .route("/email/:id/status", get(email::get_status))
        .route("/settings/restart", post(settings::restart))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state.clone());

    Router::new()
        .nest("/api", api)
        .merge(challenge_routes(state.challenges.clone()))
        .layer(TraceLayer::new_for_http())
}

/// Router served while the server waits for its first configuration
pub fn create_setup_router(state: Arc<SetupState>) -> Router {
    let challenges = state.challenges.clone();

    Router::new()
        .route("/api/setup", post(setup::setup))
        .with_state(state)
        .merge(challenge_routes(challenges))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LifecycleSignals;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tidemail_common::types::{Email, MessageStatus};
    use tidemail_common::{password, Config};
    use tidemail_core::{DeliveryReport, DeliveryTransport, HookRegistry, SendPipeline};
    use tidemail_storage::{DatabasePool, DbMessageRepository, DbUserRepository, UserRepository};
    use tower::ServiceExt;

    struct Accepting;

    #[async_trait]
    impl DeliveryTransport for Accepting {
        async fn deliver(&self, _email: &Email, _raw: &[u8]) -> DeliveryReport {
            DeliveryReport::default()
        }
    }

    async fn app_state() -> Arc<AppState> {
        let db = DatabasePool::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let messages = Arc::new(DbMessageRepository::new(db.clone()));
        let users = Arc::new(DbUserRepository::new(db));
        users
            .create("admin", "admin", &password::encode("pw"), true)
            .await
            .unwrap();

        let send = SendPipeline::new(
            messages.clone(),
            HookRegistry::empty(),
            Arc::new(Accepting),
            "example.com",
        );
        Arc::new(AppState {
            config: Arc::new(Config::default()),
            send,
            messages,
            users,
            challenges: ChallengeStore::new(),
            signals: LifecycleSignals::new(),
        })
    }

    fn authed(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Basic {}", BASE64.encode("admin:pw")))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn send_body() -> Value {
        json!({
            "from": {"name": "admin"},
            "to": [{"name": "Bob", "email": "bob@remote.test"}],
            "subject": "hello",
            "text": "hi"
        })
    }

    #[tokio::test]
    async fn test_send_requires_credentials() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/email/send")
            .header("content-type", "application/json")
            .body(Body::from(send_body().to_string()))
            .unwrap();
        let (status, body) = call(create_router(app_state().await), req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errorNo"], 403);
    }

    #[tokio::test]
    async fn test_send_returns_id_and_status() {
        let state = app_state().await;
        let router = create_router(state.clone());

        let (status, body) =
            call(router.clone(), authed("POST", "/api/email/send", send_body())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["errorNo"], 0);
        let id = body["data"]["id"].as_i64().unwrap();
        assert!(id > 0);

        let stored = state.messages.get(id).await.unwrap().unwrap();
        assert_eq!(stored.from.address, "admin@example.com");

        let uri = format!("/api/email/{}/status", id);
        let (status, body) = call(router, authed("GET", &uri, Value::Null)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["id"], id);
        let current = body["data"]["status"].as_str().unwrap().to_string();
        assert!(current == "queued" || current == "sent", "{}", current);
    }

    #[tokio::test]
    async fn test_send_validation_error() {
        let mut body = send_body();
        body["subject"] = json!("");
        let router = create_router(app_state().await);
        let (status, body) = call(router, authed("POST", "/api/email/send", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorNo"], 100);
        assert_eq!(body["errorMsg"], "subject is required");
    }

    #[tokio::test]
    async fn test_send_malformed_json() {
        let mut req = authed("POST", "/api/email/send", Value::Null);
        *req.body_mut() = Body::from("{not json");
        let (status, body) = call(create_router(app_state().await), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorNo"], 100);
    }

    #[tokio::test]
    async fn test_status_unknown_message() {
        let router = create_router(app_state().await);
        let (status, body) =
            call(router, authed("GET", "/api/email/999/status", Value::Null)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errorNo"], 404);
    }

    #[tokio::test]
    async fn test_restart_fires_signal() {
        let state = app_state().await;
        let router = create_router(state.clone());
        let (status, _) = call(router, authed("POST", "/api/settings/restart", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        let fired =
            tokio::time::timeout(Duration::from_secs(1), state.signals.restart.notified()).await;
        assert!(fired.is_ok());
    }

    #[tokio::test]
    async fn test_acme_challenge() {
        let state = app_state().await;
        state.challenges.insert("tok123", "tok123.thumb");
        let router = create_router(state);

        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = router
            .clone()
            .oneshot(get("/.well-known/acme-challenge/tok123"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"tok123.thumb");

        let resp = router.oneshot(get("/.well-known/acme-challenge/nope")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    fn setup_state(dir: &tempfile::TempDir) -> Arc<SetupState> {
        let mut config = Config::default();
        config.database.dsn = format!("sqlite://{}", dir.path().join("mail.db").display());
        Arc::new(SetupState::new(
            dir.path().join("config.toml"),
            config,
            ChallengeStore::new(),
            LifecycleSignals::new(),
        ))
    }

    fn setup_req(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/setup")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn step(step: &str, action: &str) -> Request<Body> {
        setup_req(json!({"step": step, "action": action}))
    }

    #[tokio::test]
    async fn test_setup_wizard_flow() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup_state(&dir);
        let router = create_setup_router(state.clone());

        let (status, body) = call(
            router.clone(),
            setup_req(json!({
                "step": "domain",
                "action": "set",
                "smtp_domain": "Example.COM",
                "web_domain": "mail.example.com"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], "Succ");

        let (_, body) = call(router.clone(), step("domain", "get")).await;
        assert_eq!(body["data"]["smtp_domain"], "example.com");

        let (_, body) = call(router.clone(), step("dns", "get")).await;
        assert_eq!(body["data"][0]["type"], "MX");
        assert_eq!(body["data"][0]["value"], "mail.example.com");

        let (_, body) = call(router.clone(), step("password", "get")).await;
        assert_eq!(body["data"], false);
        let (status, _) = call(
            router.clone(),
            setup_req(json!({
                "step": "password",
                "action": "set",
                "account": "admin",
                "password": "pw"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(router.clone(), step("password", "get")).await;
        assert_eq!(body["data"], true);

        let ssl = json!({"step": "ssl", "action": "set", "ssl_type": "1"});
        let (status, _) = call(router, setup_req(ssl)).await;
        assert_eq!(status, StatusCode::OK);
        let finished = tokio::time::timeout(
            Duration::from_secs(1),
            state.signals.setup_finished.notified(),
        )
        .await;
        assert!(finished.is_ok());

        let saved = Config::from_file(&dir.path().join("config.toml")).unwrap();
        assert!(saved.is_initialized());
        assert_eq!(saved.domains, vec!["example.com".to_string()]);
        assert_eq!(saved.tls.ssl_type, "1");
    }

    #[tokio::test]
    async fn test_setup_rejects_unknown_step() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_setup_router(setup_state(&dir));

        let (status, body) = call(router.clone(), step("bogus", "get")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorNo"], 100);

        let ssl = json!({"step": "ssl", "action": "set", "ssl_type": "9"});
        let (status, _) = call(router, setup_req(ssl)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!dir.path().join("config.toml").exists());
    }

    #[tokio::test]
    async fn test_setup_keeps_database_when_validation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let state = setup_state(&dir);
        let original_dsn = state.config.lock().await.database.dsn.clone();
        let router = create_setup_router(state);

        let (status, _) = call(
            router.clone(),
            setup_req(json!({
                "step": "database",
                "action": "set",
                "db_type": "postgres",
                "db_dsn": "postgres://nowhere/mail"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (_, body) = call(router.clone(), step("database", "get")).await;
        assert_eq!(body["data"]["db_type"], "sqlite");
        assert_eq!(body["data"]["db_dsn"], original_dsn.as_str());

        let domain = json!({"step": "domain", "action": "set", "smtp_domain": "example.com"});
        let (status, _) = call(router, setup_req(domain)).await;
        assert_eq!(status, StatusCode::OK);

        let saved = Config::from_file(&dir.path().join("config.toml")).unwrap();
        assert_eq!(saved.database.backend, "sqlite");
        assert_eq!(saved.database.dsn, original_dsn);
    }

    #[tokio::test]
    async fn test_sent_status_after_completion() {
        let state = app_state().await;
        let ctx = tidemail_common::types::RequestContext::new().with_user(1, "admin", "admin");
        let request: tidemail_core::SendRequest = serde_json::from_value(send_body()).unwrap();
        let receipt = state.send.send(ctx, request).await.unwrap();
        receipt.completion.await.unwrap();

        let (_, body) = call(
            create_router(state),
            authed("GET", &format!("/api/email/{}/status", receipt.message_id), Value::Null),
        )
        .await;
        assert_eq!(body["data"]["status"], json!(MessageStatus::Sent));
    }
}
