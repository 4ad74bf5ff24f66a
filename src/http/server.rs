//! HTTP API server
//!
//! Three JSON endpoints plus JWKS and health. CORS follows an exact-match
//! origin list, echoing the caller's origin rather than `*` so credentials
//! keep working behind the configured allow list.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::Service;
use crate::config::Settings;
use crate::error::{MapaeError, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared application state
pub struct AppState {
    pub service: Arc<Service>,
    pub settings: Arc<Settings>,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub detail: String,
}

impl ApiError {
    pub fn new(msg: &str) -> Self {
        Self {
            detail: msg.to_string(),
        }
    }
}

/// Builds the full router. Split out from `run` so tests can drive it
/// in-process.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/init", post(auth_init))
        .route("/auth/check/:auth_id", get(auth_check))
        .route("/auth/check-signed/:auth_id", get(auth_check_signed))
        .route("/.well-known/jwks.json", get(jwks))
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn_with_state(state.clone(), apply_cors))
        .with_state(state)
}

pub async fn run(
    settings: Arc<Settings>,
    service: Arc<Service>,
    shutdown: CancellationToken,
) -> Result<()> {
    let state = Arc::new(AppState {
        service,
        settings: settings.clone(),
    });
    let app = router(state);

    let addr = format!("{}:{}", settings.http_host, settings.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;

    Ok(())
}

/// GET /health - storage-backed liveness
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match timeout(HEALTH_TIMEOUT, state.service.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, Json(json!({"status": "ok", "storage": "up"}))),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "unhealthy", "storage": "down"})),
        ),
    }
}

/// POST /auth/init - allocate a verification challenge
async fn auth_init(State(state): State<Arc<AppState>>) -> Response {
    match state.service.init_auth().await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err, "auth init"),
    }
}

/// GET /auth/check/:auth_id - poll verification status
async fn auth_check(
    State(state): State<Arc<AppState>>,
    Path(auth_id): Path<String>,
) -> Response {
    match state.service.check_auth(auth_id.trim()).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err, "auth check"),
    }
}

/// GET /auth/check-signed/:auth_id - poll and mint a signed token
async fn auth_check_signed(
    State(state): State<Arc<AppState>>,
    Path(auth_id): Path<String>,
) -> Response {
    match state.service.check_signed(auth_id.trim()).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(err) => error_response(err, "auth check-signed"),
    }
}

/// GET /.well-known/jwks.json - token verification keys
async fn jwks(State(state): State<Arc<AppState>>) -> Response {
    match state.service.jwks() {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(err, "jwks"),
    }
}

fn error_response(err: MapaeError, context: &str) -> Response {
    match err {
        MapaeError::InvalidAuthId => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("invalid auth_id")),
        )
            .into_response(),
        MapaeError::JwksUnavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new("signing key not configured")),
        )
            .into_response(),
        err => {
            error!("{} error: {}", context, err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new("internal server error")),
            )
                .into_response()
        }
    }
}

/// Echoes an allowed Origin back with the CORS response headers and
/// short-circuits preflight requests with 204.
async fn apply_cors(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let preflight = req.method() == Method::OPTIONS;

    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    if let Some(origin) = origin {
        if is_allowed_origin(&state.settings, &origin) {
            if let Ok(value) = HeaderValue::from_str(&origin) {
                let headers = response.headers_mut();
                headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
                headers.insert(header::VARY, HeaderValue::from_static("Origin"));
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static("GET,POST,OPTIONS"),
                );
                headers.insert(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static("*"),
                );
            }
        }
    }

    response
}

fn is_allowed_origin(settings: &Settings, origin: &str) -> bool {
    settings
        .cors_allow_origins
        .iter()
        .any(|allowed| allowed == "*" || allowed == origin)
}

async fn log_requests(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let started = Instant::now();

    let response = next.run(req).await;

    let remote = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());
    info!(
        remote = %remote,
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "http request"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use pkcs8::LineEnding;
    use ed25519_dalek::SigningKey;
    use http_body_util::BodyExt;
    use rand::rngs::OsRng;
    use tower::ServiceExt;

    fn make_router(settings: Settings) -> (Router, Arc<Service>) {
        let settings = Arc::new(settings);
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(Service::new(store, settings.clone()).unwrap());
        let state = Arc::new(AppState {
            service: service.clone(),
            settings,
        });
        (router(state), service)
    }

    fn settings_with_signer() -> Settings {
        let key = SigningKey::generate(&mut OsRng);
        Settings {
            jwt_private_key_pem: key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            ..Settings::default()
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_storage_up() {
        let (app, _) = make_router(Settings::default());
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], "up");
    }

    #[tokio::test]
    async fn test_auth_init_issues_challenge() {
        let (app, _) = make_router(Settings::default());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/auth/init")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let auth_id = body["auth_id"].as_str().unwrap();
        assert_eq!(auth_id.len(), 32);
        let sms_body = body["sms_body"].as_str().unwrap();
        assert!(sms_body.starts_with("[MAPAE:") && sms_body.ends_with(']'));
        assert_eq!(
            body["link"],
            format!("sms:verify@example.com?body={sms_body}")
        );
        assert_eq!(body["ttl_seconds"], 600);
    }

    #[tokio::test]
    async fn test_auth_check_rejects_malformed_id() {
        let (app, _) = make_router(Settings::default());
        let response = app.oneshot(get("/auth/check/not-hex")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_auth_check_unknown_id_is_expired() {
        let (app, _) = make_router(Settings::default());
        let path = format!("/auth/check/{}", "a".repeat(32));
        let response = app.oneshot(get(&path)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "expired");
    }

    #[tokio::test]
    async fn test_auth_check_verified_record() {
        let (app, service) = make_router(Settings::default());
        let auth_id = "b".repeat(32);
        service
            .store_verified(&auth_id, Some("01012345678"), Some("KT"))
            .await
            .unwrap();

        let response = app
            .oneshot(get(&format!("/auth/check/{auth_id}")))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "verified");
        assert_eq!(body["phone"], "01012345678");
        assert_eq!(body["carrier"], "KT");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_check_signed_and_jwks_without_signer_are_503() {
        let (app, service) = make_router(Settings::default());
        let auth_id = "c".repeat(32);
        service
            .store_verified(&auth_id, Some("01011112222"), Some("SKT"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/auth/check-signed/{auth_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.oneshot(get("/.well-known/jwks.json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_check_signed_with_signer_returns_token() {
        let (app, service) = make_router(settings_with_signer());
        let auth_id = "d".repeat(32);
        service
            .store_verified(&auth_id, Some("01099998888"), Some("LGU+"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/auth/check-signed/{auth_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "verified");
        assert!(body["token"].as_str().unwrap().split('.').count() == 3);

        let response = app.oneshot(get("/.well-known/jwks.json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jwks = body_json(response).await;
        assert_eq!(jwks["keys"][0]["kty"], "OKP");
        assert_eq!(jwks["keys"][0]["crv"], "Ed25519");
        assert_eq!(jwks["keys"][0]["alg"], "EdDSA");
    }

    #[tokio::test]
    async fn test_cors_echoes_allowed_origin() {
        let (app, _) = make_router(Settings::default());
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://client.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "https://client.example"
        );
        assert_eq!(response.headers().get(header::VARY).unwrap(), "Origin");
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_METHODS)
                .unwrap(),
            "GET,POST,OPTIONS"
        );
    }

    #[tokio::test]
    async fn test_cors_ignores_disallowed_origin() {
        let settings = Settings {
            cors_allow_origins: vec!["https://allowed.example".to_string()],
            ..Settings::default()
        };
        let (app, _) = make_router(settings);
        let request = Request::builder()
            .uri("/health")
            .header(header::ORIGIN, "https://other.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn test_preflight_returns_no_content() {
        let (app, _) = make_router(Settings::default());
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/auth/init")
            .header(header::ORIGIN, "https://client.example")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
