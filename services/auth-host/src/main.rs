//! oauth-gate
//!
//! Single-binary host that:
//! 1. Signs browser users in against the identity provider (PKCE code flow)
//! 2. Keeps their tokens in an encrypted cookie, refreshing on demand
//! 3. Guards pages by session and API routes by bearer JWT
//! 4. Calls the provider's userinfo endpoint on the user's behalf
//! 5. Serves /health and /metrics

mod config;
mod metrics;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_client::{
    AuthorizationFlow, ClientState, CookieProtector, HttpIdentityProvider, OutboundClient,
    RefreshCoordinator, client_guard,
};
use resource_guard::{
    AuthContext, JwtValidator, PermissionAuditor, ResourceGuard, StaticPolicy, require_bearer,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_sessions::{MemoryStore, Session, SessionManagerLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Time allowed for in-flight requests after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    client: ClientState,
    outbound: Arc<OutboundClient>,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

/// Wire the auth components from configuration and build the router.
///
/// Layers, outermost first: request metrics, concurrency limit, sessions.
fn build_app(config: &Config, prometheus: PrometheusHandle) -> Result<Router> {
    let resource = &config.resource;
    let public_key = std::fs::read(&resource.public_key_path).with_context(|| {
        format!(
            "failed to read public key {}",
            resource.public_key_path.display()
        )
    })?;
    let validator = JwtValidator::from_pem(
        &public_key,
        resource.algorithm,
        resource.valid_issuers.clone(),
        resource.valid_audiences.clone(),
    )
    .context("invalid resource public key")?
    .with_leeway(resource.leeway_secs);

    let auditor: Arc<dyn PermissionAuditor> = Arc::new(StaticPolicy::new(config.policy.clone())?);
    let guard = Arc::new(
        ResourceGuard::new(validator, Arc::clone(&auditor))
            .with_missing_token(resource.missing_token)
            .with_claims_validator(|claims| {
                claims
                    .sub
                    .as_deref()
                    .is_none_or(str::is_empty)
                    .then(|| "token has no subject".to_string())
            }),
    );

    let options = Arc::new(config.oauth.clone());
    let provider = Arc::new(HttpIdentityProvider::new(Arc::clone(&options))?);
    let protector = CookieProtector::new(&config.hash_key, &config.block_key)?;
    let outbound = Arc::new(OutboundClient::new(Arc::clone(&provider)));
    let client = ClientState::new(
        Arc::new(AuthorizationFlow::new(options, provider.clone())),
        Arc::new(RefreshCoordinator::new(provider)),
        Arc::new(protector),
        auditor,
    )
    .with_secure_cookies(config.server.secure_cookies);

    let state = AppState {
        client: client.clone(),
        outbound,
        started_at: Instant::now(),
        prometheus,
    };

    let sessions =
        SessionManagerLayer::new(MemoryStore::default()).with_secure(config.server.secure_cookies);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/",
            get(home_handler).route_layer(axum::middleware::from_fn_with_state(
                client.protect("home")?,
                client_guard,
            )),
        )
        .route(
            "/account",
            get(account_handler).route_layer(axum::middleware::from_fn_with_state(
                client.protect("account")?,
                client_guard,
            )),
        )
        .route(
            "/account/userinfo",
            get(userinfo_handler).route_layer(axum::middleware::from_fn_with_state(
                client.protect("account")?,
                client_guard,
            )),
        )
        .route(
            "/api/me",
            get(api_me_handler).route_layer(axum::middleware::from_fn_with_state(
                guard.protect("api_me")?,
                require_bearer,
            )),
        )
        .with_state(state)
        .merge(oauth_client::router(client))
        .layer(sessions)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_connections,
        ))
        .layer(axum::middleware::from_fn(metrics::track_requests));

    Ok(app)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oauth-gate");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        client_id = %config.oauth.client_id,
        issuers = config.resource.valid_issuers.len(),
        policies = config.policy.len(),
        "configuration loaded"
    );

    let listen_addr = config.server.listen_addr;
    let app = build_app(&config, prometheus_handle)?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn home_handler(State(state): State<AppState>, session: Session) -> Response {
    match state.client.flow().current_user(&session).await {
        Ok(Some(claims)) => {
            let name = claims
                .extra_str("name")
                .or(claims.sub.as_deref())
                .unwrap_or("user");
            format!("hello, {name}").into_response()
        }
        Ok(None) => "hello, anonymous".into_response(),
        Err(err) => err.into_response(),
    }
}

/// Token details of the signed-in user. Refreshes the access token when it
/// has expired, so the response may carry a new token cookie.
async fn account_handler(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Response {
    let tokens = state.client.token_store(&headers);
    let mut response = match state.client.access_token(&session, &tokens).await {
        Ok(Some(token)) => Json(json!({
            "expires_at": token.expires_at,
            "refreshable": token.refresh_token.is_some(),
        }))
        .into_response(),
        Ok(None) => sign_in_redirect(&state, "/account"),
        Err(err) => err.into_response(),
    };
    tokens.write_to(response.headers_mut());
    response
}

/// The provider's userinfo for the signed-in user, fetched with their token.
async fn userinfo_handler(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
) -> Response {
    let Some(endpoint) = state.client.flow().options().userinfo_endpoint.clone() else {
        return (StatusCode::NOT_FOUND, "userinfo endpoint not configured").into_response();
    };
    let tokens = state.client.token_store(&headers);
    let request = state
        .client
        .user_request(&state.outbound, &session, &tokens, Method::GET, &endpoint)
        .await;
    let mut response = match request {
        Ok(Some(request)) => forward(request).await,
        Ok(None) => sign_in_redirect(&state, "/account/userinfo"),
        Err(err) => err.into_response(),
    };
    tokens.write_to(response.headers_mut());
    response
}

async fn forward(request: reqwest::RequestBuilder) -> Response {
    let upstream = match request.send().await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(error = %err, "upstream request failed");
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };
    let status = upstream.status();
    match upstream.text().await {
        Ok(body) => (status, [(CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => {
            warn!(error = %err, "upstream response unreadable");
            (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
        }
    }
}

fn sign_in_redirect(state: &AppState, return_url: &str) -> Response {
    (
        StatusCode::FOUND,
        [(LOCATION, state.client.sign_in_location(return_url))],
    )
        .into_response()
}

async fn api_me_handler(context: Option<AuthContext>) -> impl IntoResponse {
    match context {
        Some(context) => Json(json!({
            "subject": context.subject,
            "role": context.claims.role,
            "level": context.claims.level.unwrap_or(0),
            "scope": context.claims.scope,
        })),
        None => Json(json!({ "subject": null })),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::http::header::AUTHORIZATION;
    use common::Secret;
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use tower::ServiceExt;

    const SIGNING_KEY: &[u8] =
        include_bytes!("../../../crates/resource-guard/tests/fixtures/signing_key.pem");
    const PUBLIC_KEY_PATH: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../crates/resource-guard/tests/fixtures/signing_key.pub.pem"
    );

    /// Create a PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle()
    }

    fn test_config() -> Config {
        test_config_for("https://id.example.com")
    }

    fn test_config_for(provider: &str) -> Config {
        let toml = format!(
            r#"
[server]
listen_addr = "127.0.0.1:0"
secure_cookies = false

[oauth]
client_id = "web-portal"
authorize_endpoint = "{provider}/connect/authorize"
token_endpoint = "{provider}/connect/token"
end_session_endpoint = "{provider}/connect/endsession"
userinfo_endpoint = "{provider}/connect/userinfo"
redirect_url = "https://app.example.com/signin-oauth"
sign_out_redirect_url = "https://app.example.com/signout-oauth"

[resource]
public_key_path = "{PUBLIC_KEY_PATH}"
valid_issuers = ["https://id.example.com"]
valid_audiences = ["orders-api"]

[[policy]]
route = "home"

[[policy]]
route = "account"
roles = 2

[[policy]]
route = "api"
roles = 2
min_level = 1
"#
        );
        let mut config: Config = toml::from_str(&toml).unwrap();
        config.hash_key = Secret::new("test-hash-key".to_string());
        config.block_key = Secret::new("test-block-key".to_string());
        config
    }

    fn app() -> Router {
        build_app(&test_config(), test_prometheus_handle()).unwrap()
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn bearer(claims: serde_json::Value) -> String {
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::PS256),
            &claims,
            &EncodingKey::from_rsa_pem(SIGNING_KEY).unwrap(),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    fn claims(exp: i64) -> serde_json::Value {
        json!({
            "sub": "svc-reports",
            "iss": "https://id.example.com",
            "aud": "orders-api",
            "exp": exp,
            "role": 2,
            "level": "1",
            "scope": "orders.read orders.write",
        })
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let (status, body) = send(app(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let response = app().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[axum::http::header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn api_without_token_is_unauthorized() {
        let (status, body) = send(app(), get("/api/me")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "missing authorization header");
    }

    #[tokio::test]
    async fn api_with_valid_token_returns_caller() {
        let request = Request::builder()
            .uri("/api/me")
            .header(AUTHORIZATION, bearer(claims(now() + 600)))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["subject"], "svc-reports");
        assert_eq!(json["role"], 2);
        assert_eq!(json["level"], 1);
        assert_eq!(json["scope"], json!(["orders.read", "orders.write"]));
    }

    #[tokio::test]
    async fn api_with_expired_token_is_unauthorized() {
        let request = Request::builder()
            .uri("/api/me")
            .header(AUTHORIZATION, bearer(claims(now() - 600)))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "current time not in token's valid period");
    }

    #[tokio::test]
    async fn api_token_without_subject_is_rejected_by_claims_hook() {
        let mut claims = claims(now() + 600);
        claims.as_object_mut().unwrap().remove("sub");
        let request = Request::builder()
            .uri("/api/me")
            .header(AUTHORIZATION, bearer(claims))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "token has no subject");
    }

    #[tokio::test]
    async fn api_token_below_min_level_is_denied() {
        let mut claims = claims(now() + 600);
        claims["level"] = json!(0);
        let request = Request::builder()
            .uri("/api/me")
            .header(AUTHORIZATION, bearer(claims))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "permission denied");
    }

    #[tokio::test]
    async fn anonymous_home_page_is_open() {
        let (status, body) = send(app(), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello, anonymous");
    }

    #[tokio::test]
    async fn anonymous_account_page_redirects_to_provider() {
        let response = app().oneshot(get("/account")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[LOCATION].to_str().unwrap();
        assert!(location.starts_with("https://id.example.com/connect/authorize?"));
        assert!(location.contains("client_id=web-portal"));
    }

    #[tokio::test]
    async fn sign_in_route_is_mounted() {
        let response = app().oneshot(get("/signin?ReturnUrl=/account")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    /// Unsigned JWT, as the client only decodes its own access token.
    fn unsigned_jwt(payload: &serde_json::Value) -> String {
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    fn with_cookies(uri: &str, cookies: &[&str]) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(axum::http::header::COOKIE, cookies.join("; "))
            .body(Body::empty())
            .unwrap()
    }

    /// Full `Set-Cookie` header for `name`.
    fn set_cookie(response: &Response, name: &str) -> String {
        response
            .headers()
            .get_all(axum::http::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with(&format!("{name}=")))
            .unwrap()
            .to_string()
    }

    fn pair(set_cookie: &str) -> &str {
        set_cookie.split(';').next().unwrap()
    }

    #[tokio::test]
    async fn signed_in_user_reaches_userinfo_with_bearer() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let provider = MockServer::start().await;
        let access_token = unsigned_jwt(&json!({ "sub": "alice", "role": "2" }));
        Mock::given(method("POST"))
            .and(path("/connect/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": access_token,
                "refresh_token": "rt-alice",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&provider)
            .await;
        Mock::given(method("GET"))
            .and(path("/connect/userinfo"))
            .and(header("authorization", format!("Bearer {access_token}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": "alice",
                "email": "alice@example.com"
            })))
            .expect(1)
            .mount(&provider)
            .await;

        let mut config = test_config_for(&provider.uri());
        config.server.secure_cookies = true;
        let app = build_app(&config, test_prometheus_handle()).unwrap();

        let response = app
            .clone()
            .oneshot(get("/signin?ReturnUrl=/account/userinfo"))
            .await
            .unwrap();
        let session = set_cookie(&response, "id");
        let authorize: std::collections::HashMap<String, String> =
            url::Url::parse(response.headers()[LOCATION].to_str().unwrap())
                .unwrap()
                .query_pairs()
                .into_owned()
                .collect();

        let callback = format!(
            "/signin-oauth?state={}&code=auth-code&code_challenge={}&code_challenge_method=S256",
            authorize["state"], authorize["code_challenge"]
        );
        let response = app
            .clone()
            .oneshot(with_cookies(&callback, &[pair(&session)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/account/userinfo");
        let token = set_cookie(&response, "go.cookie2");
        assert!(token.contains("; Secure"), "token cookie: {token}");

        let (status, body) = send(
            app.clone(),
            with_cookies("/account/userinfo", &[pair(&session), pair(&token)]),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "body: {body}");
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["email"], "alice@example.com");

        // Signed in but without the token cookie: back to sign-in
        let response = app
            .oneshot(with_cookies("/account", &[pair(&session)]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/signin?ReturnUrl=%2Faccount");
    }

    #[test]
    fn missing_public_key_fails_startup() {
        let mut config = test_config();
        config.resource.public_key_path = "/nonexistent/key.pem".into();
        let err = build_app(&config, test_prometheus_handle()).unwrap_err();
        assert!(err.to_string().contains("failed to read public key"));
    }
}
