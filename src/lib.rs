//! Hospital management API: accounts, TOTP based MFA and refresh token
//! sessions behind a permission gate.

#![forbid(unsafe_code)]

mod audit;
mod auth;
mod crypto;
mod database;
mod limits;
mod mfa;
mod middleware;
mod password;
mod permission;
mod router;
mod session;
mod store;
mod token;
mod totp;

pub mod config;
pub mod error;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};

use audit::AuditSink;
use auth::Authenticator;
use config::Configuration;
use crypto::PasswordManager;
use limits::RateLimiter;
use permission::PermissionGate;
use session::SessionService;
use store::Stores;
use token::TokenManager;

const CONFIG_PATH: &str = "CONFIG_PATH";
const JWT_SECRET: &str = "JWT_SECRET";
const BODY_LIMIT: usize = 64 * 1024; // 64 KiB.

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    token: Option<&str>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Configuration>,
    pub stores: Stores,
    pub auth: Authenticator,
    pub gate: PermissionGate,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire every service on top of `stores`.
    pub fn new(
        config: Arc<Configuration>,
        stores: Stores,
        tokens: TokenManager,
        passwords: Arc<PasswordManager>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let sessions = SessionService::new(tokens, stores.clone());
        let auth = Authenticator::new(stores.clone(), sessions, passwords, audit, &config);

        Self {
            gate: PermissionGate::new(stores.clone()),
            limiter: Arc::new(RateLimiter::from_config(&config.rate_limit)),
            config,
            stores,
            auth,
            metrics: None,
        }
    }

    /// Expose recorded metrics on `/metrics`.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Give every request an `x-request-id` and send it back.
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        // Remove senstive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Security headers on every response, errors included.
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        // Reject oversized bodies. Must wrap the timeout, whose body has to
        // be `Default`.
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers(Any),
        );

    let api = Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to the Prometheus exposition.
        .route("/metrics", get(telemetry::render_metrics))
        .nest("/auth", router::auth::router(state.clone()))
        .nest("/mfa", router::mfa::router(state.clone()))
        .nest("/users", router::users::router(state.clone()))
        .nest("/logs", router::logs::router(state.clone()));

    Router::new()
        .nest("/api/v1", api)
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>> {
    // read configuration file. let it in memory.
    let path = std::env::var(CONFIG_PATH).map(PathBuf::from).unwrap_or_default();
    let config = Configuration::default().path(path).read();

    let db = match config.postgres {
        Some(ref postgres) => {
            database::Database::new(
                &postgres.address,
                postgres
                    .username
                    .as_deref()
                    .unwrap_or(database::DEFAULT_CREDENTIALS),
                postgres
                    .password
                    .as_deref()
                    .unwrap_or(database::DEFAULT_CREDENTIALS),
                postgres
                    .database
                    .as_deref()
                    .unwrap_or(database::DEFAULT_DATABASE_NAME),
                postgres.pool_size.unwrap_or(database::DEFAULT_POOL_SIZE),
            )
            .await?
        },
        None => {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            return Err("missing `postgres` configuration".into());
        },
    };

    // execute migrations scripts on start.
    sqlx::migrate!().run(&db.postgres).await?;

    let secret = std::env::var(JWT_SECRET)
        .map_err(|_| "missing `JWT_SECRET` environment variable")?;
    let tokens = TokenManager::new(secret.as_bytes(), &config.token)?;
    let passwords = Arc::new(PasswordManager::new(config.argon2.clone())?);
    let audit: Arc<dyn AuditSink> = match config.audit {
        crate::config::Audit::Postgres => Arc::new(database::PgAudit::new(&db)),
        crate::config::Audit::Tracing => Arc::new(audit::TracingAudit),
    };
    let stores = db.stores(config.store_timeout());

    Ok(AppState::new(config, stores, tokens, passwords, audit))
}
