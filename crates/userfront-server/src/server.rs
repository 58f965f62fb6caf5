use std::net::SocketAddr;
use std::time::Duration;

use axum::{Router, extract::DefaultBodyLimit, middleware, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::AppConfig,
    create_user_cache, create_user_storage,
    handlers::{self, AppState},
    middleware as app_middleware,
    middleware::RequestId,
    service::UserService,
};

const READINESS_TIMEOUT: Duration = Duration::from_secs(1);

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    Router::new()
        .route(
            "/user",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route("/user/search", get(handlers::search_user))
        .route("/user/search/", get(handlers::search_user))
        .route(
            "/user/{id}",
            get(handlers::get_user)
                .put(handlers::update_user)
                .delete(handlers::delete_user),
        )
        // Runs after routing so the matched route template is known
        .route_layer(middleware::from_fn(app_middleware::track_metrics))
        // Middleware stack (outermost last: request id -> cors -> trace -> body limit)
        .layer(DefaultBodyLimit::max(cfg.server.body_limit_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let request_id = req
                        .extensions()
                        .get::<RequestId>()
                        .map(|id| id.0.to_string())
                        .unwrap_or_default();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %request_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record("http.status_code", res.status().as_u16());
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

/// Liveness, readiness and metrics, served on their own port.
///
/// `/live` and `/ready` answer the same as `/healthz` and `/readyz` for
/// health check configurations written against the older paths.
pub fn build_monitoring_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/live", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/ready", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}

pub fn app_state(service: UserService, cfg: &AppConfig) -> AppState {
    AppState {
        service,
        request_timeout: cfg.request_timeout(),
        readiness_timeout: READINESS_TIMEOUT,
        pagination: cfg.pagination.clone(),
    }
}

pub struct UserfrontServer {
    addr: SocketAddr,
    monitoring_addr: SocketAddr,
    app: Router,
    monitoring: Router,
    service: UserService,
    shutdown: CancellationToken,
}

pub struct ServerBuilder {
    config: AppConfig,
    shutdown: CancellationToken,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    /// Token that stops the listeners and the keep-alive tasks when cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Connects both Ports and assembles the routers.
    ///
    /// Unreachable backends do not fail the build; the keep-alive tasks
    /// retry and `/readyz` reports them until they recover.
    pub async fn build(self) -> anyhow::Result<UserfrontServer> {
        let cfg = self.config;
        let storage = create_user_storage(&cfg, self.shutdown.clone()).await;
        let cache = create_user_cache(&cfg, self.shutdown.clone()).await?;
        let service = UserService::new(storage, cache, cfg.service_settings());

        let state = app_state(service.clone(), &cfg);
        Ok(UserfrontServer {
            addr: cfg.addr(),
            monitoring_addr: cfg.monitoring_addr(),
            app: build_app(state.clone(), &cfg),
            monitoring: build_monitoring_app(state),
            service,
            shutdown: self.shutdown,
        })
    }
}

impl UserfrontServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let monitoring_listener = tokio::net::TcpListener::bind(self.monitoring_addr).await?;
        tracing::info!(addr = %self.addr, monitoring_addr = %self.monitoring_addr, "listening");

        let signal_token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => signal_token.cancel(),
                _ = signal_token.cancelled() => {}
            }
        });

        let app = axum::serve(listener, self.app)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned());
        let monitoring = axum::serve(monitoring_listener, self.monitoring)
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned());

        // Either listener failing takes the other one down with it.
        let token = self.shutdown.clone();
        let (app_result, monitoring_result) = tokio::join!(
            async {
                let result = app.await;
                token.cancel();
                result
            },
            async {
                let result = monitoring.await;
                token.cancel();
                result
            },
        );

        shutdown_components(&self.service).await;
        app_result?;
        monitoring_result?;
        Ok(())
    }
}

/// Waits for pending cache writes, then closes both Ports.
pub async fn shutdown_components(service: &UserService) {
    tracing::info!("draining background cache work");
    service.drain().await;
    service.cache().close().await;
    service.storage().close().await;
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
