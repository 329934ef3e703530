use crate::config::ScrapeConfig;
use crate::context::ObservabilityContext;
use crate::error::{BlackboxError, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// HTTP server exposing the current metrics registry for scrape-based
/// collectors, plus a liveness route
pub struct ScrapeServer {
    config: ScrapeConfig,
    context: Arc<ObservabilityContext>,
}

/// Shared state for the Axum server
#[derive(Clone)]
struct ServerState {
    context: Arc<ObservabilityContext>,
}

impl ScrapeServer {
    pub fn new(config: ScrapeConfig, context: Arc<ObservabilityContext>) -> Self {
        Self { config, context }
    }

    /// Bind and serve until the token is cancelled
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        let state = ServerState {
            context: Arc::clone(&self.context),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        let addr = format!("{}:{}", self.config.ip, self.config.port);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BlackboxError::Bind {
                address: addr.clone(),
                source: e,
            })?;

        info!("Metrics scrape endpoint listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
            .map_err(|e| BlackboxError::system(format!("scrape server error: {}", e)))?;

        info!("Metrics scrape endpoint stopped");
        Ok(())
    }
}

async fn metrics_handler(State(state): State<ServerState>) -> Response {
    let metrics = state.context.metrics();
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
