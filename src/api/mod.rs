//! HTTP API.
//!
//! `/postURL` looks up an image by URL; every other path treats the body as
//! an inline base64 request. All responses carry permissive CORS headers.

mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
};
use axum::http::HeaderValue;
use axum::routing::any;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::model::URL_ROUTE;
use crate::pipeline::SimilarityPipeline;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SimilarityPipeline>,
    /// Largest accepted `k`
    pub max_neighbors: usize,
}

impl AppState {
    pub fn new(pipeline: SimilarityPipeline, max_neighbors: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            max_neighbors,
        }
    }
}

/// Build the lookup router.
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    let wildcard = HeaderValue::from_static("*");

    Router::new()
        .route(URL_ROUTE, any(handlers::url_lookup))
        .fallback(handlers::inline_lookup)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_ORIGIN,
            wildcard.clone(),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_HEADERS,
            wildcard.clone(),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            ACCESS_CONTROL_ALLOW_METHODS,
            wildcard,
        ))
        .with_state(state)
}

/// HTTP server wrapping the lookup router.
pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn with_state(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.config.max_body_bytes)
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.config.listen_address)
            .await
            .map_err(|e| {
                Error::Api(format!(
                    "failed to bind {}: {}",
                    self.config.listen_address, e
                ))
            })?;
        info!("API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Api(format!("server error: {}", e)))
    }
}
