//! HTTP boundary: REST routes plus the streaming WebSocket endpoint.

mod routes;
mod ws;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::llm::LLMClient;
use crate::rubric::Dataset;
use crate::session::SessionDeps;
use crate::transcript::{Transcriber, TranscriptStore};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub client: Arc<dyn LLMClient>,
    pub store: Arc<TranscriptStore>,
    /// None when no `yt-dlp` binary was found at startup.
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub dataset: Arc<RwLock<Option<Arc<Dataset>>>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        client: Arc<dyn LLMClient>,
        transcriber: Option<Arc<dyn Transcriber>>,
    ) -> Self {
        Self {
            config,
            client,
            store: Arc::new(TranscriptStore::new()),
            transcriber,
            dataset: Arc::new(RwLock::new(None)),
        }
    }

    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/transcribe", post(routes::transcribe))
        .route("/ask", post(routes::ask))
        .route("/load-dataset", post(routes::load_dataset))
        .route("/dataset-info", get(routes::dataset_info))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
