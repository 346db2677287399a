//! REST handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::AppState;
use crate::error::Error;
use crate::rubric::Dataset;
use crate::text::round_to;
use crate::transcript::{full_text, VideoRecord};
use crate::tree::TreeSnapshot;

#[derive(Debug, Deserialize)]
pub struct TranscribeRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TranscribeResult {
    Ok(crate::transcript::VideoSummary),
    Err {
        video_id: String,
        title: String,
        error: String,
    },
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub videos: Vec<TranscribeResult>,
}

/// `POST /transcribe`: ingest one or more videos into the store.
pub async fn transcribe(
    State(state): State<AppState>,
    Json(request): Json<TranscribeRequest>,
) -> impl IntoResponse {
    let mut videos = Vec::new();

    for url in request.urls {
        let url = url.trim().to_string();
        if url.is_empty() {
            continue;
        }

        let Some(transcriber) = &state.transcriber else {
            videos.push(TranscribeResult::Err {
                video_id: String::new(),
                title: url,
                error: "transcriber unavailable: yt-dlp not found".to_string(),
            });
            continue;
        };

        match ingest(transcriber.as_ref(), &url).await {
            Ok(record) => videos.push(TranscribeResult::Ok(state.store.insert(record))),
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "transcription failed");
                videos.push(TranscribeResult::Err {
                    video_id: String::new(),
                    title: url,
                    error: err.to_string(),
                });
            }
        }
    }

    Json(TranscribeResponse { videos })
}

async fn ingest(
    transcriber: &dyn crate::transcript::Transcriber,
    url: &str,
) -> crate::error::Result<VideoRecord> {
    let mut info = transcriber.video_info(url).await?;
    if info.id.is_empty() {
        info.id = crate::tree::make_id();
    }
    let segments = transcriber.transcribe(url).await?;
    let text = full_text(&segments);
    Ok(VideoRecord {
        info,
        segments,
        full_text: text,
    })
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub video_ids: Vec<String>,
    #[serde(default = "default_iterations")]
    pub max_iterations: u32,
}

fn default_iterations() -> u32 {
    12
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub answer: String,
    pub confidence: f64,
    pub tree: TreeSnapshot,
}

/// `POST /ask`: non-streaming search over stored transcripts.
pub async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> impl IntoResponse {
    let context = state.store.build_context(&request.video_ids);
    if context.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "No transcripts found."})),
        )
            .into_response();
    }

    let deps = state.session_deps();
    let mut engine = match deps.engine(&context, request.max_iterations) {
        Ok(engine) => engine,
        Err(err) => return engine_failure(err),
    };

    match engine.search(&request.question).await {
        Ok((answer, confidence)) => Json(AskResponse {
            answer,
            confidence: round_to(confidence, 4),
            tree: engine.tree_snapshot(),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "search failed");
            engine_failure(err)
        }
    }
}

fn engine_failure(err: Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": err.to_string()})),
    )
        .into_response()
}

/// `POST /load-dataset`: load the rubric dataset from configured paths.
pub async fn load_dataset(State(state): State<AppState>) -> impl IntoResponse {
    let (Some(train_path), Some(eval_path)) = (
        state.config.rubric_train_path.clone(),
        state.config.rubric_eval_path.clone(),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "RUBRIC_TRAIN_PATH and RUBRIC_EVAL_PATH are not configured"})),
        )
            .into_response();
    };

    let loaded = tokio::task::spawn_blocking(move || Dataset::load(&train_path, &eval_path)).await;
    match loaded {
        Ok(Ok(dataset)) => {
            let summary = dataset.summary();
            *state.dataset.write().await = Some(Arc::new(dataset));
            Json(summary).into_response()
        }
        Ok(Err(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": err.to_string()})),
        )
            .into_response(),
        Err(join_err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": join_err.to_string()})),
        )
            .into_response(),
    }
}

/// `GET /dataset-info`: summary of the currently loaded dataset.
pub async fn dataset_info(State(state): State<AppState>) -> impl IntoResponse {
    match state.dataset.read().await.as_ref() {
        Some(dataset) => Json(dataset.summary()).into_response(),
        None => Json(json!({
            "error": "Dataset not loaded. Call POST /load-dataset first."
        }))
        .into_response(),
    }
}
