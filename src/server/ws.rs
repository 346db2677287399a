//! The streaming WebSocket endpoint.
//!
//! One bidirectional JSON-framed channel per client. Commands are handled
//! sequentially; while a search runs, a writer task owns the socket sink and
//! drains the session's event channel, so the engine never blocks on client
//! I/O. When the client goes away the writer stops, the channel closes, and
//! the running session cancels itself silently.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::AppState;
use crate::error::Error;
use crate::events::{ClientCommand, ServerEvent};
use crate::session;
use crate::tree::make_id;

/// WebSocket upgrade handler at `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = make_id();
    tracing::info!(session = %session_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();

    // The writer task is the sole owner of the sink; everything else sends
    // through this channel.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(64);
    let writer_session = session_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(session = %writer_session, error = %err, "event serialization failed");
                    continue;
                }
            };
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(err) => {
                if send(&tx, ServerEvent::error(format!("invalid command: {err}")))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        if dispatch(&state, command, &tx).await.is_err() {
            // The client is gone; stop reading.
            break;
        }
    }

    drop(tx);
    let _ = writer.await;
    tracing::info!(session = %session_id, "websocket closed");
}

async fn send(tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> Result<(), ()> {
    tx.send(event).await.map_err(|_| ())
}

/// Handle one client command. `Err(())` means the client disconnected.
async fn dispatch(
    state: &AppState,
    command: ClientCommand,
    tx: &mpsc::Sender<ServerEvent>,
) -> Result<(), ()> {
    match command {
        ClientCommand::Ping => send(tx, ServerEvent::Pong).await,

        ClientCommand::Ask {
            question,
            video_ids,
            max_iterations,
        } => {
            if question.is_empty() {
                return send(tx, ServerEvent::error("No question provided.")).await;
            }
            let context = state.store.build_context(&video_ids);
            if context.trim().is_empty() {
                return send(tx, ServerEvent::error("No transcripts loaded.")).await;
            }

            let deps = state.session_deps();
            match session::run_ask(&deps, context, question, max_iterations, tx.clone()).await {
                Ok(()) => Ok(()),
                Err(Error::Cancelled) => Err(()),
                Err(err) => {
                    tracing::error!(error = %err, "search failed");
                    send(tx, ServerEvent::error(format!("Search failed: {err}"))).await
                }
            }
        }

        ClientCommand::Compare {
            question,
            video_ids,
            max_iterations,
        } => {
            if question.is_empty() {
                return send(tx, ServerEvent::error("No question provided.")).await;
            }
            let context = state.store.build_context(&video_ids);
            if context.trim().is_empty() {
                return send(tx, ServerEvent::error("No transcripts loaded.")).await;
            }

            let deps = state.session_deps();
            match session::run_compare(&deps, context, question, max_iterations, tx.clone()).await
            {
                Ok(()) => Ok(()),
                Err(Error::Cancelled) => Err(()),
                Err(err) => {
                    tracing::error!(error = %err, "comparison failed");
                    send(tx, ServerEvent::error(format!("Comparison failed: {err}"))).await
                }
            }
        }

        ClientCommand::Discover {
            max_iterations,
            max_depth,
        } => {
            let dataset = state.dataset.read().await.clone();
            let Some(dataset) = dataset else {
                return send(
                    tx,
                    ServerEvent::error("Dataset not loaded. Call POST /load-dataset first."),
                )
                .await;
            };

            let deps = state.session_deps();
            match session::run_discover(&deps, &dataset, max_iterations, max_depth, tx.clone())
                .await
            {
                Ok(()) => Ok(()),
                Err(Error::Cancelled) => Err(()),
                Err(err) => {
                    tracing::error!(error = %err, "discovery failed");
                    send(tx, ServerEvent::error(format!("Discovery failed: {err}"))).await
                }
            }
        }
    }
}
