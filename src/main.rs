//! Server binary: wires configuration, the provider client, and the HTTP
//! boundary together.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use arbor::config::Config;
use arbor::llm::{ClientConfig, OpenAIClient};
use arbor::server::{router, AppState};
use arbor::transcript::fetch::YtDlpTranscriber;
use arbor::transcript::Transcriber;

#[tokio::main]
async fn main() -> arbor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env()?);

    let mut client_config = ClientConfig::new(&config.api_key);
    if let Some(base_url) = &config.base_url {
        client_config = client_config.with_base_url(base_url);
    }
    let client = Arc::new(OpenAIClient::new(client_config));

    let transcriber: Option<Arc<dyn Transcriber>> = match YtDlpTranscriber::discover() {
        Ok(transcriber) => Some(Arc::new(transcriber)),
        Err(err) => {
            tracing::warn!(error = %err, "transcription disabled");
            None
        }
    };

    let state = AppState::new(config.clone(), client, transcriber);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| {
            arbor::Error::Config(format!("cannot bind {}: {}", config.bind_addr, e))
        })?;
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .map_err(|e| arbor::Error::Internal(format!("server error: {}", e)))?;

    Ok(())
}
