//! Caption-based transcript acquisition via the `yt-dlp` binary.
//!
//! Manual captions are tried first, then auto-generated ones; the subtitle
//! files land in a scratch dir and are parsed with [`super::subtitle`].

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;

use super::subtitle::{deduplicate, parse_srt, parse_vtt};
use super::{TranscriptSegment, Transcriber, VideoInfo};
use crate::error::{Error, Result};

/// [`Transcriber`] backed by the `yt-dlp` CLI.
pub struct YtDlpTranscriber {
    binary: PathBuf,
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    channel: String,
}

impl YtDlpTranscriber {
    /// Locate `yt-dlp` on the PATH.
    pub fn discover() -> Result<Self> {
        let binary = which::which("yt-dlp")
            .map_err(|e| Error::Transcription(format!("yt-dlp not found: {}", e)))?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    async fn fetch_subtitles(&self, url: &str, auto: bool) -> Result<Vec<TranscriptSegment>> {
        let scratch = tempfile::TempDir::with_prefix("arbor_subs_")
            .map_err(|e| Error::Transcription(format!("scratch dir failed: {}", e)))?;
        let out_template = scratch.path().join("subs");

        let sub_flag = if auto {
            "--write-auto-subs"
        } else {
            "--write-subs"
        };
        let output = Command::new(&self.binary)
            .arg("--skip-download")
            .arg(sub_flag)
            .arg("--sub-langs")
            .arg("en")
            .arg("--sub-format")
            .arg("vtt/srt")
            .arg("--no-warnings")
            .arg("--quiet")
            .arg("-o")
            .arg(&out_template)
            .arg(url)
            .output()
            .await
            .map_err(|e| Error::Transcription(format!("failed to run yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transcription(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let mut entries = tokio::fs::read_dir(scratch.path())
            .await
            .map_err(|e| Error::Transcription(format!("cannot list subtitles: {}", e)))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "vtt" && ext != "srt" {
                continue;
            }
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Transcription(format!("cannot read subtitles: {}", e)))?;
            let segments = if ext == "vtt" {
                parse_vtt(&content)
            } else {
                parse_srt(&content)
            };
            if !segments.is_empty() {
                return Ok(deduplicate(segments));
            }
        }

        Err(Error::Transcription("no usable subtitle file".to_string()))
    }
}

#[async_trait]
impl Transcriber for YtDlpTranscriber {
    async fn video_info(&self, url: &str) -> Result<VideoInfo> {
        let output = Command::new(&self.binary)
            .arg("-J")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(url)
            .output()
            .await
            .map_err(|e| Error::Transcription(format!("failed to run yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Transcription(format!(
                "yt-dlp exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let info: YtDlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Transcription(format!("invalid yt-dlp metadata: {}", e)))?;

        Ok(VideoInfo {
            id: info.id,
            title: info.title,
            duration: info.duration,
            channel: info.channel,
            url: url.to_string(),
        })
    }

    async fn transcribe(&self, url: &str) -> Result<Vec<TranscriptSegment>> {
        // Manual captions first, auto-generated as fallback.
        match self.fetch_subtitles(url, false).await {
            Ok(segments) => Ok(segments),
            Err(manual_err) => {
                tracing::debug!(error = %manual_err, "manual captions unavailable, trying auto");
                self.fetch_subtitles(url, true).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_parsing_tolerates_missing_fields() {
        let info: YtDlpInfo = serde_json::from_str("{\"id\": \"abc123\"}").unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.duration, 0.0);
        assert!(info.title.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_transcription_error() {
        let transcriber = YtDlpTranscriber::with_binary(PathBuf::from("/definitely/missing/yt-dlp"));
        let err = transcriber.video_info("https://example.com/v").await.unwrap_err();
        assert!(matches!(err, Error::Transcription(_)));
    }
}
