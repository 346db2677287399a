//! Transcripts: the store, context assembly, and the acquisition boundary.
//!
//! Transcript acquisition is an external collaborator: the core consumes it
//! through the [`Transcriber`] trait as `URL -> ordered (start, end, text)
//! segments` plus a metadata fetch. The store is process-wide, keyed by
//! video id, with coarse locking (writes only during ingest, reads during
//! Q&A).

pub mod fetch;
pub mod subtitle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::Result;
use crate::text::truncate_chars;

/// One timed transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

/// Video metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    pub duration: f64,
    pub channel: String,
    pub url: String,
}

/// A stored video: metadata, raw segments, and the timestamped full text
/// that becomes the sandbox `context`.
#[derive(Debug, Clone)]
pub struct VideoRecord {
    pub info: VideoInfo,
    pub segments: Vec<TranscriptSegment>,
    pub full_text: String,
}

/// Per-video summary returned by the transcribe endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct VideoSummary {
    pub video_id: String,
    pub title: String,
    pub duration: f64,
    pub channel: String,
    pub segment_count: usize,
    pub transcript_chars: usize,
    pub transcript_preview: String,
}

/// Transcript acquisition boundary.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Fetch basic video metadata.
    async fn video_info(&self, url: &str) -> Result<VideoInfo>;

    /// Transcribe a video into ordered segments.
    async fn transcribe(&self, url: &str) -> Result<Vec<TranscriptSegment>>;
}

/// Format seconds as `MM:SS`.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

/// Build the timestamped full text that gets injected as `context`.
pub fn full_text(segments: &[TranscriptSegment]) -> String {
    segments
        .iter()
        .map(|s| format!("[{}] {}", format_timestamp(s.start), s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Process-wide transcript cache keyed by video id.
///
/// Contention is negligible (infrequent ingest writes); a coarse lock is
/// all this needs.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    inner: RwLock<HashMap<String, VideoRecord>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: VideoRecord) -> VideoSummary {
        let summary = VideoSummary {
            video_id: record.info.id.clone(),
            title: record.info.title.clone(),
            duration: record.info.duration,
            channel: record.info.channel.clone(),
            segment_count: record.segments.len(),
            transcript_chars: record.full_text.len(),
            transcript_preview: truncate_chars(&record.full_text, 500),
        };
        if let Ok(mut map) = self.inner.write() {
            map.insert(record.info.id.clone(), record);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combine stored transcripts into one context string. An empty id list
    /// falls back to every stored video; unknown ids are skipped.
    pub fn build_context(&self, video_ids: &[String]) -> String {
        let Ok(map) = self.inner.read() else {
            return String::new();
        };

        let ids: Vec<String> = if video_ids.is_empty() {
            map.keys().cloned().collect()
        } else {
            video_ids.to_vec()
        };

        let mut combined = String::new();
        let mut matched = 0;
        for id in &ids {
            if let Some(record) = map.get(id) {
                combined.push_str(&format!("=== {} ===\n", record.info.title));
                combined.push_str(&record.full_text);
                combined.push_str("\n\n");
                matched += 1;
            }
        }

        tracing::info!(
            matched,
            requested = ids.len(),
            total_chars = combined.len(),
            "built transcript context"
        );
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(id: &str, title: &str, text: &str) -> VideoRecord {
        VideoRecord {
            info: VideoInfo {
                id: id.to_string(),
                title: title.to_string(),
                duration: 60.0,
                channel: "chan".to_string(),
                url: format!("https://example.com/{id}"),
            },
            segments: vec![TranscriptSegment {
                start: 0.0,
                end: 60.0,
                text: text.to_string(),
            }],
            full_text: format!("[00:00] {text}"),
        }
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00");
        assert_eq!(format_timestamp(75.4), "01:15");
        assert_eq!(format_timestamp(3605.0), "60:05");
    }

    #[test]
    fn test_full_text_prefixes_timestamps() {
        let segments = vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.0,
                text: "hello".to_string(),
            },
            TranscriptSegment {
                start: 65.0,
                end: 67.0,
                text: "world".to_string(),
            },
        ];
        assert_eq!(full_text(&segments), "[00:00] hello\n[01:05] world");
    }

    #[test]
    fn test_build_context_with_headers() {
        let store = TranscriptStore::new();
        store.insert(record("v1", "First Video", "alpha"));

        let context = store.build_context(&["v1".to_string()]);
        assert!(context.starts_with("=== First Video ===\n"));
        assert!(context.contains("[00:00] alpha"));
    }

    #[test]
    fn test_build_context_empty_ids_uses_all_videos() {
        let store = TranscriptStore::new();
        store.insert(record("v1", "One", "alpha"));
        store.insert(record("v2", "Two", "beta"));

        let context = store.build_context(&[]);
        assert!(context.contains("alpha"));
        assert!(context.contains("beta"));
    }

    #[test]
    fn test_build_context_unknown_ids_is_empty() {
        let store = TranscriptStore::new();
        store.insert(record("v1", "One", "alpha"));
        assert_eq!(store.build_context(&["missing".to_string()]), "");
    }

    #[test]
    fn test_insert_summary() {
        let store = TranscriptStore::new();
        let summary = store.insert(record("v1", "One", "alpha"));
        assert_eq!(summary.video_id, "v1");
        assert_eq!(summary.segment_count, 1);
        assert_eq!(summary.transcript_preview, "[00:00] alpha");
        assert_eq!(store.len(), 1);
    }
}
