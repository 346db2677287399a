//! Overlapping transcript chunks with TF-IDF retrieval.

use regex::Regex;
use std::collections::{HashMap, HashSet};

use crate::transcript::{format_timestamp, TranscriptSegment};

/// One searchable chunk of transcript text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    /// Start timestamp in seconds
    pub start: f64,
    pub end: f64,
    pub token_count: usize,
}

/// Chunk store with a TF-IDF index.
#[derive(Debug, Default)]
pub struct ChunkStore {
    pub chunks: Vec<Chunk>,
    idf: HashMap<String, f64>,
    tf: Vec<HashMap<String, f64>>,
}

impl ChunkStore {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let mut store = Self {
            chunks,
            idf: HashMap::new(),
            tf: Vec::new(),
        };
        store.build_index();
        store
    }

    fn build_index(&mut self) {
        let doc_count = self.chunks.len();
        if doc_count == 0 {
            return;
        }

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        self.tf = Vec::with_capacity(doc_count);

        for chunk in &self.chunks {
            let tokens = tokenize(&chunk.text);
            let total = tokens.len().max(1) as f64;
            let mut term_frequency: HashMap<String, f64> = HashMap::new();
            for token in &tokens {
                *term_frequency.entry(token.clone()).or_insert(0.0) += 1.0;
            }
            for count in term_frequency.values_mut() {
                *count /= total;
            }
            for token in tokens.into_iter().collect::<HashSet<_>>() {
                *document_frequency.entry(token).or_insert(0) += 1;
            }
            self.tf.push(term_frequency);
        }

        self.idf = document_frequency
            .into_iter()
            .map(|(token, freq)| {
                let idf = ((doc_count + 1) as f64 / (freq + 1) as f64).ln() + 1.0;
                (token, idf)
            })
            .collect();
    }

    /// Top-k chunk indices with relevance scores, best first.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(usize, f64)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.tf.is_empty() {
            return (0..top_k.min(self.chunks.len())).map(|i| (i, 0.0)).collect();
        }

        let mut scores: Vec<(usize, f64)> = self
            .tf
            .iter()
            .enumerate()
            .map(|(i, tf)| {
                let score = query_tokens
                    .iter()
                    .map(|t| tf.get(t).copied().unwrap_or(0.0) * self.idf.get(t).copied().unwrap_or(0.0))
                    .sum();
                (i, score)
            })
            .collect();

        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores.truncate(top_k);
        scores
    }

    /// Combined text for the selected chunks, oldest first, within a token
    /// budget.
    pub fn get_context(&self, chunk_indices: &[usize], max_tokens: usize) -> String {
        let mut indices: Vec<usize> = chunk_indices
            .iter()
            .copied()
            .filter(|i| *i < self.chunks.len())
            .collect();
        indices.sort_unstable();

        let mut texts = Vec::new();
        let mut total = 0;
        for index in indices {
            let chunk = &self.chunks[index];
            if total + chunk.token_count > max_tokens {
                break;
            }
            texts.push(format!(
                "[{}] {}",
                format_timestamp(chunk.start),
                chunk.text
            ));
            total += chunk.token_count;
        }
        texts.join("\n")
    }
}

/// Split transcript segments into overlapping chunks.
pub fn chunk_transcript(
    segments: &[TranscriptSegment],
    target_tokens: usize,
    overlap_tokens: usize,
) -> ChunkStore {
    if segments.is_empty() {
        return ChunkStore::default();
    }

    // Flatten into a word stream with interpolated timestamps.
    let mut words: Vec<(String, f64, f64)> = Vec::new();
    for segment in segments {
        let segment_words: Vec<&str> = segment.text.split_whitespace().collect();
        let n = segment_words.len().max(1) as f64;
        let duration = segment.end - segment.start;
        for (i, word) in segment_words.iter().enumerate() {
            let t = segment.start + (i as f64 / n) * duration;
            words.push((word.to_string(), t, segment.end));
        }
    }

    let mut chunks = Vec::new();
    let step = (target_tokens.saturating_sub(overlap_tokens)).max(1);
    let mut idx = 0;
    while idx < words.len() {
        let end_idx = (idx + target_tokens).min(words.len());
        let window = &words[idx..end_idx];

        chunks.push(Chunk {
            index: chunks.len(),
            text: window
                .iter()
                .map(|(w, _, _)| w.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            start: window[0].1,
            end: window[window.len() - 1].2,
            token_count: window.len(),
        });

        idx += step;
    }

    ChunkStore::new(chunks)
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "shall", "can", "to",
    "of", "in", "for", "on", "with", "at", "by", "from", "as", "into", "about", "between",
    "through", "during", "before", "after", "and", "but", "or", "nor", "not", "so", "yet", "both",
    "either", "neither", "each", "every", "all", "any", "few", "more", "most", "other", "some",
    "such", "no", "only", "own", "same", "than", "too", "very", "just", "because", "if", "when",
    "where", "how", "what", "which", "who", "whom", "this", "that", "these", "those", "i", "me",
    "my", "we", "our", "you", "your", "he", "him", "his", "she", "her", "it", "its", "they",
    "them", "their",
];

/// Lowercased word tokens with stopwords and single characters removed.
fn tokenize(text: &str) -> Vec<String> {
    let word_re = Regex::new(r"[a-z0-9]+").expect("static regex");
    word_re
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|w| w.len() > 1 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn segment(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_chunking_overlaps() {
        let text = (0..30).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let segments = vec![segment(0.0, 30.0, &text)];
        let store = chunk_transcript(&segments, 10, 4);

        assert!(store.chunks.len() > 3);
        assert_eq!(store.chunks[0].token_count, 10);
        // Overlap: the second chunk starts 6 words in.
        assert!(store.chunks[1].text.starts_with("word6"));
    }

    #[test]
    fn test_search_ranks_matching_chunk_first() {
        let segments = vec![
            segment(0.0, 10.0, "rust compilers and borrow checking details"),
            segment(10.0, 20.0, "cooking pasta with tomato sauce tonight"),
        ];
        let store = chunk_transcript(&segments, 6, 0);
        let results = store.search("borrow checking", 2);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn test_search_empty_query_returns_leading_chunks() {
        let segments = vec![segment(0.0, 10.0, "alpha beta gamma delta")];
        let store = chunk_transcript(&segments, 4, 0);
        let results = store.search("the of and", 3);
        assert_eq!(results[0], (0, 0.0));
    }

    #[test]
    fn test_get_context_respects_budget_and_order() {
        let segments = vec![segment(0.0, 40.0, &(0..40).map(|i| format!("tok{i}")).collect::<Vec<_>>().join(" "))];
        let store = chunk_transcript(&segments, 10, 0);

        let context = store.get_context(&[2, 0], 20);
        let first_line = context.lines().next().unwrap();
        assert!(first_line.contains("tok0"), "chunks come back in order");
        assert_eq!(context.lines().count(), 2);

        let capped = store.get_context(&[0, 1, 2, 3], 10);
        assert_eq!(capped.lines().count(), 1);
    }

    #[test]
    fn test_empty_segments_empty_store() {
        let store = chunk_transcript(&[], 10, 2);
        assert!(store.chunks.is_empty());
        assert!(store.search("anything", 5).is_empty());
    }
}
