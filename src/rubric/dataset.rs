//! Labeled-example dataset for rubric discovery.
//!
//! Records arrive pre-scored as `(input, response, score, spec)` JSONL rows;
//! acquisition and grading live outside this crate. This module loads them,
//! summarizes the score distribution, and draws the deterministic stratified
//! sample the policy sees during a session.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

use crate::error::{Error, Result};
use crate::text::round_to;

/// Default stratified-sample size.
pub const SAMPLE_SIZE: usize = 20;
/// Fixed seed so refinements see the same examples within a session.
pub const SAMPLE_SEED: u64 = 123;

/// One labeled example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Example {
    #[serde(default)]
    pub input: serde_json::Value,
    pub response: String,
    pub score: f64,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub spec: serde_json::Value,
}

/// Train/eval split of scored examples.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<Example>,
    pub eval: Vec<Example>,
}

impl Dataset {
    /// Load a pre-split dataset from two JSONL files.
    pub fn load(train_path: &Path, eval_path: &Path) -> Result<Self> {
        Ok(Self {
            train: read_jsonl(train_path)?,
            eval: read_jsonl(eval_path)?,
        })
    }

    /// Shuffle and split a single pool of examples ~80/20.
    pub fn split(mut all: Vec<Example>, seed: u64) -> Self {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        all.shuffle(&mut rng);
        let split_idx = (all.len() as f64 * 0.8) as usize;
        let eval = all.split_off(split_idx);
        Self { train: all, eval }
    }

    pub fn summary(&self) -> DatasetSummary {
        let train_scores: Vec<f64> = self.train.iter().map(|e| e.score).collect();
        let eval_scores: Vec<f64> = self.eval.iter().map(|e| e.score).collect();

        let train_min = train_scores.iter().copied().fold(f64::INFINITY, f64::min);

        DatasetSummary {
            num_training: self.train.len(),
            num_eval: self.eval.len(),
            train_score_mean: round_to(mean(&train_scores), 4),
            train_score_min: round_to(if train_min.is_finite() { train_min } else { 0.0 }, 4),
            train_score_max: round_to(train_scores.iter().copied().fold(0.0, f64::max), 4),
            eval_score_mean: round_to(mean(&eval_scores), 4),
            score_distribution: score_distribution(&train_scores),
        }
    }
}

/// Summary statistics reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub num_training: usize,
    pub num_eval: usize,
    pub train_score_mean: f64,
    pub train_score_min: f64,
    pub train_score_max: f64,
    pub eval_score_mean: f64,
    pub score_distribution: BTreeMap<String, usize>,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn score_distribution(scores: &[f64]) -> BTreeMap<String, usize> {
    let buckets = ["0.0-0.2", "0.2-0.4", "0.4-0.6", "0.6-0.8", "0.8-1.0"];
    let mut distribution: BTreeMap<String, usize> =
        buckets.iter().map(|b| (b.to_string(), 0)).collect();
    for score in scores {
        let bucket = if *score < 0.2 {
            "0.0-0.2"
        } else if *score < 0.4 {
            "0.2-0.4"
        } else if *score < 0.6 {
            "0.4-0.6"
        } else if *score < 0.8 {
            "0.6-0.8"
        } else {
            "0.8-1.0"
        };
        if let Some(count) = distribution.get_mut(bucket) {
            *count += 1;
        }
    }
    distribution
}

fn read_jsonl(path: &Path) -> Result<Vec<Example>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Dataset(format!("cannot open {}: {}", path.display(), e)))?;
    let reader = std::io::BufReader::new(file);

    let mut examples = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line =
            line.map_err(|e| Error::Dataset(format!("read error in {}: {}", path.display(), e)))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(trimmed).map_err(|e| {
            Error::Dataset(format!(
                "invalid record at {}:{}: {}",
                path.display(),
                line_no + 1,
                e
            ))
        })?;
        examples.push(example);
    }
    Ok(examples)
}

/// Draw a stratified sample with equal representation from each score tier
/// (low < 0.3 <= mid < 0.7 <= high), deterministically from a fixed seed.
pub fn stratified_sample(examples: &[Example], n: usize, seed: u64) -> Vec<Example> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut low = Vec::new();
    let mut mid = Vec::new();
    let mut high = Vec::new();
    for (index, example) in examples.iter().enumerate() {
        if example.score < 0.3 {
            low.push(index);
        } else if example.score < 0.7 {
            mid.push(index);
        } else {
            high.push(index);
        }
    }

    let per_tier = (n / 3).max(2);
    let mut picked: Vec<usize> = Vec::new();
    for tier in [&low, &mid, &high] {
        let k = per_tier.min(tier.len());
        picked.extend(tier.choose_multiple(&mut rng, k).copied());
    }

    // Back-fill from the remaining pool if any tier ran short.
    if picked.len() < n {
        let taken: std::collections::HashSet<usize> = picked.iter().copied().collect();
        let leftover: Vec<usize> = (0..examples.len()).filter(|i| !taken.contains(i)).collect();
        let missing = (n - picked.len()).min(leftover.len());
        picked.extend(leftover.choose_multiple(&mut rng, missing).copied());
    }

    picked.shuffle(&mut rng);
    picked.truncate(n);
    picked.into_iter().map(|i| examples[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn example(score: f64) -> Example {
        Example {
            input: serde_json::Value::Null,
            response: format!("response scoring {score}"),
            score,
            source: String::new(),
            spec: serde_json::Value::Null,
        }
    }

    fn spread(counts: (usize, usize, usize)) -> Vec<Example> {
        let mut examples = Vec::new();
        for i in 0..counts.0 {
            examples.push(example(0.1 + (i as f64) * 0.001));
        }
        for i in 0..counts.1 {
            examples.push(example(0.5 + (i as f64) * 0.001));
        }
        for i in 0..counts.2 {
            examples.push(example(0.8 + (i as f64) * 0.001));
        }
        examples
    }

    #[test]
    fn test_stratified_sample_is_deterministic() {
        let examples = spread((20, 20, 20));
        let a = stratified_sample(&examples, SAMPLE_SIZE, SAMPLE_SEED);
        let b = stratified_sample(&examples, SAMPLE_SIZE, SAMPLE_SEED);
        let scores_a: Vec<f64> = a.iter().map(|e| e.score).collect();
        let scores_b: Vec<f64> = b.iter().map(|e| e.score).collect();
        assert_eq!(scores_a, scores_b);
    }

    #[test]
    fn test_stratified_sample_covers_all_tiers() {
        let examples = spread((20, 20, 20));
        let sample = stratified_sample(&examples, 9, SAMPLE_SEED);
        assert!(sample.iter().any(|e| e.score < 0.3));
        assert!(sample.iter().any(|e| e.score >= 0.3 && e.score < 0.7));
        assert!(sample.iter().any(|e| e.score >= 0.7));
    }

    #[test]
    fn test_stratified_sample_backfills_short_tiers() {
        let examples = spread((1, 1, 30));
        let sample = stratified_sample(&examples, 12, SAMPLE_SEED);
        assert_eq!(sample.len(), 12);
    }

    #[test]
    fn test_split_ratio() {
        let dataset = Dataset::split(spread((40, 40, 20)), 42);
        assert_eq!(dataset.train.len(), 80);
        assert_eq!(dataset.eval.len(), 20);
    }

    #[test]
    fn test_summary_distribution() {
        let dataset = Dataset {
            train: vec![example(0.1), example(0.5), example(0.9), example(0.95)],
            eval: vec![example(0.4)],
        };
        let summary = dataset.summary();
        assert_eq!(summary.num_training, 4);
        assert_eq!(summary.num_eval, 1);
        assert_eq!(summary.score_distribution["0.8-1.0"], 2);
        assert_eq!(summary.score_distribution["0.0-0.2"], 1);
    }

    #[test]
    fn test_read_jsonl_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(
            &path,
            "{\"response\": \"good answer\", \"score\": 0.8}\n\n{\"response\": \"bad\", \"score\": 0.1}\n",
        )
        .unwrap();

        let examples = read_jsonl(&path).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].score, 0.8);
        assert_eq!(examples[1].response, "bad");
    }
}
