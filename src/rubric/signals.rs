//! The five algorithmic reward signals for rubric hypotheses.
//!
//! No LLM calls here: every signal is computed from (predicted, actual)
//! pairs and the rubric source text, and every output is clamped to [0, 1].

use serde::{Deserialize, Serialize};

use crate::text::round_to;

/// One (predicted, actual) pair from running a rubric over examples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredPrediction {
    pub predicted: f64,
    pub actual: f64,
}

/// Signal weights for the composite.
pub const WEIGHT_GENERALIZATION: f64 = 1.0;
pub const WEIGHT_CALIBRATION: f64 = 0.4;
pub const WEIGHT_DISCRIMINATION: f64 = 0.3;
pub const WEIGHT_VALIDITY: f64 = 0.2;
pub const WEIGHT_ITERATION: f64 = 0.2;

/// All five signals plus their weighted composite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub generalization: f64,
    pub calibration: f64,
    pub discrimination: f64,
    pub validity: f64,
    pub iteration: f64,
    pub composite: f64,
}

/// Mean absolute error; an empty result set counts as the worst case.
pub fn mae(results: &[ScoredPrediction]) -> f64 {
    if results.is_empty() {
        return 1.0;
    }
    let total: f64 = results.iter().map(|r| (r.predicted - r.actual).abs()).sum();
    total / results.len() as f64
}

/// How well the rubric generalizes from train to unseen eval data.
///
/// A large eval-over-train gap means memorization; low absolute eval error
/// is rewarded on top.
pub fn generalization_reward(
    train_results: &[ScoredPrediction],
    eval_results: &[ScoredPrediction],
) -> f64 {
    if train_results.is_empty() || eval_results.is_empty() {
        return 0.0;
    }

    let train_mae = mae(train_results);
    let eval_mae = mae(eval_results);

    if train_mae == 0.0 && eval_mae == 0.0 {
        return 1.0;
    }

    let gap = (eval_mae - train_mae).max(0.0);
    let eval_accuracy = (1.0 - eval_mae).max(0.0);
    let score = eval_accuracy * (1.0 - gap.min(1.0));
    round_to(score.clamp(0.0, 1.0), 4)
}

/// How well predicted scores match the actual score distribution:
/// close means plus similar spread.
pub fn calibration_reward(results: &[ScoredPrediction]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }

    let actuals: Vec<f64> = results.iter().map(|r| r.actual).collect();
    let preds: Vec<f64> = results.iter().map(|r| r.predicted).collect();

    let actual_mean = actuals.iter().sum::<f64>() / actuals.len() as f64;
    let pred_mean = preds.iter().sum::<f64>() / preds.len() as f64;
    let mean_diff = (actual_mean - pred_mean).abs();

    let actual_std = std_dev(&actuals);
    let pred_std = std_dev(&preds);
    let std_ratio = pred_std.min(actual_std) / pred_std.max(actual_std).max(1e-6);

    let calibration = (1.0 - mean_diff.min(1.0)) * 0.6 + std_ratio * 0.4;
    round_to(calibration.clamp(0.0, 1.0), 4)
}

/// Rank correlation between predicted and actual scores, mapped to [0, 1].
/// Needs at least three results to mean anything.
pub fn discrimination_reward(results: &[ScoredPrediction]) -> f64 {
    if results.len() < 3 {
        return 0.0;
    }

    let n = results.len() as f64;
    let actuals: Vec<f64> = results.iter().map(|r| r.actual).collect();
    let preds: Vec<f64> = results.iter().map(|r| r.predicted).collect();

    let ranked_a = rank(&actuals);
    let ranked_p = rank(&preds);

    let d_sq: f64 = ranked_a
        .iter()
        .zip(&ranked_p)
        .map(|(ra, rp)| (ra - rp).powi(2))
        .sum();
    let rho = 1.0 - (6.0 * d_sq) / (n * (n * n - 1.0));

    round_to(((rho + 1.0) / 2.0).clamp(0.0, 1.0), 4)
}

/// Code quality: base credit for successful execution, penalties for
/// constant-return rubrics, bonuses for non-trivial logic.
pub fn validity_reward(rubric_code: &str, execution_success: bool) -> f64 {
    if !execution_success {
        return 0.0;
    }

    let mut score: f64 = 0.6;

    let return_count = rubric_code.matches("return").count();
    if rubric_code.contains("return 0") && return_count == 1 {
        score -= 0.3;
    }
    if rubric_code.contains("return 1") && return_count == 1 {
        score -= 0.3;
    }

    let logic_keywords = [
        "if ", "for ", "len(", "re::", "split", "to_lower", "contains",
    ];
    let logic_count = logic_keywords
        .iter()
        .filter(|kw| rubric_code.contains(*kw))
        .count();
    score += (logic_count as f64 * 0.05).min(0.3);

    if rubric_code.contains("response") || rubric_code.contains("text") {
        score += 0.1;
    }

    round_to(score.clamp(0.0, 1.0), 4)
}

/// Improvement over the parent hypothesis. Without a parent the signal is
/// absolute quality; with one, big improvements map toward 1.0, no change to
/// 0.3, and regressions toward 0.0.
pub fn iteration_reward(current_mae: f64, parent_mae: Option<f64>) -> f64 {
    let Some(parent_mae) = parent_mae else {
        return round_to((1.0 - current_mae).clamp(0.0, 1.0), 4);
    };

    if parent_mae == 0.0 {
        return if current_mae == 0.0 { 1.0 } else { 0.0 };
    }

    let improvement = (parent_mae - current_mae) / parent_mae;
    if improvement > 0.0 {
        round_to((0.3 + improvement * 0.7).min(1.0), 4)
    } else {
        round_to((0.3 + improvement).max(0.0), 4)
    }
}

/// Compute all five signals and the weighted composite.
pub fn compute_rewards(
    rubric_code: &str,
    train_results: &[ScoredPrediction],
    eval_results: &[ScoredPrediction],
    execution_success: bool,
    parent_mae: Option<f64>,
) -> RewardBreakdown {
    let train_mae = if train_results.is_empty() {
        1.0
    } else {
        mae(train_results)
    };

    let generalization = generalization_reward(train_results, eval_results);
    let calibration = calibration_reward(train_results);
    let discrimination = discrimination_reward(train_results);
    let validity = validity_reward(rubric_code, execution_success);
    let iteration = iteration_reward(train_mae, parent_mae);

    let total_weight = WEIGHT_GENERALIZATION
        + WEIGHT_CALIBRATION
        + WEIGHT_DISCRIMINATION
        + WEIGHT_VALIDITY
        + WEIGHT_ITERATION;
    let composite = (generalization * WEIGHT_GENERALIZATION
        + calibration * WEIGHT_CALIBRATION
        + discrimination * WEIGHT_DISCRIMINATION
        + validity * WEIGHT_VALIDITY
        + iteration * WEIGHT_ITERATION)
        / total_weight;

    RewardBreakdown {
        generalization,
        calibration,
        discrimination,
        validity,
        iteration,
        composite: round_to(composite, 4),
    }
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Assign 1-based ranks, averaging ties.
fn rank(values: &[f64]) -> Vec<f64> {
    let mut indexed: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < indexed.len() {
        let mut j = i;
        while j < indexed.len() && indexed[j].1 == indexed[i].1 {
            j += 1;
        }
        let avg_rank = (i + j + 1) as f64 / 2.0;
        for entry in &indexed[i..j] {
            ranks[entry.0] = avg_rank;
        }
        i = j;
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pairs(values: &[(f64, f64)]) -> Vec<ScoredPrediction> {
        values
            .iter()
            .map(|(p, a)| ScoredPrediction {
                predicted: *p,
                actual: *a,
            })
            .collect()
    }

    #[test]
    fn test_mae_empty_is_worst_case() {
        assert_eq!(mae(&[]), 1.0);
        assert_eq!(mae(&pairs(&[(0.5, 0.3), (0.2, 0.4)])), 0.2);
    }

    #[test]
    fn test_perfect_predictions_generalize_fully() {
        let perfect = pairs(&[(0.1, 0.1), (0.5, 0.5), (0.9, 0.9), (0.3, 0.3)]);
        assert_eq!(generalization_reward(&perfect, &perfect), 1.0);
        assert!(discrimination_reward(&perfect) >= 0.99);
    }

    #[test]
    fn test_generalization_penalizes_overfitting() {
        let train = pairs(&[(0.5, 0.5), (0.3, 0.3)]);
        let eval = pairs(&[(0.9, 0.1), (0.1, 0.9)]);
        // eval MAE 0.8, train MAE 0 -> gap 0.8, accuracy 0.2
        let score = generalization_reward(&train, &eval);
        assert!((score - 0.2 * 0.2).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn test_calibration_identical_distributions() {
        let results = pairs(&[(0.1, 0.1), (0.5, 0.5), (0.9, 0.9)]);
        assert_eq!(calibration_reward(&results), 1.0);
    }

    #[test]
    fn test_discrimination_needs_three_results() {
        assert_eq!(discrimination_reward(&pairs(&[(0.1, 0.2), (0.3, 0.4)])), 0.0);
    }

    #[test]
    fn test_discrimination_inverse_ranking_is_zero() {
        let inverted = pairs(&[(0.9, 0.1), (0.5, 0.5), (0.1, 0.9)]);
        assert_eq!(discrimination_reward(&inverted), 0.0);
    }

    #[test]
    fn test_rank_averages_ties() {
        assert_eq!(rank(&[1.0, 2.0, 2.0, 3.0]), vec![1.0, 2.5, 2.5, 4.0]);
    }

    #[test]
    fn test_validity_failure_is_zero() {
        assert_eq!(validity_reward("fn rubric_fn(response) { 0.5 }", false), 0.0);
    }

    #[test]
    fn test_validity_rewards_logic_and_penalizes_constants() {
        let constant = "fn rubric_fn(response) { return 0.0; }";
        let rich = "fn rubric_fn(response) { let s = 0.0; if response.contains(\"Plan\") { s += 1.0; } for line in response.split(\"\\n\") { } return s; }";
        assert!(validity_reward(rich, true) > validity_reward(constant, true));
    }

    #[test]
    fn test_iteration_reward_improvement() {
        // Parent MAE 0.30, child MAE 0.15: 0.3 + 0.7 * 0.5 = 0.65
        assert_eq!(iteration_reward(0.15, Some(0.30)), 0.65);
    }

    #[test]
    fn test_iteration_reward_without_parent() {
        assert_eq!(iteration_reward(0.25, None), 0.75);
    }

    #[test]
    fn test_iteration_reward_regression_floors_at_zero() {
        assert_eq!(iteration_reward(0.9, Some(0.3)), 0.0);
        assert_eq!(iteration_reward(0.3, Some(0.3)), 0.3);
    }

    #[test]
    fn test_iteration_reward_zero_parent() {
        assert_eq!(iteration_reward(0.0, Some(0.0)), 1.0);
        assert_eq!(iteration_reward(0.2, Some(0.0)), 0.0);
    }

    #[test]
    fn test_composite_is_clamped_and_weighted() {
        let perfect = pairs(&[(0.1, 0.1), (0.5, 0.5), (0.9, 0.9), (0.2, 0.2)]);
        let rewards = compute_rewards(
            "fn rubric_fn(response) { if response.contains(\"x\") { return 1.0; } return 0.5; }",
            &perfect,
            &perfect,
            true,
            None,
        );
        assert!(rewards.composite > 0.0 && rewards.composite <= 1.0);
        assert_eq!(rewards.generalization, 1.0);
        assert_eq!(rewards.iteration, 1.0);
    }
}
