//! Module for ranking features and summarizing them by confidence level.
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SUMMARY_MIN_CONF: f64 = 0.1;
pub const DEFAULT_SUMMARY_STEP_SIZE: f64 = 0.05;
/// Smallest step between summary levels.
pub const MIN_SUMMARY_STEP_SIZE: f64 = 0.001;

/// Best tuning parameter and feature count for each confidence level.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Summary {
    pub levels: Vec<f64>,
    pub best_param_idxs: Vec<usize>,
    pub num_above: Vec<usize>,
}

impl Summary {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Indexes sorted by descending value, ties broken by ascending index.
fn descending_order(values: ArrayView1<f64>) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..values.len()).collect();
    idxs.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    idxs
}

/// Per tuning parameter, feature indexes by descending score.
/// Input and output shape is `(tuning, features)`.
pub fn order_by_score(feature_scores: ArrayView2<f64>) -> Array2<usize> {
    let mut res = Array2::zeros(feature_scores.raw_dim());
    for (p, row) in feature_scores.outer_iter().enumerate() {
        for (rank, idx) in descending_order(row).into_iter().enumerate() {
            res[[p, rank]] = idx;
        }
    }
    res
}

/// Per effect column (e.g. the fold change of one condition), feature
/// indexes by descending effect. Input is `(features, columns)`, output is
/// `(columns, features)`.
pub fn order_by_effect(effect: ArrayView2<f64>) -> Array2<usize> {
    let mut res = Array2::zeros((effect.ncols(), effect.nrows()));
    for (c, col) in effect.axis_iter(Axis(1)).enumerate() {
        for (rank, idx) in descending_order(col).into_iter().enumerate() {
            res[[c, rank]] = idx;
        }
    }
    res
}

fn count_above(row: ArrayView1<f64>, level: f64) -> usize {
    row.iter().filter(|&&s| s > level).count()
}

/// Tuning index with the most features scoring above `level`, and that
/// count. The first index wins ties.
pub fn best_param_for_level(feature_scores: ArrayView2<f64>, level: f64) -> (usize, usize) {
    let mut best = (0, 0);
    for (p, row) in feature_scores.outer_iter().enumerate() {
        let count = count_above(row, level);
        if count > best.1 {
            best = (p, count);
        }
    }
    best
}

/// Confidence levels `min_conf, min_conf + step, ...` strictly below 1.
pub fn conf_levels(min_conf: f64, step: f64) -> Vec<f64> {
    if !(step.is_finite() && step >= MIN_SUMMARY_STEP_SIZE) {
        log::warn!("Invalid summary step size {}, summarizing only at {}", step, min_conf);
        return vec![min_conf];
    }
    (0..)
        .map(|k| min_conf + k as f64 * step)
        .take_while(|&level| level < 1.0)
        .collect()
}

pub fn summary_by_conf_level(feature_scores: ArrayView2<f64>, min_conf: f64, step: f64) -> Summary {
    let levels = conf_levels(min_conf, step);
    let mut best_param_idxs = Vec::with_capacity(levels.len());
    let mut num_above = Vec::with_capacity(levels.len());
    for &level in &levels {
        let (idx, count) = best_param_for_level(feature_scores, level);
        best_param_idxs.push(idx);
        num_above.push(count);
    }
    Summary {
        levels,
        best_param_idxs,
        num_above,
    }
}

/// Score ordering under the best tuning parameter for `level`.
pub fn ordering_at_conf_level(feature_scores: ArrayView2<f64>, level: f64) -> Vec<usize> {
    if feature_scores.nrows() == 0 {
        return Vec::new();
    }
    let (best, _) = best_param_for_level(feature_scores, level);
    descending_order(feature_scores.index_axis(Axis(0), best))
}
