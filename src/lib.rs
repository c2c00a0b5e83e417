//! # PADE-RUST Crate
//!
//! Resampling-based confidence scores for differential features.
//!
//! The library computes a statistic for every row of a features x samples
//! table, builds a null distribution of the same statistic by permuting or
//! bootstrapping samples within blocks, and turns the observed and null
//! histograms into a confidence score per feature. The binaries
//! `pade-run` and `pade-makesamples` call functions from this library.

pub mod analysis;
pub mod conf;
pub mod io;
pub mod layout;
pub mod ordering;
pub mod sampling;
pub mod stat;

use ndarray::{Array2, ArrayView2, Axis};
use ordering::Summary;
use sampling::{SampleIndexes, SamplingConfig};
use serde::{Deserialize, Serialize};
use stat::StatName;

pub const DEFAULT_NUM_BINS: usize = 1000;

/// Tuning parameters searched when none are given.
pub const DEFAULT_TUNING_PARAMS: [f64; 10] = [0.0001, 0.01, 0.1, 0.3, 0.5, 1.0, 1.5, 2.0, 3.0, 10.0];

/// Everything that controls a run. Passed explicitly into
/// [`analysis::run_analysis`]; nothing is read from global state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub stat: StatName,
    /// Shrinkage constants. Empty means the unshrunk statistic only.
    pub tuning_params: Vec<f64>,
    pub num_bins: usize,
    pub sampling: SamplingConfig,
    /// Means ratio only: report `max(r, 1/r)`.
    pub symmetric: bool,
    pub summary_min_conf: f64,
    pub summary_step_size: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            stat: StatName::default(),
            tuning_params: DEFAULT_TUNING_PARAMS.to_vec(),
            num_bins: DEFAULT_NUM_BINS,
            sampling: SamplingConfig::default(),
            symmetric: true,
            summary_min_conf: ordering::DEFAULT_SUMMARY_MIN_CONF,
            summary_step_size: ordering::DEFAULT_SUMMARY_STEP_SIZE,
        }
    }
}

impl Settings {
    /// Tuning parameters as seen by the statistics: `[0.0]` when none are set.
    pub fn effective_tuning_params(&self) -> Vec<f64> {
        if self.tuning_params.is_empty() {
            vec![0.0]
        } else {
            self.tuning_params.clone()
        }
    }
}

/// Everything a run produces. Serialized to disk with bincode by `pade-run`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AnalysisResults {
    pub settings: Settings,
    /// Shape `(tuning,)`.
    pub tuning_params: Vec<f64>,
    /// Observed statistics, shape `(tuning, features)`.
    pub raw_stats: Array2<f64>,
    /// Shape `(tuning, num_bins + 2)`; the last edge is `+inf`.
    pub bins: Array2<f64>,
    /// Observed cumulative histogram, shape `(tuning, num_bins + 1)`.
    pub bin_to_unperm_count: Array2<f64>,
    /// Mean null cumulative histogram, shape `(tuning, num_bins + 1)`.
    pub bin_to_mean_perm_count: Array2<f64>,
    /// Shape `(tuning, num_bins + 1)`, non-decreasing along bins.
    pub bin_to_score: Array2<f64>,
    /// Shape `(tuning, features)`.
    pub feature_to_score: Array2<f64>,
    pub sample_indexes: SampleIndexes,
    /// Mean of every condition group, shape `(features, conditions)`.
    pub group_means: Array2<f64>,
    /// Each condition's mean over the first condition's, shape `(features, conditions)`.
    pub fold_change: Array2<f64>,
    /// Shape `(tuning, features)`.
    pub order_by_score: Array2<usize>,
    /// Shape `(conditions, features)`.
    pub order_by_fold_change: Array2<usize>,
    pub summary: Summary,
}

impl AnalysisResults {
    pub fn num_features(&self) -> usize {
        self.raw_stats.ncols()
    }

    /// Index of the tuning parameter with the highest score for each
    /// feature. The first one wins ties.
    pub fn best_param_per_feature(&self) -> Vec<usize> {
        best_rows(self.feature_to_score.view())
    }
}

fn best_rows(scores: ArrayView2<f64>) -> Vec<usize> {
    scores
        .axis_iter(Axis(1))
        .map(|col| {
            col.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (p, &s)| if s > best.1 { (p, s) } else { best })
                .0
        })
        .collect()
}
