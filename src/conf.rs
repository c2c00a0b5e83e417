//! Module for binning statistics and turning histograms into confidence scores.
//!
//! Every array here is indexed `(tuning param, bin)`. Bin edges hold
//! `num_bins + 1` finite edges followed by `+inf`, so there are
//! `num_bins + 1` bins: the finite ones plus an overflow bin.
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// Number of correction steps applied by [`adjust_num_diff`].
pub const ADJUST_ITERATIONS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfError {
    #[error("Shape mismatch: {what} is {got:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        got: (usize, usize),
        expected: (usize, usize),
    },
    #[error("Number of bins must be at least 1, got {0}")]
    InvalidBinCount(usize),
}

/// Evenly spaced bin edges from 0 to the largest finite statistic of each
/// tuning row, followed by `+inf`. Shape is `(tuning, num_bins + 2)`.
pub fn bins_uniform(num_bins: usize, stats: ArrayView2<f64>) -> Result<Array2<f64>, ConfError> {
    if num_bins == 0 {
        return Err(ConfError::InvalidBinCount(num_bins));
    }

    let mut bins = Array2::zeros((stats.nrows(), num_bins + 2));
    for (p, row) in stats.outer_iter().enumerate() {
        let observed_max = row
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);

        let max = if observed_max > 0.0 {
            observed_max
        } else {
            log::warn!(
                "Tuning param {}: no positive finite statistic, using a minimal bin range",
                p
            );
            num_bins as f64 * f64::EPSILON
        };

        for i in 0..num_bins {
            bins[[p, i]] = max * i as f64 / num_bins as f64;
        }
        bins[[p, num_bins]] = max;
        bins[[p, num_bins + 1]] = f64::INFINITY;
    }
    Ok(bins)
}

/// Bin of `value` in one row of edges.
///
/// A value equal to the top finite edge goes to the last finite bin, a value
/// above it to the overflow bin, and a value below the first edge to bin 0.
pub fn bin_index(edges: ArrayView1<f64>, value: f64) -> usize {
    let top = edges.len() - 2;
    if value == edges[top] {
        return top - 1;
    }
    if value > edges[top] {
        return top;
    }
    let pos = match edges.as_slice() {
        Some(e) => e.partition_point(|&x| x <= value),
        None => edges.iter().take_while(|&&x| x <= value).count(),
    };
    pos.saturating_sub(1)
}

/// Integer cumulative-from-above counts: `counts[p, i]` is the number of
/// statistics of tuning row `p` that fall in bin `i` or above. Negative and
/// NaN statistics are not counted.
pub fn cumulative_counts(
    stats: ArrayView2<f64>,
    bins: ArrayView2<f64>,
) -> Result<Array2<u64>, ConfError> {
    if stats.nrows() != bins.nrows() {
        return Err(ConfError::ShapeMismatch {
            what: "statistics",
            got: stats.dim(),
            expected: (bins.nrows(), stats.ncols()),
        });
    }

    let num_bins = bins.ncols() - 1;
    let mut counts = Array2::<u64>::zeros((stats.nrows(), num_bins));
    for (p, row) in stats.outer_iter().enumerate() {
        let edges = bins.index_axis(Axis(0), p);
        for &v in row.iter() {
            if v.is_nan() || v < 0.0 {
                continue;
            }
            counts[[p, bin_index(edges, v)]] += 1;
        }
        for i in (0..num_bins.saturating_sub(1)).rev() {
            counts[[p, i]] += counts[[p, i + 1]];
        }
    }
    Ok(counts)
}

/// Cumulative-from-above histogram of the statistics as `f64`.
pub fn cumulative_hist(
    stats: ArrayView2<f64>,
    bins: ArrayView2<f64>,
) -> Result<Array2<f64>, ConfError> {
    Ok(cumulative_counts(stats, bins)?.mapv(|c| c as f64))
}

/// Corrects the null count `v0` for the share of truly different features,
/// iterating `V[k] = V[0] - V[0] / num_ids * (r - V[k-1])` five times.
pub fn adjust_num_diff(v0: f64, r: f64, num_ids: f64) -> f64 {
    let mut v = v0;
    for _ in 0..ADJUST_ITERATIONS {
        v = v0 - v0 / num_ids * (r - v);
    }
    v
}

/// Raises each score to at least the score of the bin below it.
pub fn ensure_increases(scores: &mut Array2<f64>) {
    for mut row in scores.outer_iter_mut() {
        for i in 1..row.len() {
            if row[i] < row[i - 1] {
                row[i] = row[i - 1];
            }
        }
    }
}

/// Confidence score per bin from the observed and mean null cumulative
/// histograms. Bins with no observed feature score 0.
pub fn confidence_scores(
    unperm_counts: ArrayView2<f64>,
    mean_perm_counts: ArrayView2<f64>,
    num_features: usize,
) -> Result<Array2<f64>, ConfError> {
    if unperm_counts.dim() != mean_perm_counts.dim() {
        return Err(ConfError::ShapeMismatch {
            what: "null histogram",
            got: mean_perm_counts.dim(),
            expected: unperm_counts.dim(),
        });
    }

    let num_ids = num_features as f64;
    let mut scores = Array2::zeros(unperm_counts.raw_dim());
    for ((idx, score), &observed) in scores.indexed_iter_mut().zip(unperm_counts.iter()) {
        if observed == 0.0 {
            continue;
        }
        let adjusted = adjust_num_diff(mean_perm_counts[idx], observed, num_ids);
        *score = (observed - adjusted) / observed;
    }

    log::debug!("Computed confidence scores of shape {:?}", scores.dim());
    ensure_increases(&mut scores);
    Ok(scores)
}

/// Looks up the score of every feature's bin. Output shape is
/// `(tuning, features)`, matching `stats`.
pub fn assign_scores_to_features(
    stats: ArrayView2<f64>,
    bins: ArrayView2<f64>,
    scores: ArrayView2<f64>,
) -> Result<Array2<f64>, ConfError> {
    let expected = (bins.nrows(), bins.ncols() - 1);
    if scores.dim() != expected {
        return Err(ConfError::ShapeMismatch {
            what: "scores",
            got: scores.dim(),
            expected,
        });
    }
    if stats.nrows() != bins.nrows() {
        return Err(ConfError::ShapeMismatch {
            what: "statistics",
            got: stats.dim(),
            expected: (bins.nrows(), stats.ncols()),
        });
    }

    let mut res = Array2::zeros(stats.raw_dim());
    for (p, row) in stats.outer_iter().enumerate() {
        let edges = bins.index_axis(Axis(0), p);
        for (i, &v) in row.iter().enumerate() {
            res[[p, i]] = scores[[p, bin_index(edges, v)]];
        }
    }
    Ok(res)
}

/// Top finite edge of each tuning row, i.e. the largest binned statistic.
pub fn max_stats(bins: ArrayView2<f64>) -> Array1<f64> {
    let top = bins.ncols() - 2;
    bins.index_axis(Axis(1), top).to_owned()
}
