//! Module for the test statistics scored by the resampling engine.
//!
//! Every statistic implements [`Statistic`]: given a (features x samples)
//! table it returns a (tuning params x features) array. Layouts are fixed at
//! construction, so unsupported designs fail before any resampling starts.
use crate::layout::{group_means, rss, Layout, LayoutError};
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatError {
    #[error("{stat} needs at least {needed} sample columns, got {got}")]
    ShapeMismatch {
        stat: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("Feature {feature} has a negative shifted mean ({value}); the means ratio is undefined")]
    NegativeMean { feature: usize, value: f64 },
}

/// A statistic computed for every feature and every tuning parameter.
pub trait Statistic: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tuning parameters, one output row each. A statistic built without
    /// tuning parameters reports `[0.0]`: the unshrunk statistic.
    fn tuning_params(&self) -> &[f64];

    /// Smallest number of columns a table must have for this statistic.
    fn min_columns(&self) -> usize;

    /// Computes the statistic. Output shape is (tuning params, features).
    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError>;

    fn num_tuning_params(&self) -> usize {
        self.tuning_params().len()
    }
}

/// Names accepted for `--stat`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatName {
    #[default]
    FTest,
    TTest,
    PairedTTest,
    OneSampleTTest,
    MeansRatio,
}

impl std::str::FromStr for StatName {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "f" | "f-test" | "ftest" => Ok(StatName::FTest),
            "t" | "t-test" | "ttest" => Ok(StatName::TTest),
            "paired-t" | "paired" => Ok(StatName::PairedTTest),
            "one-sample-t" => Ok(StatName::OneSampleTTest),
            "means-ratio" | "mr" => Ok(StatName::MeansRatio),
            _ => Err("Unknown statistic. Use 'f', 't', 'paired-t', 'one-sample-t', or 'means-ratio'."),
        }
    }
}

impl std::fmt::Display for StatName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatName::FTest => "f",
            StatName::TTest => "t",
            StatName::PairedTTest => "paired-t",
            StatName::OneSampleTTest => "one-sample-t",
            StatName::MeansRatio => "means-ratio",
        };
        write!(f, "{}", name)
    }
}

/// Builds the statistic named by `name` for the given layouts.
///
/// This is where unsupported layouts are rejected.
pub fn build_statistic(
    name: StatName,
    condition_layout: &Layout,
    block_layout: &Layout,
    tuning_params: &[f64],
    symmetric: bool,
) -> Result<Box<dyn Statistic>, LayoutError> {
    let alphas = tuning_params.to_vec();
    let stat: Box<dyn Statistic> = match name {
        StatName::FTest => Box::new(FTest::new(condition_layout, block_layout, alphas)?),
        StatName::TTest => Box::new(TwoSampleTTest::new(condition_layout, alphas)?),
        StatName::PairedTTest => Box::new(OneSampleDifferenceTTest::new(
            condition_layout,
            block_layout,
            alphas,
        )?),
        StatName::OneSampleTTest => {
            Box::new(OneSampleTTest::new(alphas).with_columns(condition_layout.columns()))
        }
        StatName::MeansRatio => Box::new(MeansRatio::new(
            condition_layout,
            block_layout,
            alphas,
            symmetric,
        )?),
    };
    log::debug!(
        "Built statistic '{}' with {} tuning params",
        stat.name(),
        stat.num_tuning_params()
    );
    Ok(stat)
}

fn effective_alphas(alphas: Vec<f64>) -> Vec<f64> {
    if alphas.is_empty() {
        vec![0.0]
    } else {
        alphas
    }
}

fn check_columns(stat: &'static str, needed: usize, data: &ArrayView2<f64>) -> Result<(), StatError> {
    if data.ncols() < needed {
        return Err(StatError::ShapeMismatch {
            stat,
            needed,
            got: data.ncols(),
        });
    }
    Ok(())
}

/// Division that never yields NaN: 0/0 is 0 and x/0 is a signed infinity.
#[inline]
pub(crate) fn guarded_ratio(numer: f64, denom: f64) -> f64 {
    if denom == 0.0 {
        if numer == 0.0 {
            0.0
        } else {
            f64::INFINITY.copysign(numer)
        }
    } else {
        numer / denom
    }
}

/// F-test comparing a full (block x condition) model against the reduced
/// (block only) model. Tuning parameters are added to the denominator.
#[derive(Debug, Clone)]
pub struct FTest {
    layout_full: Layout,
    layout_reduced: Layout,
    alphas: Vec<f64>,
    min_columns: usize,
}

impl FTest {
    pub fn new(
        condition_layout: &Layout,
        block_layout: &Layout,
        alphas: Vec<f64>,
    ) -> Result<Self, LayoutError> {
        let layout_full = block_layout.intersect(condition_layout)?;
        layout_full.validate_min_group_size(2)?;

        // The reduced model only sees samples that have a condition.
        let layout_reduced = block_layout.intersect(&Layout::single(layout_full.columns())?)?;

        if layout_full.len() <= layout_reduced.len() {
            return Err(LayoutError::InsufficientConditions(format!(
                "the full layout has {} groups and the reduced layout has {}; \
                 an F-test needs more groups in the full model",
                layout_full.len(),
                layout_reduced.len()
            )));
        }

        let min_columns = layout_full.max_index().map_or(0, |m| m + 1);
        Ok(FTest {
            layout_full,
            layout_reduced,
            alphas: effective_alphas(alphas),
            min_columns,
        })
    }

    pub fn layout_full(&self) -> &Layout {
        &self.layout_full
    }
}

impl Statistic for FTest {
    fn name(&self) -> &'static str {
        "F-test"
    }

    fn tuning_params(&self) -> &[f64] {
        &self.alphas
    }

    fn min_columns(&self) -> usize {
        self.min_columns
    }

    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
        check_columns(self.name(), self.min_columns, &data)?;

        let p_red = self.layout_reduced.len() as f64;
        let p_full = self.layout_full.len() as f64;
        let n = self.layout_reduced.num_columns() as f64;

        let rss_full = rss(data, &self.layout_full);
        let rss_red = rss(data, &self.layout_reduced);

        let mut res = Array2::zeros((self.alphas.len(), data.nrows()));
        for i in 0..data.nrows() {
            // Clamp tiny negative differences from rounding.
            let numer = ((rss_red[i] - rss_full[i]) / (p_full - p_red)).max(0.0);
            let denom = rss_full[i] / (n - p_full);
            for (a, alpha) in self.alphas.iter().enumerate() {
                res[[a, i]] = guarded_ratio(numer, denom + alpha);
            }
        }
        Ok(res)
    }
}

/// One-sample t-test of the row mean against zero, using the population
/// standard deviation. Returns absolute values.
#[derive(Debug, Clone)]
pub struct OneSampleTTest {
    alphas: Vec<f64>,
    columns: Option<Vec<usize>>,
}

impl OneSampleTTest {
    pub fn new(alphas: Vec<f64>) -> Self {
        OneSampleTTest {
            alphas: effective_alphas(alphas),
            columns: None,
        }
    }

    /// Restricts the test to the given columns instead of the whole row.
    pub fn with_columns(mut self, columns: Vec<usize>) -> Self {
        self.columns = Some(columns);
        self
    }

    fn compute_values(&self, values: &[f64], out: &mut [f64]) {
        let n = values.len() as f64;
        let mean = values.iter().mean();
        let sd = values.iter().population_std_dev();
        let se = sd / n.sqrt();
        for (o, alpha) in out.iter_mut().zip(&self.alphas) {
            *o = guarded_ratio(mean, se + alpha).abs();
        }
    }
}

impl Statistic for OneSampleTTest {
    fn name(&self) -> &'static str {
        "one-sample t-test"
    }

    fn tuning_params(&self) -> &[f64] {
        &self.alphas
    }

    fn min_columns(&self) -> usize {
        match &self.columns {
            Some(cols) => cols.iter().copied().fold(0, |m, c| m.max(c + 1)),
            None => 1,
        }
    }

    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
        check_columns(self.name(), self.min_columns(), &data)?;

        let mut res = Array2::zeros((self.alphas.len(), data.nrows()));
        let mut out = vec![0.0; self.alphas.len()];
        for (i, row) in data.outer_iter().enumerate() {
            let values: Vec<f64> = match &self.columns {
                Some(cols) => cols.iter().map(|&j| row[j]).collect(),
                None => row.to_vec(),
            };
            self.compute_values(&values, &mut out);
            for (a, v) in out.iter().enumerate() {
                res[[a, i]] = *v;
            }
        }
        Ok(res)
    }
}

/// Two-sample t-test between the two groups of a condition layout.
///
/// Uses the pooled sample standard deviation; tuning parameters are added to
/// it before scaling. Returns absolute values.
#[derive(Debug, Clone)]
pub struct TwoSampleTTest {
    condition_layout: Layout,
    alphas: Vec<f64>,
    min_columns: usize,
}

impl TwoSampleTTest {
    pub fn new(condition_layout: &Layout, alphas: Vec<f64>) -> Result<Self, LayoutError> {
        if condition_layout.len() != 2 {
            return Err(LayoutError::InsufficientConditions(format!(
                "a two-sample t-test needs exactly two conditions, got {}",
                condition_layout.len()
            )));
        }
        condition_layout.validate_min_group_size(2)?;
        Ok(TwoSampleTTest {
            condition_layout: condition_layout.clone(),
            alphas: effective_alphas(alphas),
            min_columns: condition_layout.max_index().map_or(0, |m| m + 1),
        })
    }
}

impl Statistic for TwoSampleTTest {
    fn name(&self) -> &'static str {
        "t-test"
    }

    fn tuning_params(&self) -> &[f64] {
        &self.alphas
    }

    fn min_columns(&self) -> usize {
        self.min_columns
    }

    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
        check_columns(self.name(), self.min_columns, &data)?;

        let g0 = self.condition_layout.group(0);
        let g1 = self.condition_layout.group(1);
        let n0 = g0.len() as f64;
        let n1 = g1.len() as f64;

        let mut res = Array2::zeros((self.alphas.len(), data.nrows()));
        for (i, row) in data.outer_iter().enumerate() {
            let v0: Vec<f64> = g0.iter().map(|&j| row[j]).collect();
            let v1: Vec<f64> = g1.iter().map(|&j| row[j]).collect();

            let m0 = v0.iter().mean();
            let m1 = v1.iter().mean();
            let var0 = v0.iter().variance();
            let var1 = v1.iter().variance();

            let s = (((n0 - 1.0) * var0 + (n1 - 1.0) * var1) / (n0 + n1 - 2.0)).sqrt();
            let numer = (m0 - m1) * (n0 * n1).sqrt();
            for (a, alpha) in self.alphas.iter().enumerate() {
                let denom = (alpha + s) * (n0 + n1).sqrt();
                res[[a, i]] = guarded_ratio(numer, denom).abs();
            }
        }
        Ok(res)
    }
}

/// Paired t-test: a one-sample t-test on the within-pair differences
/// (condition 0 minus condition 1).
#[derive(Debug, Clone)]
pub struct OneSampleDifferenceTTest {
    idxs_a: Vec<usize>,
    idxs_b: Vec<usize>,
    child: OneSampleTTest,
    min_columns: usize,
}

impl OneSampleDifferenceTTest {
    pub fn new(
        condition_layout: &Layout,
        block_layout: &Layout,
        alphas: Vec<f64>,
    ) -> Result<Self, LayoutError> {
        if !block_layout.is_paired() {
            return Err(LayoutError::NotPaired(format!(
                "every block must hold exactly two samples, got block sizes {:?}",
                block_layout.group_sizes()
            )));
        }
        if condition_layout.len() != 2 {
            return Err(LayoutError::InsufficientConditions(format!(
                "a paired t-test needs exactly two conditions, got {}",
                condition_layout.len()
            )));
        }

        let c0 = condition_layout.group(0);
        let c1 = condition_layout.group(1);
        let mut idxs_a = Vec::with_capacity(block_layout.len());
        let mut idxs_b = Vec::with_capacity(block_layout.len());

        for pair in block_layout.groups() {
            let a = pair.iter().copied().find(|j| c0.contains(j));
            let b = pair.iter().copied().find(|j| c1.contains(j));
            match (a, b) {
                (Some(a), Some(b)) => {
                    idxs_a.push(a);
                    idxs_b.push(b);
                }
                _ => {
                    return Err(LayoutError::NotPaired(format!(
                        "block {:?} does not hold one sample of each condition",
                        pair
                    )))
                }
            }
        }

        let min_columns = block_layout.max_index().map_or(0, |m| m + 1);
        Ok(OneSampleDifferenceTTest {
            idxs_a,
            idxs_b,
            child: OneSampleTTest::new(alphas),
            min_columns,
        })
    }
}

impl Statistic for OneSampleDifferenceTTest {
    fn name(&self) -> &'static str {
        "paired t-test"
    }

    fn tuning_params(&self) -> &[f64] {
        self.child.tuning_params()
    }

    fn min_columns(&self) -> usize {
        self.min_columns
    }

    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
        check_columns(self.name(), self.min_columns, &data)?;
        let diffs = data.select(Axis(1), &self.idxs_a) - data.select(Axis(1), &self.idxs_b);
        self.child.compute(diffs.view())
    }
}

/// Ratio of the two condition means, combined across blocks with a
/// geometric mean. With `symmetric` the larger of the ratio and its inverse
/// is reported, so the order of the conditions does not matter.
#[derive(Debug, Clone)]
pub struct MeansRatio {
    c0_blocks: Layout,
    c1_blocks: Layout,
    alphas: Vec<f64>,
    symmetric: bool,
    min_columns: usize,
}

impl MeansRatio {
    pub fn new(
        condition_layout: &Layout,
        block_layout: &Layout,
        alphas: Vec<f64>,
        symmetric: bool,
    ) -> Result<Self, LayoutError> {
        if condition_layout.len() != 2 {
            return Err(LayoutError::InsufficientConditions(format!(
                "the means ratio needs exactly two conditions, got {} conditions and {} blocks",
                condition_layout.len(),
                block_layout.len()
            )));
        }

        let mut c0 = Vec::with_capacity(block_layout.len());
        let mut c1 = Vec::with_capacity(block_layout.len());
        for block in block_layout.groups() {
            let a: Vec<usize> = block
                .iter()
                .copied()
                .filter(|j| condition_layout.group(0).contains(j))
                .collect();
            let b: Vec<usize> = block
                .iter()
                .copied()
                .filter(|j| condition_layout.group(1).contains(j))
                .collect();
            if a.is_empty() || b.is_empty() {
                return Err(LayoutError::InsufficientConditions(format!(
                    "block {:?} does not contain both conditions",
                    block
                )));
            }
            c0.push(a);
            c1.push(b);
        }

        let c0_blocks = Layout::new(c0)?;
        let c1_blocks = Layout::new(c1)?;
        let min_columns = block_layout.max_index().map_or(0, |m| m + 1);
        Ok(MeansRatio {
            c0_blocks,
            c1_blocks,
            alphas: effective_alphas(alphas),
            symmetric,
            min_columns,
        })
    }
}

impl Statistic for MeansRatio {
    fn name(&self) -> &'static str {
        "means ratio"
    }

    fn tuning_params(&self) -> &[f64] {
        &self.alphas
    }

    fn min_columns(&self) -> usize {
        self.min_columns
    }

    fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
        check_columns(self.name(), self.min_columns, &data)?;

        let means0 = group_means(data, &self.c0_blocks);
        let means1 = group_means(data, &self.c1_blocks);
        let num_blocks = self.c0_blocks.len() as f64;

        let mut res = Array2::zeros((self.alphas.len(), data.nrows()));
        for i in 0..data.nrows() {
            for (a, alpha) in self.alphas.iter().enumerate() {
                let mut log_sum = 0.0;
                for b in 0..self.c0_blocks.len() {
                    let x = means0[[i, b]] + alpha;
                    let y = means1[[i, b]] + alpha;
                    if x < 0.0 || y < 0.0 {
                        return Err(StatError::NegativeMean {
                            feature: i,
                            value: x.min(y),
                        });
                    }
                    // Two empty means carry no evidence either way.
                    let ratio = if x == 0.0 && y == 0.0 { 1.0 } else { guarded_ratio(x, y) };
                    log_sum += ratio.ln();
                }

                let mut ratio = (log_sum / num_blocks).exp();
                // A zero and an infinite block ratio cancel out.
                if ratio.is_nan() {
                    ratio = 1.0;
                }
                if self.symmetric {
                    ratio = ratio.max(1.0 / ratio);
                }
                res[[a, i]] = ratio;
            }
        }
        Ok(res)
    }
}
