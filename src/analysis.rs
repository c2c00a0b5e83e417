//! Module for running the full analysis: observed statistics, the null
//! distribution over all draws, confidence scores and orderings.
use crate::conf::{
    assign_scores_to_features, bins_uniform, confidence_scores, cumulative_counts,
    cumulative_hist, ConfError,
};
use crate::layout::{fitted_values, group_means, residuals, Layout, LayoutError};
use crate::ordering::{
    order_by_effect, order_by_score, summary_by_conf_level, MIN_SUMMARY_STEP_SIZE,
};
use crate::sampling::{new_sample_indexes, SampleFrom, SampleIndexes, SamplingError, SamplingMode};
use crate::stat::{build_statistic, guarded_ratio, StatError, StatName, Statistic};
use crate::{AnalysisResults, Settings};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),
    #[error("Statistic error: {0}")]
    Stat(#[from] StatError),
    #[error("Confidence error: {0}")]
    Conf(#[from] ConfError),
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

/// Where the resampled values of each draw come from.
#[derive(Debug, Clone)]
pub enum NullSource {
    /// Select the table's own columns.
    Raw,
    /// Add resampled residuals of the full model to the reduced model's
    /// prediction.
    Residuals {
        prediction: Array2<f64>,
        residuals: Array2<f64>,
    },
}

impl NullSource {
    /// Builds the residual source: residuals under block x condition,
    /// prediction under blocks alone. Columns outside the layout keep
    /// their values.
    pub fn residuals(
        table: ArrayView2<f64>,
        condition_layout: &Layout,
        block_layout: &Layout,
    ) -> Result<Self, LayoutError> {
        let full = block_layout.intersect(condition_layout)?;
        let columns = full.columns();
        let reduced = block_layout.intersect(&Layout::single(columns.clone())?)?;

        let resid = residuals(table, &full);
        let mut prediction = table.to_owned();
        let fitted = fitted_values(table, &reduced);
        for &j in &columns {
            prediction.column_mut(j).assign(&fitted.column(j));
        }
        Ok(NullSource::Residuals {
            prediction,
            residuals: resid,
        })
    }

    /// The table as seen under one draw.
    pub fn resample(&self, table: ArrayView2<f64>, draw: ArrayView1<usize>) -> Array2<f64> {
        let cols = draw.to_vec();
        match self {
            NullSource::Raw => table.select(Axis(1), &cols),
            NullSource::Residuals {
                prediction,
                residuals,
            } => prediction + &residuals.select(Axis(1), &cols),
        }
    }
}

/// Checks the settings before any work is done.
pub fn validate_settings(settings: &Settings) -> Result<(), AnalysisError> {
    if settings.num_bins == 0 {
        return Err(ConfError::InvalidBinCount(0).into());
    }
    if let Some(bad) = settings
        .tuning_params
        .iter()
        .find(|a| !a.is_finite() || **a < 0.0)
    {
        return Err(AnalysisError::InvalidSettings(format!(
            "tuning params must be finite and non-negative, got {}",
            bad
        )));
    }
    if !(0.0..1.0).contains(&settings.summary_min_conf) {
        return Err(AnalysisError::InvalidSettings(format!(
            "summary minimum confidence must be in [0, 1), got {}",
            settings.summary_min_conf
        )));
    }
    if !(settings.summary_step_size.is_finite()
        && settings.summary_step_size >= MIN_SUMMARY_STEP_SIZE)
    {
        return Err(AnalysisError::InvalidSettings(format!(
            "summary step size must be at least {}, got {}",
            MIN_SUMMARY_STEP_SIZE, settings.summary_step_size
        )));
    }
    if settings.sampling.max_draws == 0 {
        return Err(SamplingError::NoDraws.into());
    }
    match (settings.sampling.mode, settings.sampling.sample_from) {
        // Residual tables can have negative group means even for positive data.
        (SamplingMode::Bootstrap, SampleFrom::Residuals)
            if settings.stat == StatName::MeansRatio =>
        {
            return Err(AnalysisError::InvalidSettings(
                "the means ratio needs positive means; bootstrap from raw values instead of residuals"
                    .to_string(),
            ));
        }
        (SamplingMode::Permutation, SampleFrom::Residuals) => {
            return Err(AnalysisError::InvalidSettings(
                "sampling from residuals is only supported with bootstrap sampling".to_string(),
            ));
        }
        _ => {}
    }
    Ok(())
}

/// Mean cumulative histogram of the statistic over every draw.
///
/// Counts are summed as integers on each worker and merged by addition, so
/// the result does not depend on scheduling.
pub fn compute_mean_perm_count(
    table: ArrayView2<f64>,
    stat: &dyn Statistic,
    bins: ArrayView2<f64>,
    indexes: &SampleIndexes,
    source: &NullSource,
) -> Result<Array2<f64>, AnalysisError> {
    let num_draws = indexes.num_draws();
    if num_draws == 0 {
        return Err(SamplingError::NoDraws.into());
    }
    let shape = (bins.nrows(), bins.ncols() - 1);

    log::info!("Computing null distribution over {} draws", num_draws);

    let sum = (0..num_draws)
        .into_par_iter()
        .try_fold(
            || Array2::<u64>::zeros(shape),
            |mut acc, r| -> Result<Array2<u64>, AnalysisError> {
                let data = source.resample(table, indexes.draw(r));
                let stats = stat.compute(data.view())?;
                acc += &cumulative_counts(stats.view(), bins)?;
                log::trace!("Draw {} done", r);
                Ok(acc)
            },
        )
        .try_reduce(|| Array2::<u64>::zeros(shape), |a, b| Ok(a + b))?;

    Ok(sum.mapv(|c| c as f64 / num_draws as f64))
}

/// Runs the whole analysis, generating draws from `settings.sampling`.
pub fn run_analysis(
    table: ArrayView2<f64>,
    condition_layout: &Layout,
    block_layout: &Layout,
    settings: &Settings,
) -> Result<AnalysisResults, AnalysisError> {
    validate_settings(settings)?;
    condition_layout.check_bounds(table.ncols())?;
    block_layout.check_bounds(table.ncols())?;
    let indexes = new_sample_indexes(
        condition_layout,
        block_layout,
        table.ncols(),
        &settings.sampling,
    )?;
    run_analysis_with_indexes(table, condition_layout, block_layout, settings, indexes)
}

/// Runs the whole analysis with the given draws. Identical inputs and
/// draws give bit-identical results.
pub fn run_analysis_with_indexes(
    table: ArrayView2<f64>,
    condition_layout: &Layout,
    block_layout: &Layout,
    settings: &Settings,
    indexes: SampleIndexes,
) -> Result<AnalysisResults, AnalysisError> {
    validate_settings(settings)?;
    condition_layout.check_bounds(table.ncols())?;
    block_layout.check_bounds(table.ncols())?;
    if indexes.num_samples() != table.ncols() {
        return Err(SamplingError::WrongWidth {
            expected: table.ncols(),
            got: indexes.num_samples(),
        }
        .into());
    }

    let (num_features, num_samples) = table.dim();
    log::info!(
        "Analyzing {} features x {} samples with the '{}' statistic",
        num_features,
        num_samples,
        settings.stat
    );
    log::info!("Condition layout: {:?}", condition_layout.groups());
    log::info!("Block layout: {:?}", block_layout.groups());

    let tuning_params = settings.effective_tuning_params();
    let stat = build_statistic(
        settings.stat,
        condition_layout,
        block_layout,
        &tuning_params,
        settings.symmetric,
    )?;

    log::info!("Computing raw statistics");
    let raw_stats = stat.compute(table)?;

    log::info!("Choosing {} bins", settings.num_bins);
    let bins = bins_uniform(settings.num_bins, raw_stats.view())?;
    let bin_to_unperm_count = cumulative_hist(raw_stats.view(), bins.view())?;

    let source = match (settings.sampling.mode, settings.sampling.sample_from) {
        (SamplingMode::Bootstrap, SampleFrom::Residuals) => {
            NullSource::residuals(table, condition_layout, block_layout)?
        }
        (_, SampleFrom::Raw) | (SamplingMode::Permutation, _) => NullSource::Raw,
    };
    let bin_to_mean_perm_count =
        compute_mean_perm_count(table, stat.as_ref(), bins.view(), &indexes, &source)?;

    log::info!("Computing confidence scores");
    let bin_to_score = confidence_scores(
        bin_to_unperm_count.view(),
        bin_to_mean_perm_count.view(),
        num_features,
    )?;
    let feature_to_score =
        assign_scores_to_features(raw_stats.view(), bins.view(), bin_to_score.view())?;

    log::info!("Computing orderings of features");
    let means = group_means(table, condition_layout);
    let fold_change = fold_change(table, condition_layout);
    let order_by_score = order_by_score(feature_to_score.view());
    let order_by_fold_change = order_by_effect(fold_change.view());

    log::info!("Summarizing counts by confidence level");
    let summary = summary_by_conf_level(
        feature_to_score.view(),
        settings.summary_min_conf,
        settings.summary_step_size,
    );

    Ok(AnalysisResults {
        settings: settings.clone(),
        tuning_params,
        raw_stats,
        bins,
        bin_to_unperm_count,
        bin_to_mean_perm_count,
        bin_to_score,
        feature_to_score,
        sample_indexes: indexes,
        group_means: means,
        fold_change,
        order_by_score,
        order_by_fold_change,
        summary,
    })
}

/// Shifts the selected features so every group of `layout` has mean 0.
/// Features outside `feature_mask` and columns outside the layout are left
/// unchanged. `None` selects every feature.
pub fn equalize_means(
    table: ArrayView2<f64>,
    layout: &Layout,
    feature_mask: Option<&[bool]>,
) -> Array2<f64> {
    let fitted = fitted_values(table, layout);
    let mut res = table.to_owned();
    let columns = layout.columns();
    for (i, mut row) in res.outer_iter_mut().enumerate() {
        let selected = feature_mask.map_or(true, |m| m.get(i).copied().unwrap_or(false));
        if !selected {
            continue;
        }
        for &j in &columns {
            row[j] -= fitted[[i, j]];
        }
    }
    res
}

/// Each condition's mean divided by the first condition's mean,
/// shape `(features, conditions)`.
pub fn fold_change(table: ArrayView2<f64>, condition_layout: &Layout) -> Array2<f64> {
    let means = group_means(table, condition_layout);
    let mut res = Array2::zeros(means.raw_dim());
    for (i, row) in means.outer_iter().enumerate() {
        for (c, &m) in row.iter().enumerate() {
            res[[i, c]] = guarded_ratio(m, row[0]);
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::SamplingConfig;
    use crate::stat::{FTest, StatName};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn layout(groups: &[&[usize]]) -> Layout {
        Layout::new(groups.iter().map(|g| g.to_vec()).collect()).unwrap()
    }

    fn small_table() -> Array2<f64> {
        array![
            [1.0, 2.0, 3.0, 6.0],
            [2.0, 1.0, 1.0, 1.0],
            [3.0, 1.0, 10.0, 4.0],
            [1.0, 1.2, 9.0, 9.5],
            [5.0, 5.1, 4.9, 5.0]
        ]
    }

    fn settings() -> Settings {
        Settings {
            stat: StatName::FTest,
            tuning_params: vec![0.0, 1.0],
            num_bins: 10,
            ..Settings::default()
        }
    }

    #[test]
    fn test_identity_draw_reproduces_observed_counts() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let stat = FTest::new(&conditions, &blocks, vec![0.0]).unwrap();
        let raw = stat.compute(table.view()).unwrap();
        let bins = bins_uniform(10, raw.view()).unwrap();
        let unperm = cumulative_hist(raw.view(), bins.view()).unwrap();

        let indexes = SampleIndexes::new(array![[0, 1, 2, 3]], 4).unwrap();
        let mean = compute_mean_perm_count(
            table.view(),
            &stat,
            bins.view(),
            &indexes,
            &NullSource::Raw,
        )
        .unwrap();
        assert_eq!(mean, unperm);
    }

    #[test]
    fn test_run_analysis_shapes_and_monotonic_scores() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let res = run_analysis(table.view(), &conditions, &blocks, &settings()).unwrap();

        assert_eq!(res.sample_indexes.num_draws(), 6);
        assert_eq!(res.raw_stats.dim(), (2, 5));
        assert_eq!(res.bins.dim(), (2, 12));
        assert_eq!(res.bin_to_unperm_count.dim(), (2, 11));
        assert_eq!(res.bin_to_mean_perm_count.dim(), (2, 11));
        assert_eq!(res.feature_to_score.dim(), (2, 5));
        assert_eq!(res.order_by_fold_change.dim(), (2, 5));
        assert_abs_diff_eq!(res.raw_stats[[0, 0]], 3.6, epsilon = 1e-12);

        for row in res.bin_to_score.outer_iter() {
            for w in row.to_vec().windows(2) {
                assert!(w[0] <= w[1]);
            }
        }
        assert!(res.feature_to_score.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_replay_is_bit_identical() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let mut s = settings();
        s.sampling = SamplingConfig {
            mode: SamplingMode::Bootstrap,
            max_draws: 40,
            ..SamplingConfig::default()
        };
        let first = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
        let replay = run_analysis_with_indexes(
            table.view(),
            &conditions,
            &blocks,
            &s,
            first.sample_indexes.clone(),
        )
        .unwrap();
        assert_eq!(first, replay);
    }

    #[test]
    fn test_residual_bootstrap_runs() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let mut s = settings();
        s.sampling = SamplingConfig {
            mode: SamplingMode::Bootstrap,
            sample_from: SampleFrom::Residuals,
            max_draws: 25,
            seed: 3,
        };
        let res = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
        assert_eq!(res.sample_indexes.num_draws(), 25);
        assert!(res.bin_to_mean_perm_count.iter().all(|c| (0.0..=5.0).contains(c)));
    }

    #[test]
    fn test_residual_source_identity_draw_is_reduced_fit_plus_residuals() {
        let table = array![[1.0, 2.0, 3.0, 6.0, 100.0]];
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let source = NullSource::residuals(table.view(), &conditions, &blocks).unwrap();
        let data = source.resample(table.view(), array![0, 1, 2, 3, 4].view());
        // Grand mean 3 plus the within-condition residuals.
        assert_eq!(data, array![[2.5, 3.5, 1.5, 4.5, 100.0]]);
    }

    #[test]
    fn test_index_width_mismatch() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let indexes = SampleIndexes::new(array![[0, 1, 2, 3, 4]], 5).unwrap();
        let err = run_analysis_with_indexes(table.view(), &conditions, &blocks, &settings(), indexes);
        assert!(matches!(
            err,
            Err(AnalysisError::Sampling(SamplingError::WrongWidth { expected: 4, got: 5 }))
        ));
    }

    #[test]
    fn test_invalid_settings() {
        let mut s = settings();
        s.tuning_params = vec![-1.0];
        assert!(matches!(validate_settings(&s), Err(AnalysisError::InvalidSettings(_))));

        let mut s = settings();
        s.num_bins = 0;
        assert!(matches!(
            validate_settings(&s),
            Err(AnalysisError::Conf(ConfError::InvalidBinCount(0)))
        ));
    }

    /// F-test that refuses any draw moving the first sample.
    struct FailsOffIdentity(FTest);

    impl Statistic for FailsOffIdentity {
        fn name(&self) -> &'static str {
            "fails off identity"
        }

        fn tuning_params(&self) -> &[f64] {
            self.0.tuning_params()
        }

        fn min_columns(&self) -> usize {
            self.0.min_columns()
        }

        fn compute(&self, data: ArrayView2<f64>) -> Result<Array2<f64>, StatError> {
            if data[[0, 0]] != 1.0 {
                return Err(StatError::NegativeMean {
                    feature: 0,
                    value: -1.0,
                });
            }
            self.0.compute(data)
        }
    }

    #[test]
    fn test_failing_draw_aborts_null_distribution() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let stat = FailsOffIdentity(FTest::new(&conditions, &blocks, vec![0.0]).unwrap());
        let raw = stat.compute(table.view()).unwrap();
        let bins = bins_uniform(10, raw.view()).unwrap();

        let indexes =
            SampleIndexes::new(array![[0, 1, 2, 3], [0, 2, 1, 3], [1, 0, 2, 3], [0, 3, 2, 1]], 4)
                .unwrap();
        let res = compute_mean_perm_count(
            table.view(),
            &stat,
            bins.view(),
            &indexes,
            &NullSource::Raw,
        );
        assert!(matches!(
            res,
            Err(AnalysisError::Stat(StatError::NegativeMean { feature: 0, .. }))
        ));
    }

    #[test]
    fn test_failing_draw_aborts_run() {
        // Observed condition means are both 2, swapping samples makes one -1.
        let table = array![[5.0, -1.0, 5.0, -1.0]];
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let s = Settings {
            stat: StatName::MeansRatio,
            ..settings()
        };
        let identity = SampleIndexes::new(array![[0, 1, 2, 3]], 4).unwrap();
        assert!(run_analysis_with_indexes(table.view(), &conditions, &blocks, &s, identity).is_ok());

        let indexes = SampleIndexes::new(array![[0, 1, 2, 3], [1, 3, 0, 2]], 4).unwrap();
        assert!(matches!(
            run_analysis_with_indexes(table.view(), &conditions, &blocks, &s, indexes),
            Err(AnalysisError::Stat(StatError::NegativeMean { .. }))
        ));
    }

    #[test]
    fn test_means_ratio_rejects_residual_bootstrap_before_sampling() {
        let table = array![[0.1, 100.0, 1.0, 1.0], [2.0, 3.0, 4.0, 5.0]];
        let conditions = layout(&[&[0, 1], &[2, 3]]);
        let blocks = layout(&[&[0, 1, 2, 3]]);
        let mut s = Settings {
            stat: StatName::MeansRatio,
            ..settings()
        };
        s.sampling = SamplingConfig {
            mode: SamplingMode::Bootstrap,
            sample_from: SampleFrom::Residuals,
            max_draws: 50,
            seed: 42,
        };
        assert!(matches!(
            run_analysis(table.view(), &conditions, &blocks, &s),
            Err(AnalysisError::InvalidSettings(_))
        ));

        s.sampling.sample_from = SampleFrom::Raw;
        let res = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
        assert!(res.raw_stats.iter().all(|r| r.is_finite()));
    }

    #[test]
    fn test_residuals_need_bootstrap_sampling() {
        let mut s = settings();
        s.sampling.sample_from = SampleFrom::Residuals;
        assert_eq!(s.sampling.mode, SamplingMode::Permutation);
        assert!(matches!(validate_settings(&s), Err(AnalysisError::InvalidSettings(_))));

        s.sampling.mode = SamplingMode::Bootstrap;
        assert!(validate_settings(&s).is_ok());
    }

    #[test]
    fn test_summary_step_size_floor() {
        let mut s = settings();
        s.summary_step_size = 1e-12;
        assert!(matches!(validate_settings(&s), Err(AnalysisError::InvalidSettings(_))));

        s.summary_step_size = MIN_SUMMARY_STEP_SIZE;
        assert!(validate_settings(&s).is_ok());
    }

    #[test]
    fn test_layout_out_of_bounds() {
        let table = small_table();
        let conditions = layout(&[&[0, 1], &[2, 7]]);
        let blocks = layout(&[&[0, 1, 2, 7]]);
        assert!(matches!(
            run_analysis(table.view(), &conditions, &blocks, &settings()),
            Err(AnalysisError::Layout(LayoutError::IndexOutOfBounds { index: 7, .. }))
        ));
    }

    #[test]
    fn test_equalize_means() {
        let table = array![[1.0, 3.0, 10.0, 20.0, 7.0], [1.0, 3.0, 10.0, 20.0, 7.0]];
        let l = layout(&[&[0, 1], &[2, 3]]);
        let res = equalize_means(table.view(), &l, Some(&[true, false][..]));
        assert_eq!(res.row(0).to_vec(), vec![-1.0, 1.0, -5.0, 5.0, 7.0]);
        assert_eq!(res.row(1), table.row(1));
    }

    #[test]
    fn test_fold_change() {
        let table = array![[1.0, 3.0, 8.0, 8.0], [0.0, 0.0, 2.0, 2.0]];
        let fc = fold_change(table.view(), &layout(&[&[0, 1], &[2, 3]]));
        assert_eq!(fc, array![[1.0, 4.0], [0.0, f64::INFINITY]]);
    }
}
