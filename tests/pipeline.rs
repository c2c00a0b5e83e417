use approx::assert_abs_diff_eq;
use ndarray::{array, Array2};
use pade_rust::analysis::{equalize_means, run_analysis, run_analysis_with_indexes};
use pade_rust::io::{
    layout_for_factors, load_results, load_sample_indexes, load_sample_sheet, load_table,
    save_results, save_sample_indexes,
};
use pade_rust::layout::Layout;
use pade_rust::sampling::{SamplingConfig, SamplingMode};
use pade_rust::stat::StatName;
use pade_rust::Settings;
use std::collections::HashSet;
use std::fs;
use tempfile::tempdir;

const TABLE: &str = "gene\tc1\tc2\tc3\tt1\tt2\tt3\n\
                     up\t1.0\t1.2\t0.9\t8.0\t8.4\t7.9\n\
                     down\t9.0\t9.5\t9.1\t1.0\t1.1\t0.8\n\
                     flat\t5.0\t5.1\t4.9\t5.0\t5.1\t4.9\n\
                     noisy\t2.0\t7.0\t4.0\t3.0\t6.0\t5.0\n";

const SHEET: &str = "sample\ttreatment\tbatch\n\
                     c1\tcontrol\tx\n\
                     c2\tcontrol\ty\n\
                     c3\tcontrol\tz\n\
                     t1\ttreated\tx\n\
                     t2\ttreated\ty\n\
                     t3\ttreated\tz\n";

fn names(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

fn settings() -> Settings {
    Settings {
        stat: StatName::FTest,
        tuning_params: vec![0.01, 0.5, 2.0],
        num_bins: 20,
        ..Settings::default()
    }
}

#[test]
fn test_ftest_scenario_statistics() {
    let table = array![[1.0, 2.0, 3.0, 6.0], [2.0, 1.0, 1.0, 1.0], [3.0, 1.0, 10.0, 4.0]];
    let conditions = Layout::new(vec![vec![0, 1], vec![2, 3]]).unwrap();
    let blocks = Layout::single(vec![0, 1, 2, 3]).unwrap();
    let s = Settings {
        tuning_params: vec![],
        ..settings()
    };
    let res = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
    assert_eq!(res.tuning_params, vec![0.0]);
    assert_abs_diff_eq!(res.raw_stats[[0, 0]], 3.6, epsilon = 1e-9);
    assert_abs_diff_eq!(res.raw_stats[[0, 1]], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(res.raw_stats[[0, 2]], 2.5, epsilon = 1e-9);
    assert_eq!(res.sample_indexes.num_draws(), 6);
}

#[test]
fn test_end_to_end_from_files_and_replay() {
    let dir = tempdir().unwrap();
    let table_path = dir.path().join("table.tsv");
    let sheet_path = dir.path().join("sheet.tsv");
    fs::write(&table_path, TABLE).unwrap();
    fs::write(&sheet_path, SHEET).unwrap();

    let input = load_table(&table_path).unwrap();
    let sheet = load_sample_sheet(&sheet_path).unwrap();
    let (conditions, labels) =
        layout_for_factors(&sheet, &input.sample_names, &names(&["treatment"])).unwrap();
    let (blocks, _) = layout_for_factors(&sheet, &input.sample_names, &[]).unwrap();
    assert_eq!(labels, names(&["treatment=control", "treatment=treated"]));

    let res = run_analysis(input.table.view(), &conditions, &blocks, &settings()).unwrap();
    // C(6, 3) orderings fit under the default draw limit.
    assert_eq!(res.sample_indexes.num_draws(), 20);

    // The clearly changed features outrank the flat one under every tuning param.
    for p in 0..3 {
        let order = res.order_by_score.row(p).to_vec();
        let flat_rank = order.iter().position(|&i| i == 2).unwrap();
        let up_rank = order.iter().position(|&i| i == 0).unwrap();
        assert!(up_rank < flat_rank);
    }
    assert_eq!(res.order_by_fold_change.row(1)[0], 0);

    let idx_path = dir.path().join("draws.txt");
    save_sample_indexes(&idx_path, &res.sample_indexes).unwrap();
    let indexes = load_sample_indexes(&idx_path, input.table.ncols()).unwrap();
    let replay =
        run_analysis_with_indexes(input.table.view(), &conditions, &blocks, &settings(), indexes)
            .unwrap();
    assert_eq!(res, replay);

    let bin_path = dir.path().join("results.bin");
    save_results(&bin_path, &res).unwrap();
    assert_eq!(load_results(&bin_path).unwrap(), res);
}

#[test]
fn test_run_is_idempotent_with_random_draws() {
    let table = Array2::from_shape_fn((6, 10), |(i, j)| ((i * 7 + j * 3) % 11) as f64 + j as f64);
    let conditions = Layout::new(vec![(0..5).collect(), (5..10).collect()]).unwrap();
    let blocks = Layout::single((0..10).collect()).unwrap();
    let s = Settings {
        sampling: SamplingConfig {
            mode: SamplingMode::Permutation,
            max_draws: 30,
            seed: 11,
            ..SamplingConfig::default()
        },
        ..settings()
    };
    let first = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
    let second = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
    assert_eq!(first.sample_indexes.num_draws(), 30);
    assert_eq!(first, second);
}

#[test]
fn test_paired_design_with_blocks() {
    let dir = tempdir().unwrap();
    let table_path = dir.path().join("table.tsv");
    let sheet_path = dir.path().join("sheet.tsv");
    fs::write(&table_path, TABLE).unwrap();
    fs::write(&sheet_path, SHEET).unwrap();

    let input = load_table(&table_path).unwrap();
    let sheet = load_sample_sheet(&sheet_path).unwrap();
    let (conditions, _) =
        layout_for_factors(&sheet, &input.sample_names, &names(&["treatment"])).unwrap();
    let (blocks, _) = layout_for_factors(&sheet, &input.sample_names, &names(&["batch"])).unwrap();
    assert!(blocks.is_paired());

    let s = Settings {
        stat: StatName::PairedTTest,
        ..settings()
    };
    let res = run_analysis(input.table.view(), &conditions, &blocks, &s).unwrap();
    // Two choices per pair over three pairs.
    assert_eq!(res.sample_indexes.num_draws(), 8);

    let distinct: HashSet<Vec<usize>> = res
        .sample_indexes
        .view()
        .outer_iter()
        .map(|r| r.to_vec())
        .collect();
    assert_eq!(distinct.len(), 8);
}

#[test]
fn test_means_ratio_and_bootstrap() {
    let table = array![
        [1.0, 1.0, 1.0, 4.0, 4.0, 4.0],
        [2.0, 2.5, 2.0, 2.0, 2.5, 2.0],
        [6.0, 5.0, 7.0, 1.0, 2.0, 1.5]
    ];
    let conditions = Layout::new(vec![vec![0, 1, 2], vec![3, 4, 5]]).unwrap();
    let blocks = Layout::single((0..6).collect()).unwrap();
    let s = Settings {
        stat: StatName::MeansRatio,
        sampling: SamplingConfig {
            mode: SamplingMode::Bootstrap,
            max_draws: 50,
            ..SamplingConfig::default()
        },
        ..settings()
    };
    let res = run_analysis(table.view(), &conditions, &blocks, &s).unwrap();
    assert!(res.raw_stats.iter().all(|&r| r >= 1.0));
    assert_abs_diff_eq!(res.raw_stats[[0, 1]], 1.0, epsilon = 1e-12);
    for row in res.bin_to_score.outer_iter() {
        for w in row.to_vec().windows(2) {
            assert!(w[0] <= w[1]);
        }
    }
}

#[test]
fn test_equalized_table_has_no_condition_effect() {
    let table = array![[1.0, 1.2, 0.9, 8.0, 8.4, 7.9]];
    let conditions = Layout::new(vec![vec![0, 1, 2], vec![3, 4, 5]]).unwrap();
    let blocks = Layout::single((0..6).collect()).unwrap();
    let full = blocks.intersect(&conditions).unwrap();
    let equalized = equalize_means(table.view(), &full, None);

    let s = Settings {
        tuning_params: vec![],
        ..settings()
    };
    let res = run_analysis(equalized.view(), &conditions, &blocks, &s).unwrap();
    assert_abs_diff_eq!(res.raw_stats[[0, 0]], 0.0, epsilon = 1e-9);
}
