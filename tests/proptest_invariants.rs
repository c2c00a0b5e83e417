use ndarray::Array2;
use pade_rust::analysis::run_analysis;
use pade_rust::conf::{bin_index, bins_uniform, confidence_scores, cumulative_counts};
use pade_rust::layout::{Layout, LayoutError};
use pade_rust::sampling::{SamplingConfig, SamplingMode};
use pade_rust::stat::{FTest, StatName, Statistic};
use pade_rust::Settings;
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use std::collections::{BTreeMap, BTreeSet};

const MIN_PROPTEST_CASES: u32 = 128;
const NUM_COLUMNS: usize = 12;
const UNASSIGNED: usize = 3;

fn proptest_cases() -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .map(|parsed| parsed.max(MIN_PROPTEST_CASES))
        .unwrap_or(MIN_PROPTEST_CASES)
}

fn layout_from_labels(labels: &[usize]) -> Option<Layout> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (j, &label) in labels.iter().enumerate() {
        if label != UNASSIGNED {
            groups.entry(label).or_default().push(j);
        }
    }
    if groups.is_empty() {
        return None;
    }
    Layout::new(groups.into_values().collect()).ok()
}

fn group_set(result: Result<Layout, LayoutError>) -> Option<BTreeSet<BTreeSet<usize>>> {
    result
        .ok()
        .map(|l| l.groups().iter().map(|g| g.iter().copied().collect()).collect())
}

fn two_condition_layouts() -> (Layout, Layout) {
    (
        Layout::new(vec![vec![0, 1, 2], vec![3, 4, 5]]).unwrap(),
        Layout::single(vec![0, 1, 2, 3, 4, 5]).unwrap(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: proptest_cases(),
        .. ProptestConfig::default()
    })]

    #[test]
    fn layout_intersection_is_associative_up_to_group_order(
        a in prop::collection::vec(0usize..4, NUM_COLUMNS),
        b in prop::collection::vec(0usize..4, NUM_COLUMNS),
        c in prop::collection::vec(0usize..4, NUM_COLUMNS),
    ) {
        let (Some(a), Some(b), Some(c)) =
            (layout_from_labels(&a), layout_from_labels(&b), layout_from_labels(&c))
        else {
            return Ok(());
        };
        let left = group_set(a.intersect(&b).and_then(|ab| ab.intersect(&c)));
        let right = group_set(b.intersect(&c).and_then(|bc| a.intersect(&bc)));
        prop_assert_eq!(left, right);
    }

    #[test]
    fn zero_tuning_param_matches_unshrunk_statistic(
        values in prop::collection::vec(-20.0f64..20.0, 18),
        alpha in 0.0f64..5.0,
    ) {
        let table = Array2::from_shape_vec((3, 6), values).unwrap();
        let (conditions, blocks) = two_condition_layouts();
        let plain = FTest::new(&conditions, &blocks, vec![]).unwrap();
        let tuned = FTest::new(&conditions, &blocks, vec![0.0, alpha]).unwrap();

        let plain = plain.compute(table.view()).unwrap();
        let tuned = tuned.compute(table.view()).unwrap();
        prop_assert_eq!(plain.row(0), tuned.row(0));
        for (p, t) in plain.row(0).iter().zip(tuned.row(1).iter()) {
            prop_assert!(*t <= *p);
        }
    }

    #[test]
    fn confidence_scores_never_decrease_along_bins(
        observed in prop::collection::vec(0u32..50, 11),
        null in prop::collection::vec(0.0f64..50.0, 11),
    ) {
        let unperm = Array2::from_shape_vec((1, 11), observed.iter().map(|&c| c as f64).collect()).unwrap();
        let perm = Array2::from_shape_vec((1, 11), null).unwrap();
        let scores = confidence_scores(unperm.view(), perm.view(), 50).unwrap();
        for i in 1..scores.ncols() {
            prop_assert!(scores[[0, i]] >= scores[[0, i - 1]]);
        }
    }

    #[test]
    fn every_statistic_lands_in_a_bin_that_contains_it(
        stats in prop::collection::vec(0.0f64..100.0, 1..40),
        num_bins in 1usize..20,
    ) {
        let n = stats.len();
        let stats = Array2::from_shape_vec((1, n), stats).unwrap();
        let bins = bins_uniform(num_bins, stats.view()).unwrap();
        let edges = bins.row(0);
        for &v in stats.row(0).iter() {
            let b = bin_index(edges, v);
            prop_assert!(b < num_bins + 1);
            prop_assert!(edges[b] <= v);
            prop_assert!(v < edges[b + 1] || (v == edges[num_bins] && b == num_bins - 1));
        }

        let counts = cumulative_counts(stats.view(), bins.view()).unwrap();
        prop_assert_eq!(counts[[0, 0]], n as u64);
        for i in 1..counts.ncols() {
            prop_assert!(counts[[0, i]] <= counts[[0, i - 1]]);
        }
    }

    #[test]
    fn same_inputs_and_seed_give_identical_results(
        values in prop::collection::vec(0.0f64..10.0, 24),
        seed in any::<u64>(),
    ) {
        let table = Array2::from_shape_vec((4, 6), values).unwrap();
        let (conditions, blocks) = two_condition_layouts();
        let settings = Settings {
            stat: StatName::FTest,
            tuning_params: vec![0.0, 0.5],
            num_bins: 8,
            sampling: SamplingConfig {
                mode: SamplingMode::Bootstrap,
                max_draws: 16,
                seed,
                ..SamplingConfig::default()
            },
            ..Settings::default()
        };
        let first = run_analysis(table.view(), &conditions, &blocks, &settings).unwrap();
        let second = run_analysis(table.view(), &conditions, &blocks, &settings).unwrap();
        prop_assert_eq!(first, second);
    }
}
