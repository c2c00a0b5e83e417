//! Module for generating resampled column indexes (permutations and bootstrap draws).
//!
//! A draw is a full column mapping: resampled column `j` is original column
//! `draw[j]`. Only columns covered by the block x condition layout move;
//! every other column maps to itself.
use crate::layout::{Layout, LayoutError};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const DEFAULT_MAX_DRAWS: usize = 1000;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("No draws to work with (max_draws is 0 or the index matrix is empty)")]
    NoDraws,
    #[error("Draw {draw} refers to column {index}, but the table only has {num_samples} samples")]
    IndexOutOfBounds {
        draw: usize,
        index: usize,
        num_samples: usize,
    },
    #[error("Sample indexes have {got} columns, but the table has {expected} samples")]
    WrongWidth { expected: usize, got: usize },
    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingMode {
    #[default]
    Permutation,
    Bootstrap,
}

impl std::str::FromStr for SamplingMode {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permutation" | "perm" => Ok(SamplingMode::Permutation),
            "bootstrap" | "boot" => Ok(SamplingMode::Bootstrap),
            _ => Err("Invalid sampling mode. Use 'permutation' or 'bootstrap'."),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFrom {
    #[default]
    Raw,
    Residuals,
}

impl std::str::FromStr for SampleFrom {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(SampleFrom::Raw),
            "residuals" | "resid" => Ok(SampleFrom::Residuals),
            _ => Err("Invalid sample source. Use 'raw' or 'residuals'."),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SamplingConfig {
    pub mode: SamplingMode,
    pub max_draws: usize,
    pub sample_from: SampleFrom,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            mode: SamplingMode::default(),
            max_draws: DEFAULT_MAX_DRAWS,
            sample_from: SampleFrom::default(),
            seed: DEFAULT_SEED,
        }
    }
}

/// Validated matrix of draws, shape (num_draws, num_samples).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SampleIndexes {
    draws: Array2<usize>,
}

impl SampleIndexes {
    pub fn new(draws: Array2<usize>, num_samples: usize) -> Result<Self, SamplingError> {
        if draws.nrows() == 0 {
            return Err(SamplingError::NoDraws);
        }
        if draws.ncols() != num_samples {
            return Err(SamplingError::WrongWidth {
                expected: num_samples,
                got: draws.ncols(),
            });
        }
        for (r, row) in draws.outer_iter().enumerate() {
            if let Some(&index) = row.iter().find(|&&idx| idx >= num_samples) {
                return Err(SamplingError::IndexOutOfBounds {
                    draw: r,
                    index,
                    num_samples,
                });
            }
        }
        Ok(SampleIndexes { draws })
    }

    pub fn num_draws(&self) -> usize {
        self.draws.nrows()
    }

    pub fn num_samples(&self) -> usize {
        self.draws.ncols()
    }

    pub fn draw(&self, r: usize) -> ArrayView1<usize> {
        self.draws.index_axis(Axis(0), r)
    }

    pub fn view(&self) -> ArrayView2<usize> {
        self.draws.view()
    }
}

/// The columns of one block, in slot order, split into condition subgroups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSlots {
    pub slots: Vec<usize>,
    pub subgroup_sizes: Vec<usize>,
}

/// Splits every block into its condition subgroups. Blocks that hold no
/// conditioned sample are skipped.
pub fn block_slots(condition_layout: &Layout, block_layout: &Layout) -> Vec<BlockSlots> {
    let condition_sets: Vec<HashSet<usize>> = condition_layout
        .groups()
        .iter()
        .map(|g| g.iter().copied().collect())
        .collect();

    let mut res = Vec::with_capacity(block_layout.len());
    for block in block_layout.groups() {
        let mut slots = Vec::new();
        let mut subgroup_sizes = Vec::new();
        for set in &condition_sets {
            let members: Vec<usize> = block.iter().copied().filter(|j| set.contains(j)).collect();
            if !members.is_empty() {
                subgroup_sizes.push(members.len());
                slots.extend(members);
            }
        }
        if !slots.is_empty() {
            res.push(BlockSlots {
                slots,
                subgroup_sizes,
            });
        }
    }
    res
}

fn binomial(n: usize, k: usize) -> Option<u128> {
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        // acc * (n - i) is always divisible by (i + 1)
        acc = acc.checked_mul((n - i) as u128)? / (i as u128 + 1);
    }
    Some(acc)
}

fn multinomial(sizes: &[usize]) -> Option<u128> {
    let mut remaining: usize = sizes.iter().sum();
    let mut acc: u128 = 1;
    for &k in sizes {
        acc = acc.checked_mul(binomial(remaining, k)?)?;
        remaining -= k;
    }
    Some(acc)
}

/// Size of the permutation space, saturating at `u128::MAX`.
pub fn num_orderings(blocks: &[BlockSlots]) -> u128 {
    blocks
        .iter()
        .try_fold(1u128, |acc, b| acc.checked_mul(multinomial(&b.subgroup_sizes)?))
        .unwrap_or(u128::MAX)
}

/// All k-subsets of 0..n in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut res = Vec::new();
    if k > n {
        return res;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        res.push(idx.clone());
        let Some(i) = (0..k).rev().find(|&i| idx[i] != i + n - k) else {
            return res;
        };
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

/// Every way of filling subgroups of the given sizes from `pool`, in
/// lexicographic order of the chosen positions. The first one is `pool` itself.
fn arrangements(pool: &[usize], sizes: &[usize]) -> Vec<Vec<usize>> {
    let Some((&k, rest)) = sizes.split_first() else {
        return vec![Vec::new()];
    };
    let mut res = Vec::new();
    for combo in combinations(pool.len(), k) {
        let chosen: Vec<usize> = combo.iter().map(|&i| pool[i]).collect();
        let remaining: Vec<usize> = (0..pool.len())
            .filter(|i| !combo.contains(i))
            .map(|i| pool[i])
            .collect();
        for tail in arrangements(&remaining, rest) {
            let mut a = chosen.clone();
            a.extend(tail);
            res.push(a);
        }
    }
    res
}

fn identity_row(num_samples: usize) -> Vec<usize> {
    (0..num_samples).collect()
}

fn rows_to_array(rows: Vec<Vec<usize>>, num_samples: usize) -> Array2<usize> {
    let num_draws = rows.len();
    let flat: Vec<usize> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((num_draws, num_samples), flat)
        .unwrap_or_else(|_| Array2::zeros((0, num_samples)))
}

/// Enumerates the whole permutation space. The first draw is the identity.
pub fn all_orderings(blocks: &[BlockSlots], num_samples: usize) -> Array2<usize> {
    let per_block: Vec<Vec<Vec<usize>>> = blocks
        .iter()
        .map(|b| arrangements(&b.slots, &b.subgroup_sizes))
        .collect();

    let mut rows = Vec::new();
    let mut counters = vec![0usize; blocks.len()];
    'outer: loop {
        let mut row = identity_row(num_samples);
        for (b, block) in blocks.iter().enumerate() {
            let arrangement = &per_block[b][counters[b]];
            for (slot, &col) in block.slots.iter().zip(arrangement) {
                row[*slot] = col;
            }
        }
        rows.push(row);

        // Last block varies fastest.
        let mut b = blocks.len();
        loop {
            if b == 0 {
                break 'outer;
            }
            b -= 1;
            counters[b] += 1;
            if counters[b] < per_block[b].len() {
                break;
            }
            counters[b] = 0;
        }
    }
    rows_to_array(rows, num_samples)
}

/// Random permutations within each block.
pub fn random_orderings(
    blocks: &[BlockSlots],
    num_samples: usize,
    num_draws: usize,
    rng: &mut StdRng,
) -> Array2<usize> {
    let rows = (0..num_draws)
        .map(|_| {
            let mut row = identity_row(num_samples);
            for block in blocks {
                let mut members = block.slots.clone();
                members.shuffle(rng);
                for (slot, col) in block.slots.iter().zip(members) {
                    row[*slot] = col;
                }
            }
            row
        })
        .collect();
    rows_to_array(rows, num_samples)
}

/// Bootstrap draws with replacement, stratified within each block.
pub fn random_indexes(
    blocks: &[BlockSlots],
    num_samples: usize,
    num_draws: usize,
    rng: &mut StdRng,
) -> Array2<usize> {
    let rows = (0..num_draws)
        .map(|_| {
            let mut row = identity_row(num_samples);
            for block in blocks {
                for slot in &block.slots {
                    row[*slot] = block.slots[rng.gen_range(0..block.slots.len())];
                }
            }
            row
        })
        .collect();
    rows_to_array(rows, num_samples)
}

/// Bootstrap draws with replacement from a single pool of every layout
/// column. Used when resampling residuals.
pub fn random_indexes_flat(
    blocks: &[BlockSlots],
    num_samples: usize,
    num_draws: usize,
    rng: &mut StdRng,
) -> Array2<usize> {
    let pool: Vec<usize> = blocks.iter().flat_map(|b| b.slots.iter().copied()).collect();
    let rows = (0..num_draws)
        .map(|_| {
            let mut row = identity_row(num_samples);
            if !pool.is_empty() {
                for slot in &pool {
                    row[*slot] = pool[rng.gen_range(0..pool.len())];
                }
            }
            row
        })
        .collect();
    rows_to_array(rows, num_samples)
}

/// Generates the draws for a run.
///
/// Permutation mode enumerates the whole space when it has at most
/// `max_draws` orderings, otherwise it samples `max_draws` of them with a
/// seeded rng.
pub fn new_sample_indexes(
    condition_layout: &Layout,
    block_layout: &Layout,
    num_samples: usize,
    config: &SamplingConfig,
) -> Result<SampleIndexes, SamplingError> {
    if config.max_draws == 0 {
        return Err(SamplingError::NoDraws);
    }
    condition_layout.check_bounds(num_samples)?;
    block_layout.check_bounds(num_samples)?;

    let blocks = block_slots(condition_layout, block_layout);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let draws = match config.mode {
        SamplingMode::Permutation => {
            let total = num_orderings(&blocks);
            if total <= config.max_draws as u128 {
                log::info!("Enumerating all {} permutations", total);
                all_orderings(&blocks, num_samples)
            } else {
                log::info!(
                    "Permutation space has {} orderings; sampling {} with seed {}",
                    if total == u128::MAX { "too many".to_string() } else { total.to_string() },
                    config.max_draws,
                    config.seed
                );
                random_orderings(&blocks, num_samples, config.max_draws, &mut rng)
            }
        }
        SamplingMode::Bootstrap => {
            log::info!(
                "Drawing {} bootstrap samples from {:?} data with seed {}",
                config.max_draws,
                config.sample_from,
                config.seed
            );
            match config.sample_from {
                SampleFrom::Raw => random_indexes(&blocks, num_samples, config.max_draws, &mut rng),
                SampleFrom::Residuals => {
                    random_indexes_flat(&blocks, num_samples, config.max_draws, &mut rng)
                }
            }
        }
    };

    SampleIndexes::new(draws, num_samples)
}

/// Labels each resampled column with the condition of the sample placed
/// there: `A` for the first condition, `B` for the second, `.` for none.
pub fn condition_symbols(condition_layout: &Layout, draw: ArrayView1<usize>) -> String {
    draw.iter()
        .map(|idx| {
            condition_layout
                .groups()
                .iter()
                .position(|g| g.contains(idx))
                .map_or('.', |g| {
                    if g < 26 {
                        (b'A' + g as u8) as char
                    } else {
                        '?'
                    }
                })
        })
        .collect()
}
