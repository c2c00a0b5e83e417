//! Module for sample layouts: partitions of table columns into groups.
//!
//! A layout is an ordered list of disjoint groups of column indices. Each
//! group holds the samples that share a factor value (a condition, a block,
//! or a combination of both). Columns that do not appear in any group are
//! simply not part of the layout.
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Group {group} has {size} samples, but at least {min} are required")]
    InsufficientReplicates { group: usize, size: usize, min: usize },
    #[error("Layouts do not overlap: every intersected group is empty")]
    DegenerateLayout,
    #[error("Column index {0} appears more than once in the layout")]
    DuplicateIndex(usize),
    #[error("Group {0} of the layout is empty")]
    EmptyGroup(usize),
    #[error("Layout is not paired: {0}")]
    NotPaired(String),
    #[error("Unsupported condition layout: {0}")]
    InsufficientConditions(String),
    #[error("Column index {index} is out of bounds for a table with {num_samples} samples")]
    IndexOutOfBounds { index: usize, num_samples: usize },
}

/// An ordered sequence of disjoint, non-empty groups of column indices.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    groups: Vec<Vec<usize>>,
}

impl Layout {
    /// Builds a layout, rejecting empty groups and indexes that appear twice.
    pub fn new(groups: Vec<Vec<usize>>) -> Result<Self, LayoutError> {
        let mut seen = HashSet::new();
        for (i, group) in groups.iter().enumerate() {
            if group.is_empty() {
                return Err(LayoutError::EmptyGroup(i));
            }
            for &idx in group {
                if !seen.insert(idx) {
                    return Err(LayoutError::DuplicateIndex(idx));
                }
            }
        }
        Ok(Layout { groups })
    }

    /// A layout with a single group holding the given columns.
    pub fn single(columns: Vec<usize>) -> Result<Self, LayoutError> {
        Layout::new(vec![columns])
    }

    pub fn groups(&self) -> &[Vec<usize>] {
        &self.groups
    }

    pub fn group(&self, i: usize) -> &[usize] {
        &self.groups[i]
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.iter().map(Vec::len).collect()
    }

    /// All columns covered by the layout, in layout order.
    pub fn columns(&self) -> Vec<usize> {
        self.groups.iter().flatten().copied().collect()
    }

    pub fn num_columns(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn max_index(&self) -> Option<usize> {
        self.groups.iter().flatten().copied().max()
    }

    /// Pairwise intersection with `inner`.
    ///
    /// Groups are ordered by this layout's order first and `inner`'s order
    /// second. Members keep the order they have in this layout. Empty
    /// intersections are dropped; if all of them are empty the layouts do
    /// not describe the same samples and `DegenerateLayout` is returned.
    pub fn intersect(&self, inner: &Layout) -> Result<Layout, LayoutError> {
        let inner_sets: Vec<HashSet<usize>> = inner
            .groups
            .iter()
            .map(|g| g.iter().copied().collect())
            .collect();

        let mut groups = Vec::new();
        for outer in &self.groups {
            for set in &inner_sets {
                let members: Vec<usize> =
                    outer.iter().copied().filter(|idx| set.contains(idx)).collect();
                if !members.is_empty() {
                    groups.push(members);
                }
            }
        }

        if groups.is_empty() {
            return Err(LayoutError::DegenerateLayout);
        }
        Ok(Layout { groups })
    }

    /// Fails with `InsufficientReplicates` if any group is smaller than `min_size`.
    pub fn validate_min_group_size(&self, min_size: usize) -> Result<(), LayoutError> {
        for (i, group) in self.groups.iter().enumerate() {
            if group.len() < min_size {
                return Err(LayoutError::InsufficientReplicates {
                    group: i,
                    size: group.len(),
                    min: min_size,
                });
            }
        }
        Ok(())
    }

    /// True if every group has exactly two members.
    pub fn is_paired(&self) -> bool {
        !self.groups.is_empty() && self.groups.iter().all(|g| g.len() == 2)
    }

    /// Checks every index against the number of columns in the table.
    pub fn check_bounds(&self, num_samples: usize) -> Result<(), LayoutError> {
        match self.max_index() {
            Some(index) if index >= num_samples => {
                Err(LayoutError::IndexOutOfBounds { index, num_samples })
            }
            _ => Ok(()),
        }
    }
}

/// Free-function form of [`Layout::intersect`].
pub fn intersect_layouts(outer: &Layout, inner: &Layout) -> Result<Layout, LayoutError> {
    outer.intersect(inner)
}

/// Means of each group, shape (features, groups).
pub fn group_means(data: ArrayView2<f64>, layout: &Layout) -> Array2<f64> {
    let mut res = Array2::zeros((data.nrows(), layout.len()));
    for (g, group) in layout.groups().iter().enumerate() {
        let n = group.len() as f64;
        for (i, row) in data.outer_iter().enumerate() {
            let sum: f64 = group.iter().map(|&j| row[j]).sum();
            res[[i, g]] = sum / n;
        }
    }
    res
}

/// Replaces every value with the mean of its group.
///
/// Columns outside the layout are zero.
pub fn fitted_values(data: ArrayView2<f64>, layout: &Layout) -> Array2<f64> {
    let means = group_means(data, layout);
    let mut res = Array2::zeros(data.raw_dim());
    for (g, group) in layout.groups().iter().enumerate() {
        for i in 0..data.nrows() {
            for &j in group {
                res[[i, j]] = means[[i, g]];
            }
        }
    }
    res
}

/// Values minus their group mean. Columns outside the layout are zero.
pub fn residuals(data: ArrayView2<f64>, layout: &Layout) -> Array2<f64> {
    let fitted = fitted_values(data, layout);
    let mut res = Array2::zeros(data.raw_dim());
    for &j in &layout.columns() {
        for i in 0..data.nrows() {
            res[[i, j]] = data[[i, j]] - fitted[[i, j]];
        }
    }
    res
}

/// Residual sum of squares per feature under the layout.
pub fn rss(data: ArrayView2<f64>, layout: &Layout) -> Array1<f64> {
    let r = residuals(data, layout);
    let columns = layout.columns();
    Array1::from_iter(
        r.outer_iter()
            .map(|row| columns.iter().map(|&j| row[j] * row[j]).sum::<f64>()),
    )
}
