// src/dedup.rs

//! Collapsing of numerically equivalent loadings across grid points.
//!
//! Eigenvectors are only defined up to sign, so every candidate is first put
//! into a canonical sign/column order and then compared element-wise.
//! Rotations inside the eigenspace of a repeated eigenvalue are not detected:
//! two such candidates stay separate entries.

use float_cmp::approx_eq;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::grid::{CandidateSolution, GridPoint};

pub const DEFAULT_DEDUP_TOLERANCE: f64 = 1e-5;

/// One distinct solution and every grid point that produced it.
#[derive(Clone, Debug)]
pub struct UniqueSolution {
    /// Lowest-index grid point that produced this solution.
    pub canonical: GridPoint,
    /// All contributing grid points in grid order; `members[0] == canonical`.
    pub members: Vec<GridPoint>,
    /// Sign-normalized loadings, shape `(n_features, n_components)`.
    pub loadings: Array2<f64>,
    /// Eigenvalues matching the column order of `loadings`.
    pub eigenvalues: Array1<f64>,
}

/// Unique solutions ordered by their canonical grid index.
#[derive(Clone, Debug, Default)]
pub struct UniqueSolutionSet {
    pub entries: Vec<UniqueSolution>,
}

impl UniqueSolutionSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry a grid point was attributed to.
    pub fn entry_for(&self, grid_index: usize) -> Option<&UniqueSolution> {
        self.entries
            .iter()
            .find(|entry| entry.members.iter().any(|member| member.id.0 == grid_index))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    tolerance: f64,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TOLERANCE)
    }
}

impl Deduplicator {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Merges equivalent candidates. `candidates` must be in grid order so
    /// that the first member of every entry is its lowest-index grid point.
    pub fn deduplicate(&self, candidates: Vec<CandidateSolution>) -> UniqueSolutionSet {
        let n_candidates = candidates.len();
        let mut entries: Vec<UniqueSolution> = Vec::new();

        for candidate in candidates {
            let (loadings, eigenvalues) = sign_normalize(candidate.loadings.view(), &candidate.eigenvalues);

            match entries
                .iter_mut()
                .find(|entry| self.equivalent(entry.loadings.view(), loadings.view()))
            {
                Some(entry) => {
                    debug!(
                        "Grid point {} duplicates the solution of grid point {}.",
                        candidate.grid_point.id.0, entry.canonical.id.0
                    );
                    entry.members.push(candidate.grid_point);
                }
                None => entries.push(UniqueSolution {
                    canonical: candidate.grid_point,
                    members: vec![candidate.grid_point],
                    loadings,
                    eigenvalues,
                }),
            }
        }

        info!(
            "Deduplicated {} candidate solutions into {} unique solutions.",
            n_candidates,
            entries.len()
        );
        UniqueSolutionSet { entries }
    }

    /// Element-wise comparison within the absolute tolerance.
    pub fn equivalent(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> bool {
        a.dim() == b.dim()
            && a
                .iter()
                .zip(b.iter())
                .all(|(&x, &y)| approx_eq!(f64, x, y, epsilon = self.tolerance))
    }
}

/// Orders columns by descending eigenvalue (stable) and flips each column so
/// its largest-magnitude entry is positive. The first entry wins magnitude
/// ties.
pub fn sign_normalize(loadings: ArrayView2<f64>, eigenvalues: &Array1<f64>) -> (Array2<f64>, Array1<f64>) {
    let mut order: Vec<usize> = (0..loadings.ncols()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    let mut normalized = loadings.select(Axis(1), &order);
    for mut column in normalized.axis_iter_mut(Axis(1)) {
        let mut pivot = 0.0_f64;
        for &value in column.iter() {
            if value.abs() > pivot.abs() {
                pivot = value;
            }
        }
        if pivot < 0.0 {
            column.mapv_inplace(|v| -v);
        }
    }

    let sorted_eigenvalues = order.iter().map(|&i| eigenvalues[i]).collect();
    (normalized, sorted_eigenvalues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridPointId;
    use ndarray::array;

    fn candidate(id: usize, loadings: Array2<f64>, eigenvalues: Array1<f64>) -> CandidateSolution {
        CandidateSolution {
            grid_point: GridPoint {
                id: GridPointId(id),
                contrast: id as f64,
                penalty: 0.0,
            },
            loadings,
            eigenvalues,
        }
    }

    #[test]
    fn sign_flips_are_equivalent() {
        let a = array![[0.8, 0.0], [-0.6, 1.0]];
        let b = array![[-0.8, 0.0], [0.6, -1.0]];
        let set = Deduplicator::default().deduplicate(vec![
            candidate(0, a, array![2.0, 1.0]),
            candidate(1, b, array![2.0, 1.0]),
        ]);
        assert_eq!(set.len(), 1);
        let entry = &set.entries[0];
        assert_eq!(entry.canonical.id, GridPointId(0));
        assert_eq!(entry.members.len(), 2);
        assert_eq!(entry.loadings, array![[0.8, 0.0], [-0.6, 1.0]]);
    }

    #[test]
    fn column_order_follows_eigenvalues() {
        let a = array![[1.0, 0.0], [0.0, 1.0]];
        let swapped = array![[0.0, 1.0], [1.0, 0.0]];
        let set = Deduplicator::default().deduplicate(vec![
            candidate(0, a, array![3.0, 1.0]),
            candidate(1, swapped, array![1.0, 3.0]),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries[0].eigenvalues, array![3.0, 1.0]);
    }

    #[test]
    fn differences_beyond_tolerance_stay_separate() {
        let a = array![[1.0], [0.0]];
        let close = array![[1.0], [5e-6]];
        let far = array![[1.0], [1e-3]];
        let set = Deduplicator::default().deduplicate(vec![
            candidate(0, a, array![1.0]),
            candidate(1, close, array![1.0]),
            candidate(2, far, array![1.0]),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.entries[0].members.len(), 2);
        assert_eq!(set.entries[1].canonical.id, GridPointId(2));
        assert_eq!(set.entry_for(1).map(|e| e.canonical.id), Some(GridPointId(0)));
        assert_eq!(set.entry_for(2).map(|e| e.canonical.id), Some(GridPointId(2)));
        assert!(set.entry_for(7).is_none());
    }

    #[test]
    fn canonical_is_lowest_index() {
        let a = array![[0.0], [1.0]];
        let set = Deduplicator::default().deduplicate(vec![
            candidate(2, array![[1.0], [0.0]], array![1.0]),
            candidate(4, a.clone(), array![1.0]),
            candidate(5, -&a, array![1.0]),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.entries[1].canonical.id, GridPointId(4));
        let ids: Vec<usize> = set.entries[1].members.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![4, 5]);
    }
}
