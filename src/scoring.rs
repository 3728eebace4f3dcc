// src/scoring.rs

//! Clustering-based scoring of unique solutions, on the whole target or
//! out-of-sample across cross-validation folds.

use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::clustering::{ClusterQualityCriterion, ClusteringPrimitive};
use crate::dedup::{UniqueSolution, UniqueSolutionSet};
use crate::error::{Result, ScpcaError, SearchWarning};

/// A unique solution with its clustering score.
#[derive(Clone, Debug)]
pub struct ScoredSolution {
    pub solution: UniqueSolution,
    /// Mean over folds when cross-validating; `-inf` when no fold succeeded.
    pub score: f64,
    /// Per-fold scores (`-inf` for failed folds); `None` without cross-validation.
    pub fold_scores: Option<Vec<f64>>,
}

/// Scored solutions in canonical grid order plus the per-unit failures.
#[derive(Debug)]
pub struct ScoringOutcome {
    pub scored: Vec<ScoredSolution>,
    pub warnings: Vec<SearchWarning>,
}

/// Projects rows of the target through candidate loadings.
pub fn project(target: ArrayView2<f64>, loadings: ArrayView2<f64>) -> Array2<f64> {
    target.dot(&loadings)
}

/// Scores each unique solution by clustering the projected target.
pub struct ClusterScorer<'a, C: ClusteringPrimitive + ?Sized> {
    clusterer: &'a C,
    n_centers: usize,
    criterion: ClusterQualityCriterion,
    known_labels: Option<&'a [usize]>,
    seed: u64,
    parallel: bool,
}

impl<'a, C: ClusteringPrimitive + ?Sized> ClusterScorer<'a, C> {
    pub fn new(clusterer: &'a C, n_centers: usize, criterion: ClusterQualityCriterion, seed: u64) -> Self {
        Self {
            clusterer,
            n_centers,
            criterion,
            known_labels: None,
            seed,
            parallel: true,
        }
    }

    /// Scores partitions given by known per-row labels instead of clustering.
    pub fn with_known_labels(mut self, labels: Option<&'a [usize]>) -> Self {
        self.known_labels = labels;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Scores every entry on the full target.
    pub fn score(&self, target: ArrayView2<f64>, solutions: UniqueSolutionSet) -> ScoringOutcome {
        let all_rows: Vec<usize> = (0..target.nrows()).collect();
        let (scored, warnings) = self.score_over_folds(target, solutions, &[all_rows]);
        let scored = scored
            .into_iter()
            .map(|(solution, mut fold_scores)| ScoredSolution {
                solution,
                score: fold_scores.pop().unwrap_or(f64::NEG_INFINITY),
                fold_scores: None,
            })
            .collect();
        ScoringOutcome { scored, warnings }
    }

    /// Scores the projection of the given rows. The clustering seed depends
    /// on the fold only, so every solution sees the same stochastic choices.
    pub fn score_rows(
        &self,
        target: ArrayView2<f64>,
        loadings: ArrayView2<f64>,
        rows: &[usize],
        fold_index: usize,
    ) -> Result<f64> {
        if self.known_labels.is_none() && self.n_centers > rows.len() {
            return Err(ScpcaError::DegenerateClusteringFailure {
                reason: format!(
                    "{} cluster centers requested for {} observations",
                    self.n_centers,
                    rows.len()
                ),
            });
        }

        let projected = project(target.select(Axis(0), rows).view(), loadings);
        let labels: Vec<usize> = match self.known_labels {
            Some(known) => rows.iter().map(|&r| known[r]).collect(),
            None => self
                .clusterer
                .cluster(projected.view(), self.n_centers, self.seed.wrapping_add(fold_index as u64))
                .map_err(|e| ScpcaError::DegenerateClusteringFailure {
                    reason: format!("clustering primitive failed: {}", e),
                })?,
        };
        self.criterion.evaluate(projected.view(), &labels)
    }

    /// Runs every (entry, fold) pair and returns the per-fold scores of each
    /// entry in fold order. Failed pairs score `-inf` and emit a warning.
    fn score_over_folds(
        &self,
        target: ArrayView2<f64>,
        solutions: UniqueSolutionSet,
        folds: &[Vec<usize>],
    ) -> (Vec<(UniqueSolution, Vec<f64>)>, Vec<SearchWarning>) {
        let entries = solutions.entries;
        let tasks: Vec<(usize, usize)> = (0..entries.len())
            .flat_map(|entry_index| (0..folds.len()).map(move |fold_index| (entry_index, fold_index)))
            .collect();

        let run_task = |&(entry_index, fold_index): &(usize, usize)| {
            self.score_rows(
                target,
                entries[entry_index].loadings.view(),
                &folds[fold_index],
                fold_index,
            )
        };
        let results: Vec<Result<f64>> = if self.parallel {
            tasks.par_iter().map(run_task).collect()
        } else {
            tasks.iter().map(run_task).collect()
        };

        let cross_validated = folds.len() > 1;
        let mut warnings = Vec::new();
        let mut per_entry: Vec<Vec<f64>> = vec![Vec::with_capacity(folds.len()); entries.len()];
        for (&(entry_index, fold_index), result) in tasks.iter().zip(results) {
            let score = match result {
                Ok(score) => score,
                Err(err) => {
                    let warning = SearchWarning::DegenerateClustering {
                        canonical_grid_index: entries[entry_index].canonical.id.0,
                        fold: if cross_validated { Some(fold_index) } else { None },
                        message: err.to_string(),
                    };
                    warn!("{}", warning);
                    warnings.push(warning);
                    f64::NEG_INFINITY
                }
            };
            per_entry[entry_index].push(score);
        }

        for (entry, scores) in entries.iter().zip(per_entry.iter()) {
            debug!(
                "Solution at grid point {} (contrast={}, penalty={}) fold scores: {:?}",
                entry.canonical.id.0, entry.canonical.contrast, entry.canonical.penalty, scores
            );
        }
        (entries.into_iter().zip(per_entry).collect(), warnings)
    }
}

/// Scores each unique solution out-of-sample: the held-out rows of every
/// fold are projected with the global loadings and clustered separately.
pub struct CrossValidatedScorer<'a, C: ClusteringPrimitive + ?Sized> {
    scorer: ClusterScorer<'a, C>,
    folds: Vec<Vec<usize>>,
}

impl<'a, C: ClusteringPrimitive + ?Sized> CrossValidatedScorer<'a, C> {
    /// `folds` should come from [`assign_folds`] and be fixed before the grid
    /// is evaluated.
    pub fn new(scorer: ClusterScorer<'a, C>, folds: Vec<Vec<usize>>) -> Self {
        Self { scorer, folds }
    }

    pub fn folds(&self) -> &[Vec<usize>] {
        &self.folds
    }

    /// Mean score over folds that succeeded. With a single fold this is the
    /// non-cross-validated score of that fold.
    pub fn score(&self, target: ArrayView2<f64>, solutions: UniqueSolutionSet) -> ScoringOutcome {
        info!(
            "Cross-validated scoring of {} unique solutions over {} folds.",
            solutions.len(),
            self.folds.len()
        );
        if self.folds.len() <= 1 {
            return self.scorer.score(target, solutions);
        }

        let (scored, warnings) = self.scorer.score_over_folds(target, solutions, &self.folds);
        let scored = scored
            .into_iter()
            .map(|(solution, fold_scores)| {
                let successful: Vec<f64> = fold_scores.iter().copied().filter(|s| s.is_finite()).collect();
                let score = if successful.is_empty() {
                    f64::NEG_INFINITY
                } else {
                    successful.iter().sum::<f64>() / successful.len() as f64
                };
                ScoredSolution {
                    solution,
                    score,
                    fold_scores: Some(fold_scores),
                }
            })
            .collect();
        ScoringOutcome { scored, warnings }
    }
}

/// Shuffles the row indices with `seed` and deals them round-robin into
/// `n_folds` disjoint folds of near-equal size. Each fold is sorted.
///
/// With `n_folds <= 1` a single fold holds every row in order.
///
/// # Errors
/// `InvalidParameter` if `n_folds` exceeds `n_rows`.
pub fn assign_folds(n_rows: usize, n_folds: usize, seed: u64) -> Result<Vec<Vec<usize>>> {
    if n_folds <= 1 {
        return Ok(vec![(0..n_rows).collect()]);
    }
    if n_folds > n_rows {
        return Err(ScpcaError::InvalidParameter(format!(
            "cannot split {} target rows into {} folds",
            n_rows, n_folds
        )));
    }

    let mut indices: Vec<usize> = (0..n_rows).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let mut folds = vec![Vec::with_capacity(n_rows / n_folds + 1); n_folds];
    for (position, row) in indices.into_iter().enumerate() {
        folds[position % n_folds].push(row);
    }
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    Ok(folds)
}
