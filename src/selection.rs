// src/selection.rs

use log::info;
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::dedup::UniqueSolution;
use crate::error::{Result, ScpcaError};
use crate::grid::GridPoint;
use crate::scoring::{project, ScoredSolution};

/// One row of the diagnostic table of all scored unique solutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    /// 0 for the selected solution.
    pub rank: usize,
    pub canonical: GridPoint,
    /// Every grid index that produced this solution, ascending.
    pub member_grid_indices: Vec<usize>,
    pub score: f64,
    pub fold_scores: Option<Vec<f64>>,
    pub eigenvalues: Vec<f64>,
    /// Non-zero loadings per component.
    pub nonzero_loadings: Vec<usize>,
}

/// The winning solution with its scores on the full target.
#[derive(Debug, Clone)]
pub struct Selection {
    pub solution: UniqueSolution,
    pub score: f64,
    pub fold_scores: Option<Vec<f64>>,
    /// Full preprocessed target projected onto the selected loadings.
    pub projected: Array2<f64>,
    /// Score descending, then canonical grid index ascending.
    pub ranked: Vec<RankedEntry>,
}

/// Picks the best-scoring unique solution.
#[derive(Debug, Clone, Copy, Default)]
pub struct Selector;

impl Selector {
    pub fn new() -> Self {
        Self
    }

    /// Highest score wins; equal scores resolve to the lowest canonical grid
    /// index. NaN scores count as negative infinity.
    ///
    /// # Errors
    /// `NoViableSolution` if no solution has a finite score.
    pub fn select(&self, target: ArrayView2<f64>, scored: Vec<ScoredSolution>) -> Result<Selection> {
        let n_candidates = scored.len();
        let mut scored: Vec<ScoredSolution> = scored
            .into_iter()
            .map(|mut s| {
                if s.score.is_nan() {
                    s.score = f64::NEG_INFINITY;
                }
                s
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.solution.canonical.id.cmp(&b.solution.canonical.id))
        });

        let ranked: Vec<RankedEntry> = scored
            .iter()
            .enumerate()
            .map(|(rank, s)| ranked_entry(rank, s))
            .collect();

        let best = match scored.into_iter().next() {
            Some(best) if best.score.is_finite() => best,
            _ => return Err(ScpcaError::NoViableSolution { candidates: n_candidates }),
        };
        info!(
            "Selected grid point {} (contrast={}, penalty={}) with score {:.6}.",
            best.solution.canonical.id.0, best.solution.canonical.contrast, best.solution.canonical.penalty, best.score
        );

        let projected = project(target, best.solution.loadings.view());
        Ok(Selection {
            solution: best.solution,
            score: best.score,
            fold_scores: best.fold_scores,
            projected,
            ranked,
        })
    }
}

fn ranked_entry(rank: usize, scored: &ScoredSolution) -> RankedEntry {
    let solution = &scored.solution;
    RankedEntry {
        rank,
        canonical: solution.canonical,
        member_grid_indices: solution.members.iter().map(|m| m.id.0).collect(),
        score: scored.score,
        fold_scores: scored.fold_scores.clone(),
        eigenvalues: solution.eigenvalues.to_vec(),
        nonzero_loadings: count_nonzero_per_column(&solution.loadings).to_vec(),
    }
}

pub(crate) fn count_nonzero_per_column(loadings: &Array2<f64>) -> Array1<usize> {
    loadings
        .columns()
        .into_iter()
        .map(|column| column.iter().filter(|&&v| v != 0.0).count())
        .collect()
}
