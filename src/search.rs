// src/search.rs

//! Orchestration of a full hyperparameter search: preprocessing, grid
//! evaluation, deduplication, scoring and selection.

use std::time::Instant;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::clustering::{ClusterQualityCriterion, ClusteringPrimitive};
use crate::covariance::{ContrastBuilder, CovarianceBuilder};
use crate::dedup::{Deduplicator, UniqueSolutionSet, DEFAULT_DEDUP_TOLERANCE};
use crate::error::{Result, ScpcaError, SearchWarning};
use crate::grid::{CandidateSolution, GridEngine, GridEvaluation, GridPoint, HyperparameterGrid};
use crate::scoring::{assign_folds, ClusterScorer, CrossValidatedScorer, ScoringOutcome};
use crate::selection::{RankedEntry, Selector};
use crate::solver::SparseEigenPrimitive;

/// Configuration for a [`ContrastiveSearch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Contrast strengths to try. 0 disables the background term.
    pub contrasts: Vec<f64>,
    /// Sparsity penalties to try. 0 gives dense loadings.
    pub penalties: Vec<f64>,
    /// Number of clusters the projected target is partitioned into.
    pub n_centers: usize,
    /// Number of sparse components per grid point.
    pub n_components: usize,
    /// Subtract column means before projecting.
    pub center: bool,
    /// Divide columns by their sample standard deviation.
    pub scale: bool,
    /// Number of cross-validation folds; 1 scores on the whole target.
    pub cv_folds: usize,
    /// Seed for fold assignment and the clustering primitive.
    pub random_seed: u64,
    /// Evaluate grid points and scoring units on the rayon pool.
    pub parallel: bool,
    /// Size of a dedicated thread pool for this search. `None` uses the
    /// global rayon pool.
    pub num_threads: Option<usize>,
    /// Absolute element-wise tolerance for treating two loadings matrices as
    /// the same solution.
    pub dedup_tolerance: f64,
    pub criterion: ClusterQualityCriterion,
    /// Score against these per-row target labels instead of clustering.
    pub known_labels: Option<Vec<usize>>,
    /// Keep the ranked table of every unique solution in the result.
    pub return_diagnostics: bool,
}

impl Default for SearchConfig {
    /// 40 log-spaced contrasts in [0.1, 1000] and 20 evenly spaced penalties
    /// in [0.05, 1].
    fn default() -> Self {
        SearchConfig {
            contrasts: log_spaced(0.1, 1000.0, 40),
            penalties: evenly_spaced(0.05, 1.0, 20),
            n_centers: 2,
            n_components: 2,
            center: true,
            scale: false,
            cv_folds: 1,
            random_seed: 2025,
            parallel: true,
            num_threads: None,
            dedup_tolerance: DEFAULT_DEDUP_TOLERANCE,
            criterion: ClusterQualityCriterion::AverageSilhouette,
            known_labels: None,
            return_diagnostics: false,
        }
    }
}

/// Outcome of a successful search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub contrast: f64,
    pub penalty: f64,
    /// Canonical (lowest-index) grid point of the selected solution.
    pub grid_point: GridPoint,
    /// Shape: `(n_features, n_components)`.
    pub loadings: Array2<f64>,
    pub eigenvalues: Array1<f64>,
    /// Preprocessed target projected onto `loadings`, shape
    /// `(n_target_samples, n_components)`.
    pub scores: Array2<f64>,
    pub best_score: f64,
    /// Per-fold scores of the selected solution when cross-validating.
    pub fold_scores: Option<Vec<f64>>,
    /// Every unique solution, best first. Present when
    /// `return_diagnostics` is set.
    pub ranked: Option<Vec<RankedEntry>>,
    /// Recovered per-grid-point and per-fold failures.
    pub warnings: Vec<SearchWarning>,
    pub n_grid_points: usize,
    /// Grid points the solver succeeded on.
    pub n_candidates: usize,
    pub n_unique_solutions: usize,
}

/// Runs the sparse contrastive PCA hyperparameter search.
#[derive(Debug, Clone)]
pub struct ContrastiveSearch {
    config: SearchConfig,
}

impl ContrastiveSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Runs every stage and selects the best solution.
    ///
    /// Either returns a complete result or a single fatal error; per-point
    /// solver failures and degenerate clusterings end up in
    /// [`SelectionResult::warnings`].
    pub fn run<S, C>(
        &self,
        target: ArrayView2<f64>,
        background: ArrayView2<f64>,
        solver: &S,
        clusterer: &C,
    ) -> Result<SelectionResult>
    where
        S: SparseEigenPrimitive + ?Sized,
        C: ClusteringPrimitive + ?Sized,
    {
        match self.config.num_threads {
            Some(0) => Err(ScpcaError::InvalidParameter(
                "num_threads must be at least 1".to_string(),
            )),
            Some(num_threads) => {
                let pool = rayon::ThreadPoolBuilder::new().num_threads(num_threads).build()?;
                debug!("Running search on a dedicated pool of {} threads.", num_threads);
                pool.install(|| self.run_stages(target, background, solver, clusterer))
            }
            None => self.run_stages(target, background, solver, clusterer),
        }
    }

    fn run_stages<S, C>(
        &self,
        target: ArrayView2<f64>,
        background: ArrayView2<f64>,
        solver: &S,
        clusterer: &C,
    ) -> Result<SelectionResult>
    where
        S: SparseEigenPrimitive + ?Sized,
        C: ClusteringPrimitive + ?Sized,
    {
        let overall_start_time = Instant::now();
        info!(
            "Starting contrastive search: target {}x{}, background {}x{}.",
            target.nrows(),
            target.ncols(),
            background.nrows(),
            background.ncols()
        );

        let contrast_builder = self.prepare(target, background)?;
        let folds = assign_folds(
            contrast_builder.n_target_samples(),
            self.config.cv_folds,
            self.config.random_seed,
        )?;

        let evaluation = self.evaluate_grid(&contrast_builder, solver)?;
        let n_grid_points = evaluation.n_grid_points;
        let n_candidates = evaluation.candidates.len();
        let mut warnings = evaluation.warnings;

        let unique = self.deduplicate(evaluation.candidates);
        let n_unique_solutions = unique.len();

        let scoring = self.score_folds(&contrast_builder, unique, clusterer, folds);
        warnings.extend(scoring.warnings);

        let selection_start_time = Instant::now();
        let selection = Selector::new().select(contrast_builder.target(), scoring.scored)?;
        debug!("Selection finished in {:?}.", selection_start_time.elapsed());

        info!(
            "Contrastive search finished in {:?}: {} grid points, {} candidates, {} unique solutions, {} warnings.",
            overall_start_time.elapsed(),
            n_grid_points,
            n_candidates,
            n_unique_solutions,
            warnings.len()
        );

        let canonical = selection.solution.canonical;
        Ok(SelectionResult {
            contrast: canonical.contrast,
            penalty: canonical.penalty,
            grid_point: canonical,
            loadings: selection.solution.loadings,
            eigenvalues: selection.solution.eigenvalues,
            scores: selection.projected,
            best_score: selection.score,
            fold_scores: selection.fold_scores,
            ranked: self.config.return_diagnostics.then_some(selection.ranked),
            warnings,
            n_grid_points,
            n_candidates,
            n_unique_solutions,
        })
    }

    /// Validates the configuration against the data and computes the
    /// preprocessed target and both covariance matrices.
    pub fn prepare(&self, target: ArrayView2<f64>, background: ArrayView2<f64>) -> Result<ContrastBuilder> {
        self.validate(target)?;
        let start_time = Instant::now();
        let contrast_builder = CovarianceBuilder::new(self.config.center, self.config.scale).build(target, background)?;
        info!("Covariance matrices computed in {:?}.", start_time.elapsed());
        Ok(contrast_builder)
    }

    /// Solves every grid point of the configured grid.
    pub fn evaluate_grid<S>(&self, contrast_builder: &ContrastBuilder, solver: &S) -> Result<GridEvaluation>
    where
        S: SparseEigenPrimitive + ?Sized,
    {
        let grid = HyperparameterGrid::new(&self.config.contrasts, &self.config.penalties)?;
        GridEngine::new(solver, self.config.n_components, self.config.parallel).evaluate(contrast_builder, &grid)
    }

    pub fn deduplicate(&self, candidates: Vec<CandidateSolution>) -> UniqueSolutionSet {
        Deduplicator::new(self.config.dedup_tolerance).deduplicate(candidates)
    }

    /// Scores unique solutions, cross-validated when `cv_folds > 1`.
    pub fn score<C>(
        &self,
        contrast_builder: &ContrastBuilder,
        solutions: UniqueSolutionSet,
        clusterer: &C,
    ) -> Result<ScoringOutcome>
    where
        C: ClusteringPrimitive + ?Sized,
    {
        let folds = assign_folds(
            contrast_builder.n_target_samples(),
            self.config.cv_folds,
            self.config.random_seed,
        )?;
        Ok(self.score_folds(contrast_builder, solutions, clusterer, folds))
    }

    fn score_folds<C>(
        &self,
        contrast_builder: &ContrastBuilder,
        solutions: UniqueSolutionSet,
        clusterer: &C,
        folds: Vec<Vec<usize>>,
    ) -> ScoringOutcome
    where
        C: ClusteringPrimitive + ?Sized,
    {
        let start_time = Instant::now();
        let scorer = ClusterScorer::new(
            clusterer,
            self.config.n_centers,
            self.config.criterion,
            self.config.random_seed,
        )
        .with_known_labels(self.config.known_labels.as_deref())
        .parallel(self.config.parallel);
        let outcome = CrossValidatedScorer::new(scorer, folds).score(contrast_builder.target(), solutions);
        info!("Scoring finished in {:?}.", start_time.elapsed());
        outcome
    }

    fn validate(&self, target: ArrayView2<f64>) -> Result<()> {
        let config = &self.config;
        let n_features = target.ncols();
        if config.n_components == 0 || config.n_components > n_features {
            return Err(ScpcaError::InvalidParameter(format!(
                "n_components must be between 1 and the number of variables ({}), got {}",
                n_features, config.n_components
            )));
        }
        if !config.dedup_tolerance.is_finite() || config.dedup_tolerance < 0.0 {
            return Err(ScpcaError::InvalidParameter(format!(
                "dedup_tolerance must be finite and non-negative, got {}",
                config.dedup_tolerance
            )));
        }
        if let Some(labels) = &config.known_labels {
            if labels.len() != target.nrows() {
                return Err(ScpcaError::DimensionMismatch {
                    context: "known_labels length must equal target row count",
                    expected: target.nrows(),
                    found: labels.len(),
                });
            }
        }
        HyperparameterGrid::new(&config.contrasts, &config.penalties)?;
        Ok(())
    }
}

/// Runs a complete search with the given primitives.
///
/// Equivalent to building a [`SearchConfig`] from the arguments (remaining
/// fields at their defaults, with the ranked table kept) and calling
/// [`ContrastiveSearch::run`].
#[allow(clippy::too_many_arguments)]
pub fn search<S, C>(
    target: ArrayView2<f64>,
    background: ArrayView2<f64>,
    contrasts: &[f64],
    penalties: &[f64],
    n_centers: usize,
    n_components: usize,
    center: bool,
    scale: bool,
    cv_folds: usize,
    seed: u64,
    clusterer: &C,
    solver: &S,
    parallel: bool,
) -> Result<SelectionResult>
where
    S: SparseEigenPrimitive + ?Sized,
    C: ClusteringPrimitive + ?Sized,
{
    let config = SearchConfig {
        contrasts: contrasts.to_vec(),
        penalties: penalties.to_vec(),
        n_centers,
        n_components,
        center,
        scale,
        cv_folds,
        random_seed: seed,
        parallel,
        return_diagnostics: true,
        ..SearchConfig::default()
    };
    ContrastiveSearch::new(config).run(target, background, solver, clusterer)
}

fn log_spaced(start: f64, end: f64, n: usize) -> Vec<f64> {
    evenly_spaced(start.ln(), end.ln(), n).into_iter().map(f64::exp).collect()
}

fn evenly_spaced(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}
