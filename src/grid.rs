// src/grid.rs

//! Hyperparameter grid enumeration and per-point sparse eigendecomposition.

use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::covariance::ContrastBuilder;
use crate::error::{Result, ScpcaError, SearchWarning, ThreadSafeStdError};
use crate::solver::SparseEigenPrimitive;

/// Index of a (contrast, penalty) pair in grid enumeration order.
/// Lower ids win every tie downstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPointId(pub usize);

/// One (contrast, penalty) pair.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridPoint {
    pub id: GridPointId,
    pub contrast: f64,
    pub penalty: f64,
}

/// Cartesian product of contrast and penalty values, both sorted ascending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterGrid {
    contrasts: Vec<f64>,
    penalties: Vec<f64>,
}

impl HyperparameterGrid {
    /// Builds the grid, sorting both value sets ascending.
    ///
    /// # Errors
    /// `InvalidGrid` if either set is empty, holds a negative or non-finite
    /// value, or contains a duplicate.
    pub fn new(contrasts: &[f64], penalties: &[f64]) -> Result<Self> {
        Ok(Self {
            contrasts: validated_sorted("contrast", contrasts)?,
            penalties: validated_sorted("penalty", penalties)?,
        })
    }

    pub fn contrasts(&self) -> &[f64] {
        &self.contrasts
    }

    pub fn penalties(&self) -> &[f64] {
        &self.penalties
    }

    pub fn len(&self) -> usize {
        self.contrasts.len() * self.penalties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The grid point at `id`; contrasts form the outer loop.
    pub fn point(&self, id: GridPointId) -> Option<GridPoint> {
        if id.0 >= self.len() {
            return None;
        }
        let n_penalties = self.penalties.len();
        Some(GridPoint {
            id,
            contrast: self.contrasts[id.0 / n_penalties],
            penalty: self.penalties[id.0 % n_penalties],
        })
    }

    /// All points in enumeration order.
    pub fn points(&self) -> Vec<GridPoint> {
        self.contrasts
            .iter()
            .flat_map(|&contrast| self.penalties.iter().map(move |&penalty| (contrast, penalty)))
            .enumerate()
            .map(|(index, (contrast, penalty))| GridPoint {
                id: GridPointId(index),
                contrast,
                penalty,
            })
            .collect()
    }
}

fn validated_sorted(name: &str, values: &[f64]) -> Result<Vec<f64>> {
    if values.is_empty() {
        return Err(ScpcaError::InvalidGrid(format!("at least one {} value is required", name)));
    }
    if let Some(bad) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
        return Err(ScpcaError::InvalidGrid(format!(
            "{} values must be finite and non-negative, got {}",
            name, bad
        )));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(ScpcaError::InvalidGrid(format!("duplicate {} value {}", name, pair[0])));
    }
    Ok(sorted)
}

/// The loadings produced at one grid point.
#[derive(Clone, Debug)]
pub struct CandidateSolution {
    pub grid_point: GridPoint,
    /// Shape: `(n_features, n_components)`.
    pub loadings: Array2<f64>,
    /// Shape: `(n_components)`, descending.
    pub eigenvalues: Array1<f64>,
}

/// Candidates that survived the solver, in grid order, plus the warnings for
/// the points that did not.
#[derive(Debug)]
pub struct GridEvaluation {
    pub candidates: Vec<CandidateSolution>,
    pub warnings: Vec<SearchWarning>,
    pub n_grid_points: usize,
}

/// Runs the sparse eigensolver once per grid point.
pub struct GridEngine<'a, S: SparseEigenPrimitive + ?Sized> {
    solver: &'a S,
    n_components: usize,
    parallel: bool,
}

impl<'a, S: SparseEigenPrimitive + ?Sized> GridEngine<'a, S> {
    pub fn new(solver: &'a S, n_components: usize, parallel: bool) -> Self {
        Self {
            solver,
            n_components,
            parallel,
        }
    }

    /// Evaluates every grid point. Output order is grid order regardless of
    /// how the work was scheduled.
    ///
    /// # Errors
    /// `EmptyGridResult` if the solver failed at every grid point.
    pub fn evaluate(&self, contrast_builder: &ContrastBuilder, grid: &HyperparameterGrid) -> Result<GridEvaluation> {
        let points = grid.points();
        info!(
            "Evaluating {} grid points ({} contrasts x {} penalties), {} components each.",
            points.len(),
            grid.contrasts().len(),
            grid.penalties().len(),
            self.n_components
        );
        let start_time = std::time::Instant::now();

        let evaluate_point = |point: &GridPoint| self.evaluate_point(contrast_builder, point);
        let results: Vec<Result<CandidateSolution>> = if self.parallel {
            points.par_iter().map(evaluate_point).collect()
        } else {
            points.iter().map(evaluate_point).collect()
        };

        let mut candidates = Vec::with_capacity(results.len());
        let mut warnings = Vec::new();
        for result in results {
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(err) => match SearchWarning::from_solver_failure(&err) {
                    Some(warning) => {
                        warn!("{}", warning);
                        warnings.push(warning);
                    }
                    None => return Err(err),
                },
            }
        }

        if candidates.is_empty() {
            return Err(ScpcaError::EmptyGridResult { attempted: points.len() });
        }
        info!(
            "Grid evaluation finished in {:?}: {} of {} points produced loadings.",
            start_time.elapsed(),
            candidates.len(),
            points.len()
        );

        Ok(GridEvaluation {
            candidates,
            warnings,
            n_grid_points: points.len(),
        })
    }

    fn evaluate_point(&self, contrast_builder: &ContrastBuilder, point: &GridPoint) -> Result<CandidateSolution> {
        let solver_failure = |source: ThreadSafeStdError| ScpcaError::SolverFailure {
            grid_index: point.id.0,
            contrast: point.contrast,
            penalty: point.penalty,
            source,
        };

        let contrastive_covariance = contrast_builder.contrastive_covariance(point.contrast);
        let output = self
            .solver
            .solve(contrastive_covariance.view(), point.penalty, self.n_components)
            .map_err(solver_failure)?;

        let n_features = contrast_builder.n_features();
        if output.loadings.dim() != (n_features, self.n_components) || output.eigenvalues.len() != self.n_components {
            return Err(solver_failure(
                format!(
                    "solver returned loadings of shape {:?} and {} eigenvalues, expected ({}, {}) and {}",
                    output.loadings.dim(),
                    output.eigenvalues.len(),
                    n_features,
                    self.n_components,
                    self.n_components
                )
                .into(),
            ));
        }
        if output.loadings.iter().chain(output.eigenvalues.iter()).any(|v| !v.is_finite()) {
            return Err(solver_failure("solver returned non-finite values".into()));
        }

        debug!(
            "Grid point {} (contrast={}, penalty={}): {} non-zero loadings.",
            point.id.0,
            point.contrast,
            point.penalty,
            output.loadings.iter().filter(|v| **v != 0.0).count()
        );
        Ok(CandidateSolution {
            grid_point: *point,
            loadings: output.loadings,
            eigenvalues: output.eigenvalues,
        })
    }
}
