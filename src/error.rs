// src/error.rs

use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;

/// A thread-safe wrapper for standard dynamic errors,
/// so they implement `Send` and `Sync`.
///
/// Capability implementations (solvers, clusterers, linear-algebra backends)
/// report failures with this type.
pub type ThreadSafeStdError = Box<dyn Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, ScpcaError>;

/// Every failure kind the search can produce.
///
/// `SolverFailure` and `DegenerateClusteringFailure` are per-unit failures:
/// the search recovers from them and reports them as [`SearchWarning`]s.
/// All other variants abort the search.
#[derive(Debug, Error)]
pub enum ScpcaError {
    #[error("dimension mismatch: {context} (expected {expected}, found {found})")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{matrix} matrix has {rows} rows; at least 2 observations are required")]
    InsufficientObservations { matrix: &'static str, rows: usize },

    #[error("{matrix} matrix contains non-finite values")]
    NonFiniteInput { matrix: &'static str },

    #[error("invalid hyperparameter grid: {0}")]
    InvalidGrid(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("sparse eigensolver failed at grid point {grid_index} (contrast={contrast}, penalty={penalty}): {source}")]
    SolverFailure {
        grid_index: usize,
        contrast: f64,
        penalty: f64,
        #[source]
        source: ThreadSafeStdError,
    },

    #[error("degenerate clustering: {reason}")]
    DegenerateClusteringFailure { reason: String },

    #[error("all {attempted} grid points failed in the sparse eigensolver")]
    EmptyGridResult { attempted: usize },

    #[error("none of the {candidates} unique solutions produced a finite clustering score")]
    NoViableSolution { candidates: usize },

    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// A recovered, per-unit failure attached to a successful search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SearchWarning {
    /// The grid point was dropped from the candidate set.
    SolverFailure {
        grid_index: usize,
        contrast: f64,
        penalty: f64,
        message: String,
    },
    /// The unique solution (identified by its canonical grid point) scored
    /// negative infinity on the whole target (`fold == None`) or on one fold.
    DegenerateClustering {
        canonical_grid_index: usize,
        fold: Option<usize>,
        message: String,
    },
}

impl SearchWarning {
    pub(crate) fn from_solver_failure(err: &ScpcaError) -> Option<Self> {
        match err {
            ScpcaError::SolverFailure {
                grid_index,
                contrast,
                penalty,
                source,
            } => Some(SearchWarning::SolverFailure {
                grid_index: *grid_index,
                contrast: *contrast,
                penalty: *penalty,
                message: source.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for SearchWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchWarning::SolverFailure {
                grid_index,
                contrast,
                penalty,
                message,
            } => write!(
                f,
                "grid point {} (contrast={}, penalty={}) dropped: {}",
                grid_index, contrast, penalty, message
            ),
            SearchWarning::DegenerateClustering {
                canonical_grid_index,
                fold: Some(fold),
                message,
            } => write!(
                f,
                "solution at grid point {} scored -inf on fold {}: {}",
                canonical_grid_index, fold, message
            ),
            SearchWarning::DegenerateClustering {
                canonical_grid_index,
                fold: None,
                message,
            } => write!(
                f,
                "solution at grid point {} scored -inf: {}",
                canonical_grid_index, message
            ),
        }
    }
}
