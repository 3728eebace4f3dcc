// Sparse contrastive principal component analysis (scPCA)

#![doc = include_str!("../README.md")]

pub mod clustering;
pub mod covariance;
pub mod dedup;
pub mod error;
pub mod grid;
pub mod linalg_backends;
pub mod scoring;
pub mod search;
pub mod selection;
pub mod solver;

pub use clustering::{ClusterQualityCriterion, ClusteringPrimitive, KMeans};
pub use covariance::{ContrastBuilder, CovarianceBuilder};
pub use dedup::{Deduplicator, UniqueSolution, UniqueSolutionSet};
pub use error::{Result, ScpcaError, SearchWarning, ThreadSafeStdError};
pub use grid::{CandidateSolution, GridEngine, GridPoint, GridPointId, HyperparameterGrid};
pub use scoring::{ClusterScorer, CrossValidatedScorer, ScoredSolution};
pub use search::{search, ContrastiveSearch, SearchConfig, SelectionResult};
pub use selection::{RankedEntry, Selector};
pub use solver::{SparseEigenOutput, SparseEigenPrimitive, ThresholdedPowerSolver};
