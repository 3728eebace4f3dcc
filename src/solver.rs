// src/solver.rs

//! The sparse-eigendecomposition capability and its reference implementation.

use log::trace;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ThreadSafeStdError;
use crate::linalg_backends::eigh_descending;

/// Deflated eigenvalues at or below this fraction of the leading one count
/// as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Loadings and eigenvalues returned by a sparse eigensolver for one
/// (matrix, penalty) pair.
#[derive(Debug, Clone)]
pub struct SparseEigenOutput {
    /// Shape: `(n_features, n_components)`. Columns ordered by descending eigenvalue.
    pub loadings: Array2<f64>,
    /// Shape: `(n_components)`.
    pub eigenvalues: Array1<f64>,
}

/// A sparse eigendecomposition of a symmetric (possibly indefinite) matrix.
///
/// Contract: returns `n_components` unit-norm loading vectors that are sparse
/// when `penalty > 0` and are the ordinary leading eigenvectors when
/// `penalty == 0`. The search calls this concurrently from worker threads and
/// treats any `Err` as a failure of that single grid point.
pub trait SparseEigenPrimitive: Sync {
    fn solve(
        &self,
        matrix: ArrayView2<f64>,
        penalty: f64,
        n_components: usize,
    ) -> Result<SparseEigenOutput, ThreadSafeStdError>;
}

/// Soft-thresholded power iteration with projection deflation.
///
/// For `penalty > 0` each component is found by iterating
/// `v <- S(C+ v) / |S(C+ v)|` where `C+` is the positive part of the
/// (deflated) matrix and `S` soft-thresholds every entry by `penalty`.
/// When the threshold removes every entry only the largest-magnitude entry
/// is kept, so extreme penalties produce one non-zero per component.
/// Asking for more components than the positive part has positive
/// directions is an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdedPowerSolver {
    /// Maximum number of power iterations per component.
    pub max_iterations: usize,
    /// Convergence threshold on the L2 change of the loading vector.
    pub tolerance: f64,
}

impl Default for ThresholdedPowerSolver {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            tolerance: 1e-7,
        }
    }
}

impl ThresholdedPowerSolver {
    pub fn new(max_iterations: usize, tolerance: f64) -> Self {
        Self { max_iterations, tolerance }
    }

    fn sparse_components(
        &self,
        matrix: ArrayView2<f64>,
        penalty: f64,
        n_components: usize,
    ) -> Result<Array2<f64>, ThreadSafeStdError> {
        let n_features = matrix.nrows();
        let mut deflated = positive_part(matrix)?;
        let mut loadings = Array2::<f64>::zeros((n_features, n_components));
        let mut leading_eigenvalue = None;

        for component in 0..n_components {
            let eig = eigh_descending(deflated.view())?;
            let top = eig.eigenvalues[0];
            let reference = *leading_eigenvalue.get_or_insert(top);
            if !(top > RANK_TOLERANCE * reference.max(1.0)) {
                return Err(format!(
                    "Positive part of the matrix has rank {} but {} components were requested (penalty={}).",
                    component, n_components, penalty
                )
                .into());
            }
            let start = eig.eigenvectors.column(0).to_owned();

            let mut v = soft_threshold_normalized(deflated.dot(&start).view(), penalty, start.view());
            let mut converged = false;
            for iteration in 0..self.max_iterations {
                let next = soft_threshold_normalized(deflated.dot(&v).view(), penalty, v.view());
                let change = (&next - &v).mapv(|d| d * d).sum().sqrt();
                v = next;
                if change < self.tolerance {
                    trace!(
                        "Component {} converged after {} iterations (penalty={}).",
                        component,
                        iteration + 1,
                        penalty
                    );
                    converged = true;
                    break;
                }
            }
            if !converged {
                return Err(format!(
                    "Thresholded power iteration for component {} did not converge within {} iterations (penalty={}).",
                    component, self.max_iterations, penalty
                )
                .into());
            }

            loadings.column_mut(component).assign(&v);
            deflated = project_out(deflated, v.view());
        }

        Ok(loadings)
    }
}

impl SparseEigenPrimitive for ThresholdedPowerSolver {
    fn solve(
        &self,
        matrix: ArrayView2<f64>,
        penalty: f64,
        n_components: usize,
    ) -> Result<SparseEigenOutput, ThreadSafeStdError> {
        let n_features = matrix.nrows();
        if matrix.ncols() != n_features {
            return Err(format!("Expected a square matrix, got {}x{}.", n_features, matrix.ncols()).into());
        }
        if n_components == 0 || n_components > n_features {
            return Err(format!(
                "Requested {} components from a {}x{} matrix.",
                n_components, n_features, n_features
            )
            .into());
        }
        if !(penalty >= 0.0 && penalty.is_finite()) {
            return Err(format!("Penalty must be finite and non-negative, got {}.", penalty).into());
        }

        let loadings = if penalty == 0.0 {
            eigh_descending(matrix)?
                .eigenvectors
                .slice(s![.., ..n_components])
                .to_owned()
        } else {
            self.sparse_components(matrix, penalty, n_components)?
        };

        // Rayleigh quotients on the undeflated matrix.
        let eigenvalues: Array1<f64> = loadings
            .axis_iter(Axis(1))
            .map(|v| v.dot(&matrix.dot(&v)))
            .collect();

        let mut order: Vec<usize> = (0..n_components).collect();
        order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

        Ok(SparseEigenOutput {
            loadings: loadings.select(Axis(1), &order),
            eigenvalues: order.iter().map(|&i| eigenvalues[i]).collect(),
        })
    }
}

/// `V max(L, 0) V^T`: drops the directions where the background dominates.
fn positive_part(matrix: ArrayView2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
    let eig = eigh_descending(matrix)?;
    let clipped = eig.eigenvalues.mapv(|l| l.max(0.0));
    let scaled = &eig.eigenvectors * &clipped;
    Ok(scaled.dot(&eig.eigenvectors.t()))
}

/// `(I - vv^T) C (I - vv^T)`.
fn project_out(matrix: Array2<f64>, v: ArrayView1<f64>) -> Array2<f64> {
    let cv = matrix.dot(&v);
    let vcv = v.dot(&cv);
    let v_col = v.insert_axis(Axis(1));
    let cv_col = cv.view().insert_axis(Axis(1));
    let mut out = matrix;
    out -= &v_col.dot(&cv_col.t());
    out -= &cv_col.dot(&v_col.t());
    out.scaled_add(vcv, &v_col.dot(&v_col.t()));
    out
}

/// Soft-thresholds `x` by `penalty` and normalizes to unit length. Falls back
/// to the single largest-magnitude entry when nothing survives, and to
/// `previous` when `x` is identically zero.
fn soft_threshold_normalized<'a>(x: ArrayView1<'a, f64>, penalty: f64, previous: ArrayView1<'a, f64>) -> Array1<f64> {
    let mut thresholded = x.mapv(|value| value.signum() * (value.abs() - penalty).max(0.0));
    let mut norm = thresholded.dot(&thresholded).sqrt();

    if norm == 0.0 {
        let source = if x.iter().any(|&value| value != 0.0) { x } else { previous };
        let (argmax, &value) = match source
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.abs().total_cmp(&b.abs()))
        {
            Some(found) => found,
            None => return thresholded,
        };
        thresholded.fill(0.0);
        thresholded[argmax] = if value < 0.0 { -1.0 } else { 1.0 };
        norm = 1.0;
    }

    thresholded / norm
}
