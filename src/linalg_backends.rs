// src/linalg_backends.rs

use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::marker::PhantomData;

use crate::error::ThreadSafeStdError;

/// Dispatches symmetric eigendecompositions to the backend selected by
/// compile-time feature flags (`backend_faer` or one of the LAPACK backends
/// of `ndarray-linalg`).
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

/// Output of a symmetric eigendecomposition.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues, in the order the backend returns them (ascending for LAPACK).
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns of the matrix.
    /// eigenvectors.column(i) corresponds to eigenvalues[i].
    pub eigenvectors: Array2<F>,
}

/// Trait for symmetric eigendecomposition (LAPACK `DSYEVD` semantics).
/// Implementers read the upper triangle of `matrix`.
pub trait BackendEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError>;
}

/// Symmetric eigendecomposition with the eigenpairs reordered by descending
/// eigenvalue. Indefinite input is fine; negative eigenvalues sort last.
pub fn eigh_descending(matrix: ArrayView2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(format!(
            "Matrix must be square for eigendecomposition, got {}x{}.",
            matrix.nrows(),
            matrix.ncols()
        )
        .into());
    }
    let backend = LinAlgBackendProvider::<f64>::new();
    let EighOutput { eigenvalues, eigenvectors } = backend.eigh_upper(&matrix.to_owned())?;

    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigenvalues[b].total_cmp(&eigenvalues[a]));

    Ok(EighOutput {
        eigenvalues: order.iter().map(|&i| eigenvalues[i]).collect(),
        eigenvectors: eigenvectors.select(Axis(1), &order),
    })
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{Eigh as NdLinalgEigh, UPLO};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendEigh<f64> for NdarrayLinAlgBackend {
    fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
        if matrix.is_empty() {
            return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
        }
        let (eigenvalues, eigenvectors) = matrix.eigh(UPLO::Upper).map_err(to_dyn_error)?;
        Ok(EighOutput { eigenvalues, eigenvectors })
    }
}

// --- FaerLinAlgBackend Implementation ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendEigh, EighOutput};
    use crate::error::ThreadSafeStdError;
    use bytemuck::Pod;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn faer_mat_to_ndarray<F: ComplexField + Copy + Pod + Zero>(faer_mat: MatRef<'_, F>) -> Array2<F> {
        let nrows = faer_mat.nrows();
        let ncols = faer_mat.ncols();
        if nrows == 0 || ncols == 0 {
            return Array2::zeros((nrows, ncols).f());
        }
        Array2::from_shape_fn((nrows, ncols).f(), |(i, j)| unsafe { *faer_mat.get_unchecked(i, j) })
    }

    fn faer_col_to_ndarray_vec<F: ComplexField + Copy + Pod + Zero>(faer_col: faer::ColRef<'_, F>) -> Array1<F> {
        Array1::from_shape_fn(faer_col.nrows(), |i| unsafe { *faer_col.get_unchecked(i) })
    }

    impl BackendEigh<f64> for FaerLinAlgBackend {
        fn eigh_upper(&self, matrix: &Array2<f64>) -> Result<EighOutput<f64>, ThreadSafeStdError> {
            if matrix.nrows() != matrix.ncols() {
                return Err("Matrix must be square for eigendecomposition.".into());
            }
            if matrix.is_empty() {
                return Ok(EighOutput { eigenvalues: Array1::zeros(0), eigenvectors: Array2::zeros((0, 0)) });
            }
            let n = matrix.nrows();
            let contiguous = matrix.as_standard_layout();
            let slice = contiguous
                .as_slice()
                .ok_or_else(|| -> ThreadSafeStdError { "Failed to obtain a contiguous slice for faer.".into() })?;
            let faer_mat_view = MatRef::from_row_major_slice(slice, n, n);
            let eig = faer_mat_view
                .as_ref()
                .self_adjoint_eigen(faer::Side::Upper)
                .map_err(|e| -> ThreadSafeStdError { format!("faer eigendecomposition failed: {e:?}").into() })?;
            let eigenvalues_faer_colref = eig.S().column_vector();
            let eigenvectors_faer_matref = eig.U();
            Ok(EighOutput {
                eigenvalues: faer_col_to_ndarray_vec(eigenvalues_faer_colref.as_ref()),
                eigenvectors: faer_mat_to_ndarray(eigenvectors_faer_matref.as_ref()),
            })
        }
    }
}

#[cfg(feature = "backend_faer")]
impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    faer_specific_code::FaerLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError> {
        faer_specific_code::FaerLinAlgBackend.eigh_upper(matrix)
    }
}

#[cfg(not(feature = "backend_faer"))]
impl<F> BackendEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    NdarrayLinAlgBackend: BackendEigh<F>,
{
    fn eigh_upper(&self, matrix: &Array2<F>) -> Result<EighOutput<F>, ThreadSafeStdError> {
        NdarrayLinAlgBackend.eigh_upper(matrix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn eigh_descending_orders_eigenpairs() {
        let m = array![[2.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 5.0]];
        let out = eigh_descending(m.view()).unwrap();
        assert_abs_diff_eq!(out.eigenvalues[0], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.eigenvalues[1], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.eigenvalues[2], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.eigenvectors[[2, 0]].abs(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.eigenvectors[[0, 1]].abs(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out.eigenvectors[[1, 2]].abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn provider_dispatches_to_enabled_backend() {
        let m = array![[2.0, 1.0], [1.0, 2.0]];
        let out = LinAlgBackendProvider::<f64>::new().eigh_upper(&m).unwrap();
        let mut eigenvalues = out.eigenvalues.to_vec();
        eigenvalues.sort_by(f64::total_cmp);
        assert_abs_diff_eq!(eigenvalues[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(eigenvalues[1], 3.0, epsilon = 1e-12);
        assert_eq!(out.eigenvectors.dim(), (2, 2));
    }

    #[test]
    fn eigh_descending_rejects_non_square() {
        let m = Array2::<f64>::zeros((2, 3));
        assert!(eigh_descending(m.view()).is_err());
    }

    #[test]
    fn eigh_reconstructs_symmetric_matrix() {
        let m = array![[4.0, 1.0, 0.5], [1.0, 3.0, 0.2], [0.5, 0.2, 1.0]];
        let out = eigh_descending(m.view()).unwrap();
        let recon = out
            .eigenvectors
            .dot(&Array2::from_diag(&out.eigenvalues))
            .dot(&out.eigenvectors.t());
        for (a, b) in recon.iter().zip(m.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
    }
}
