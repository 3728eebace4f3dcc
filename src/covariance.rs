// src/covariance.rs

//! Column preprocessing, sample covariances and contrastive covariance matrices.

use log::debug;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::error::{Result, ScpcaError};

/// Standard deviations at or below this value are treated as constant
/// columns and left unscaled.
const MIN_SCALE: f64 = 1e-9;

/// Applies per-column centering / scaling and computes the sample covariance
/// matrices of the target and background data.
#[derive(Debug, Clone, Copy)]
pub struct CovarianceBuilder {
    center: bool,
    scale: bool,
}

impl Default for CovarianceBuilder {
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl CovarianceBuilder {
    pub fn new(center: bool, scale: bool) -> Self {
        Self { center, scale }
    }

    /// Validates the inputs, preprocesses both matrices independently and
    /// computes `Cov(target)` and `Cov(background)` once.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the column counts differ.
    /// - `InsufficientObservations` if either matrix has fewer than 2 rows.
    /// - `NonFiniteInput` if either matrix holds NaN or infinite values.
    pub fn build(
        &self,
        target: ArrayView2<f64>,
        background: ArrayView2<f64>,
    ) -> Result<ContrastBuilder> {
        if target.ncols() != background.ncols() {
            return Err(ScpcaError::DimensionMismatch {
                context: "background column count must equal target column count",
                expected: target.ncols(),
                found: background.ncols(),
            });
        }
        validate_matrix("target", target)?;
        validate_matrix("background", background)?;

        let target_preprocessed = self.preprocess(target);
        let background_preprocessed = self.preprocess(background);

        let target_covariance = sample_covariance(target_preprocessed.view());
        let background_covariance = sample_covariance(background_preprocessed.view());
        debug!(
            "Computed {}x{} covariances from {} target and {} background observations.",
            target.ncols(),
            target.ncols(),
            target.nrows(),
            background.nrows()
        );

        Ok(ContrastBuilder {
            target: target_preprocessed,
            target_covariance,
            background_covariance,
        })
    }

    fn preprocess(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut x_preprocessed = x.to_owned();

        if self.center {
            // validate_matrix guarantees at least two rows, so the mean exists.
            let mean: Array1<f64> = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
            x_preprocessed
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .for_each(|mut row| {
                    row -= &mean;
                });
        }

        if self.scale {
            let std_dev = x
                .std_axis(Axis(0), 1.0)
                .mapv(|s| if s.is_finite() && s > MIN_SCALE { s } else { 1.0 });
            x_preprocessed
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .for_each(|mut row| {
                    row /= &std_dev;
                });
        }

        x_preprocessed
    }
}

fn validate_matrix(name: &'static str, x: ArrayView2<f64>) -> Result<()> {
    if x.nrows() < 2 {
        return Err(ScpcaError::InsufficientObservations {
            matrix: name,
            rows: x.nrows(),
        });
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(ScpcaError::NonFiniteInput { matrix: name });
    }
    Ok(())
}

/// Sample covariance with an `n - 1` denominator. Columns are centered
/// internally, so the result does not depend on prior centering.
pub fn sample_covariance(x: ArrayView2<f64>) -> Array2<f64> {
    let n_samples = x.nrows();
    let mean = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()));
    let centered = &x - &mean;
    let mut cov = centered.t().dot(&centered);
    cov /= (n_samples.max(2) - 1) as f64;
    cov
}

/// Holds the preprocessed target and both covariances; produces the
/// contrastive covariance `Cov(X) - alpha * Cov(Y)` for any contrast value.
#[derive(Debug, Clone)]
pub struct ContrastBuilder {
    target: Array2<f64>,
    target_covariance: Array2<f64>,
    background_covariance: Array2<f64>,
}

impl ContrastBuilder {
    /// The contrastive covariance for `contrast`. Symmetric, and indefinite
    /// whenever the background dominates some direction.
    pub fn contrastive_covariance(&self, contrast: f64) -> Array2<f64> {
        let mut c = self.target_covariance.clone();
        if contrast != 0.0 {
            c.scaled_add(-contrast, &self.background_covariance);
        }
        c
    }

    /// The centered/scaled target that all projections use.
    pub fn target(&self) -> ArrayView2<'_, f64> {
        self.target.view()
    }

    pub fn target_covariance(&self) -> &Array2<f64> {
        &self.target_covariance
    }

    pub fn background_covariance(&self) -> &Array2<f64> {
        &self.background_covariance
    }

    pub fn n_features(&self) -> usize {
        self.target.ncols()
    }

    pub fn n_target_samples(&self) -> usize {
        self.target.nrows()
    }
}
