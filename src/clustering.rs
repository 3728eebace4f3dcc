// src/clustering.rs

//! The clustering capability, a seeded k-means reference implementation and
//! the partition-quality criteria used for scoring.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ScpcaError, ThreadSafeStdError};

const NUMERICAL_EPS: f64 = 1e-12;

/// Partitions the rows of `points` into at most `n_centers` groups.
///
/// Returns one label per row, each in `0..n_centers`. Implementations must be
/// deterministic for a given `seed`; the search calls this from worker
/// threads.
pub trait ClusteringPrimitive: Sync {
    fn cluster(
        &self,
        points: ArrayView2<f64>,
        n_centers: usize,
        seed: u64,
    ) -> Result<Vec<usize>, ThreadSafeStdError>;
}

/// How a partition of the projected target is scored. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClusterQualityCriterion {
    /// Mean silhouette width over all observations, Euclidean distance.
    #[default]
    AverageSilhouette,
    /// Ratio of between- to within-cluster dispersion.
    CalinskiHarabasz,
}

impl ClusterQualityCriterion {
    /// Scores `labels` as a partition of the rows of `points`.
    ///
    /// # Errors
    /// `DegenerateClusteringFailure` when fewer than two clusters are
    /// non-empty, when the label count does not match the row count, or when
    /// the criterion is undefined for the partition.
    pub fn evaluate(&self, points: ArrayView2<f64>, labels: &[usize]) -> Result<f64, ScpcaError> {
        if labels.len() != points.nrows() {
            return Err(degenerate(format!(
                "{} labels for {} observations",
                labels.len(),
                points.nrows()
            )));
        }
        let members = cluster_member_indices(labels);
        let n_nonempty = members.iter().filter(|m| !m.is_empty()).count();
        if n_nonempty < 2 {
            return Err(degenerate(format!(
                "partition has {} non-empty cluster(s); at least 2 are required",
                n_nonempty
            )));
        }

        match self {
            ClusterQualityCriterion::AverageSilhouette => Ok(average_silhouette_width(points, labels, &members)),
            ClusterQualityCriterion::CalinskiHarabasz => calinski_harabasz(points, &members),
        }
    }
}

fn degenerate(reason: String) -> ScpcaError {
    ScpcaError::DegenerateClusteringFailure { reason }
}

fn cluster_member_indices(labels: &[usize]) -> Vec<Vec<usize>> {
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    let mut members = vec![Vec::new(); k];
    for (i, &label) in labels.iter().enumerate() {
        members[label].push(i);
    }
    members
}

fn euclidean_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
}

fn squared_distance(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f64>()
}

/// Observations alone in their cluster contribute a silhouette of 0.
fn average_silhouette_width(points: ArrayView2<f64>, labels: &[usize], members: &[Vec<usize>]) -> f64 {
    let n = points.nrows();
    let mean_distance = |i: usize, indices: &[usize]| -> f64 {
        let (sum, count) = indices
            .iter()
            .filter(|&&j| j != i)
            .fold((0.0, 0usize), |(sum, count), &j| {
                (sum + euclidean_distance(points.row(i), points.row(j)), count + 1)
            });
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    };

    let total: f64 = (0..n)
        .map(|i| {
            let own = labels[i];
            if members[own].len() <= 1 {
                return 0.0;
            }
            let a_i = mean_distance(i, &members[own]);
            let b_i = members
                .iter()
                .enumerate()
                .filter(|(c, m)| *c != own && !m.is_empty())
                .map(|(_, m)| mean_distance(i, m))
                .fold(f64::INFINITY, f64::min);
            let max_ab = a_i.max(b_i);
            if max_ab > NUMERICAL_EPS {
                (b_i - a_i) / max_ab
            } else {
                0.0
            }
        })
        .sum();

    total / n as f64
}

fn calinski_harabasz(points: ArrayView2<f64>, members: &[Vec<usize>]) -> Result<f64, ScpcaError> {
    let n = points.nrows();
    let nonempty: Vec<&Vec<usize>> = members.iter().filter(|m| !m.is_empty()).collect();
    let k = nonempty.len();
    if n <= k {
        return Err(degenerate(format!(
            "Calinski-Harabasz index needs more observations ({}) than clusters ({})",
            n, k
        )));
    }

    let global_mean = points
        .mean_axis(Axis(0))
        .ok_or_else(|| degenerate("no observations".to_string()))?;
    let mut between = 0.0;
    let mut within = 0.0;
    for indices in nonempty {
        let cluster_points = points.select(Axis(0), indices);
        let centroid = cluster_points
            .mean_axis(Axis(0))
            .ok_or_else(|| degenerate("empty cluster".to_string()))?;
        between += indices.len() as f64 * squared_distance(centroid.view(), global_mean.view());
        within += cluster_points
            .axis_iter(Axis(0))
            .map(|row| squared_distance(row, centroid.view()))
            .sum::<f64>();
    }

    if within <= NUMERICAL_EPS {
        return Err(degenerate(
            "Calinski-Harabasz index is undefined for zero within-cluster dispersion".to_string(),
        ));
    }
    Ok((between / (k - 1) as f64) / (within / (n - k) as f64))
}

/// Lloyd's k-means with k-means++ seeding and several restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KMeans {
    /// Maximum Lloyd iterations per restart.
    pub max_iterations: usize,
    /// Number of independent k-means++ initializations; the partition with
    /// the lowest total within-cluster sum of squares is kept.
    pub n_starts: usize,
    /// Stop once no center moves further than this.
    pub tolerance: f64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            n_starts: 10,
            tolerance: 1e-8,
        }
    }
}

/// Result of one k-means run.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub labels: Vec<usize>,
    /// Shape: `(n_centers, n_dims)`.
    pub centers: Array2<f64>,
    pub total_within_ss: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl KMeans {
    /// Runs all restarts and returns the best fit.
    pub fn fit(&self, points: ArrayView2<f64>, n_centers: usize, seed: u64) -> Result<KMeansFit, ThreadSafeStdError> {
        let n = points.nrows();
        if n_centers == 0 || n_centers > n {
            return Err(format!("cannot form {} clusters from {} observations", n_centers, n).into());
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut best: Option<KMeansFit> = None;
        for _ in 0..self.n_starts.max(1) {
            let centers = kmeans_plusplus_init(points, n_centers, &mut rng);
            let fit = self.iterate(points, centers);
            let better = best
                .as_ref()
                .map_or(true, |current| fit.total_within_ss < current.total_within_ss);
            if better {
                best = Some(fit);
            }
        }
        best.ok_or_else(|| "k-means produced no fit".into())
    }

    fn iterate(&self, points: ArrayView2<f64>, mut centers: Array2<f64>) -> KMeansFit {
        let mut labels = assign_clusters(points, centers.view());
        let mut converged = false;
        let mut iterations = 0;

        for iteration in 0..self.max_iterations {
            iterations = iteration + 1;
            let new_centers = update_centers(points, &labels, centers.view());
            let max_movement = centers
                .axis_iter(Axis(0))
                .zip(new_centers.axis_iter(Axis(0)))
                .map(|(old, new)| euclidean_distance(old, new))
                .fold(0.0, f64::max);
            centers = new_centers;
            let new_labels = assign_clusters(points, centers.view());
            let unchanged = new_labels == labels;
            labels = new_labels;
            if unchanged || max_movement < self.tolerance {
                converged = true;
                break;
            }
        }

        let total_within_ss = points
            .axis_iter(Axis(0))
            .zip(labels.iter())
            .map(|(row, &label)| squared_distance(row, centers.row(label)))
            .sum();

        KMeansFit {
            labels,
            centers,
            total_within_ss,
            iterations,
            converged,
        }
    }
}

impl ClusteringPrimitive for KMeans {
    fn cluster(
        &self,
        points: ArrayView2<f64>,
        n_centers: usize,
        seed: u64,
    ) -> Result<Vec<usize>, ThreadSafeStdError> {
        Ok(self.fit(points, n_centers, seed)?.labels)
    }
}

/// First center uniformly at random, the rest with probability proportional
/// to the squared distance to the nearest chosen center.
fn kmeans_plusplus_init(points: ArrayView2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let n = points.nrows();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    chosen.push(rng.gen_range(0..n));

    let mut nearest: Vec<f64> = (0..n)
        .map(|i| squared_distance(points.row(i), points.row(chosen[0])))
        .collect();

    while chosen.len() < k {
        let total: f64 = nearest.iter().sum();
        let next = if total < NUMERICAL_EPS {
            rng.gen_range(0..n)
        } else {
            let target = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            let mut pick = n - 1;
            for (i, &d) in nearest.iter().enumerate() {
                cumulative += d;
                if cumulative >= target && d > 0.0 {
                    pick = i;
                    break;
                }
            }
            pick
        };
        chosen.push(next);
        for (i, d) in nearest.iter_mut().enumerate() {
            *d = d.min(squared_distance(points.row(i), points.row(next)));
        }
    }

    points.select(Axis(0), &chosen)
}

/// Nearest center per row; the lowest center index wins distance ties.
fn assign_clusters(points: ArrayView2<f64>, centers: ArrayView2<f64>) -> Vec<usize> {
    points
        .axis_iter(Axis(0))
        .map(|row| {
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (c, center) in centers.axis_iter(Axis(0)).enumerate() {
                let d = squared_distance(row, center);
                if d < best_distance {
                    best_distance = d;
                    best = c;
                }
            }
            best
        })
        .collect()
}

/// Cluster means; an empty cluster keeps its previous center.
fn update_centers(points: ArrayView2<f64>, labels: &[usize], previous: ArrayView2<f64>) -> Array2<f64> {
    let mut sums = Array2::<f64>::zeros(previous.dim());
    let mut counts = vec![0usize; previous.nrows()];
    for (row, &label) in points.axis_iter(Axis(0)).zip(labels.iter()) {
        let mut sum_row = sums.row_mut(label);
        sum_row += &row;
        counts[label] += 1;
    }
    for (c, mut row) in sums.axis_iter_mut(Axis(0)).enumerate() {
        if counts[c] == 0 {
            row.assign(&previous.row(c));
        } else {
            row /= counts[c] as f64;
        }
    }
    sums
}
