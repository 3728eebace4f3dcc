// In tests/search_tests.rs

use ndarray::{s, Array2, ArrayView2, Axis};
use ndarray_linalg::SVD;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use sparse_cpca::dedup::sign_normalize;
use sparse_cpca::scoring::ClusterScorer;
use sparse_cpca::{
    search, ClusterQualityCriterion, ContrastiveSearch, KMeans, ScpcaError, SearchConfig, SearchWarning,
    ThresholdedPowerSolver,
};

const N_PER_GROUP: usize = 25;
const N_SIGNAL_VARS: usize = 20;
const N_VARS: usize = 30;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Four groups in the target, separated along two latent factors carried by
/// variables 0..10 and 10..20. Variables 20..30 hold one strong nuisance
/// factor that the background shares. Signal variables in the background are
/// pure noise.
fn four_group_scenario(seed: u64) -> (Array2<f64>, Array2<f64>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let standard = Normal::new(0.0, 1.0).unwrap();
    let n_target = 4 * N_PER_GROUP;
    let n_background = 100;

    let mut labels = Vec::with_capacity(n_target);
    let mut target = Array2::<f64>::zeros((n_target, N_VARS));
    for (i, mut row) in target.axis_iter_mut(Axis(0)).enumerate() {
        let group = i / N_PER_GROUP;
        labels.push(group);
        let latent_a = if group % 2 == 0 { -6.0 } else { 6.0 };
        let latent_b = if group / 2 == 0 { -4.0 } else { 4.0 };
        let nuisance: f64 = standard.sample(&mut rng);
        for j in 0..N_VARS {
            let structure = match j {
                0..=9 => latent_a,
                10..=19 => latent_b,
                _ => 7.0 * nuisance,
            };
            row[j] = structure + standard.sample(&mut rng);
        }
    }

    let mut background = Array2::<f64>::zeros((n_background, N_VARS));
    for mut row in background.axis_iter_mut(Axis(0)) {
        let nuisance: f64 = standard.sample(&mut rng);
        for j in 0..N_VARS {
            let structure = if j >= N_SIGNAL_VARS { 7.0 * nuisance } else { 0.0 };
            row[j] = structure + standard.sample(&mut rng);
        }
    }
    (target, background, labels)
}

fn scenario_config() -> SearchConfig {
    SearchConfig {
        contrasts: vec![0.0, 1.0, 10.0, 100.0],
        penalties: vec![0.0, 0.5, 1.0],
        n_centers: 4,
        n_components: 2,
        random_seed: 7,
        return_diagnostics: true,
        ..SearchConfig::default()
    }
}

fn centered(x: ArrayView2<f64>) -> Array2<f64> {
    let mean = x.mean_axis(Axis(0)).unwrap();
    &x - &mean
}

fn assert_columns_match_up_to_sign(a: ArrayView2<f64>, b: ArrayView2<f64>, tolerance: f64) {
    assert_eq!(a.dim(), b.dim());
    for (j, (col_a, col_b)) in a.axis_iter(Axis(1)).zip(b.axis_iter(Axis(1))).enumerate() {
        let same = (&col_a - &col_b).iter().all(|d| d.abs() < tolerance);
        let flipped = (&col_a + &col_b).iter().all(|d| d.abs() < tolerance);
        assert!(same || flipped, "Column {} differs beyond sign: {:?} vs {:?}", j, col_a, col_b);
    }
}

#[test]
fn contrastive_search_recovers_target_specific_groups() {
    init_logging();
    let (target, background, _) = four_group_scenario(11);
    let result = ContrastiveSearch::new(scenario_config())
        .run(
            target.view(),
            background.view(),
            &ThresholdedPowerSolver::default(),
            &KMeans::default(),
        )
        .unwrap();

    assert!(result.contrast > 0.0, "selected contrast {}", result.contrast);
    assert!(result.best_score > 0.7, "best score {}", result.best_score);
    for (j, column) in result.loadings.axis_iter(Axis(1)).enumerate() {
        let total: f64 = column.iter().map(|v| v * v).sum();
        let signal: f64 = column.slice(s![..N_SIGNAL_VARS]).iter().map(|v| v * v).sum();
        assert!(signal / total > 0.9, "component {} keeps {:.3} of its mass on signal variables", j, signal / total);
    }

    let ranked = result.ranked.as_ref().unwrap();
    let plain_pca = ranked.iter().find(|r| r.member_grid_indices.contains(&0)).unwrap();
    assert!(plain_pca.score < result.best_score);
}

#[test]
fn zero_contrast_and_penalty_is_ordinary_pca() {
    init_logging();
    let (target, background, _) = four_group_scenario(3);
    let config = SearchConfig {
        contrasts: vec![0.0],
        penalties: vec![0.0],
        ..scenario_config()
    };
    let result = ContrastiveSearch::new(config)
        .run(
            target.view(),
            background.view(),
            &ThresholdedPowerSolver::default(),
            &KMeans::default(),
        )
        .unwrap();

    let (_, singular_values, vt) = centered(target.view()).svd(false, true).unwrap();
    let vt = vt.unwrap();
    let pca_loadings = vt.slice(s![..2, ..]).t().to_owned();
    assert_columns_match_up_to_sign(result.loadings.view(), pca_loadings.view(), 1e-6);

    let n = target.nrows() as f64;
    for k in 0..2 {
        let variance = singular_values[k] * singular_values[k] / (n - 1.0);
        assert!((result.eigenvalues[k] - variance).abs() < 1e-6 * variance);
    }
}

#[test]
fn every_grid_point_is_attributed_once() {
    init_logging();
    let (target, background, _) = four_group_scenario(5);
    let search = ContrastiveSearch::new(scenario_config());
    let builder = search.prepare(target.view(), background.view()).unwrap();
    let evaluation = search.evaluate_grid(&builder, &ThresholdedPowerSolver::default()).unwrap();
    let candidates = evaluation.candidates.clone();
    let unique = search.deduplicate(evaluation.candidates);

    assert!(unique.len() <= evaluation.n_grid_points);
    for candidate in &candidates {
        let index = candidate.grid_point.id.0;
        let owners: Vec<_> = unique
            .entries
            .iter()
            .filter(|e| e.members.iter().any(|m| m.id.0 == index))
            .collect();
        assert_eq!(owners.len(), 1, "grid point {} attributed {} times", index, owners.len());
        let (normalized, _) = sign_normalize(candidate.loadings.view(), &candidate.eigenvalues);
        let diff = (&normalized - &owners[0].loadings).mapv(f64::abs);
        assert!(diff.iter().all(|&d| d <= 1e-5));
    }
    for entry in &unique.entries {
        assert_eq!(entry.members[0], entry.canonical);
        assert!(entry.members.windows(2).all(|w| w[0].id < w[1].id));
    }
}

#[test]
fn repeated_runs_are_deterministic() {
    init_logging();
    let (target, background, _) = four_group_scenario(9);
    let run = |parallel: bool, num_threads: Option<usize>| {
        let config = SearchConfig {
            cv_folds: 3,
            parallel,
            num_threads,
            ..scenario_config()
        };
        ContrastiveSearch::new(config)
            .run(
                target.view(),
                background.view(),
                &ThresholdedPowerSolver::default(),
                &KMeans::default(),
            )
            .unwrap()
    };

    let first = run(true, None);
    let again = run(true, None);
    let sequential = run(false, None);
    let two_threads = run(true, Some(2));

    for other in [&again, &sequential, &two_threads] {
        assert_eq!(first.grid_point, other.grid_point);
        assert_eq!(first.n_unique_solutions, other.n_unique_solutions);
        assert!((first.best_score - other.best_score).abs() < 1e-10);
        assert!((&first.loadings - &other.loadings).iter().all(|d| d.abs() < 1e-10));
        assert_eq!(first.fold_scores.as_ref().map(Vec::len), Some(3));
    }
}

#[test]
fn single_fold_equals_plain_scoring() {
    init_logging();
    let (target, background, _) = four_group_scenario(13);
    let config = SearchConfig {
        cv_folds: 1,
        ..scenario_config()
    };
    let search = ContrastiveSearch::new(config.clone());
    let kmeans = KMeans::default();
    let builder = search.prepare(target.view(), background.view()).unwrap();
    let unique = search.deduplicate(
        search
            .evaluate_grid(&builder, &ThresholdedPowerSolver::default())
            .unwrap()
            .candidates,
    );

    let cross_validated = search.score(&builder, unique.clone(), &kmeans).unwrap();
    let plain = ClusterScorer::new(&kmeans, config.n_centers, config.criterion, config.random_seed)
        .score(builder.target(), unique);

    assert_eq!(cross_validated.scored.len(), plain.scored.len());
    for (a, b) in cross_validated.scored.iter().zip(plain.scored.iter()) {
        assert_eq!(a.solution.canonical, b.solution.canonical);
        assert_eq!(a.score, b.score);
        assert!(a.fold_scores.is_none());
    }
}

#[test]
fn extreme_penalty_gives_single_variable_components() {
    init_logging();
    let (target, background, _) = four_group_scenario(17);
    let config = SearchConfig {
        contrasts: vec![5.0],
        penalties: vec![1000.0],
        ..scenario_config()
    };
    let result = ContrastiveSearch::new(config)
        .run(
            target.view(),
            background.view(),
            &ThresholdedPowerSolver::default(),
            &KMeans::default(),
        )
        .unwrap();

    for column in result.loadings.axis_iter(Axis(1)) {
        assert!(column.iter().filter(|v| **v != 0.0).count() <= 1);
    }
    let ranked = result.ranked.unwrap();
    assert_eq!(ranked.len(), 1);
    assert!(ranked[0].nonzero_loadings.iter().all(|&n| n <= 1));
    assert_eq!(ranked[0].canonical.penalty, 1000.0);
}

#[test]
fn more_centers_than_rows_has_no_viable_solution() {
    init_logging();
    let (target, background, _) = four_group_scenario(19);
    let small_target = target.slice(s![..6, ..]).to_owned();
    let result = search(
        small_target.view(),
        background.view(),
        &[0.0, 1.0],
        &[0.0],
        10,
        2,
        true,
        false,
        1,
        0,
        &KMeans::default(),
        &ThresholdedPowerSolver::default(),
        true,
    );
    assert!(matches!(result, Err(ScpcaError::NoViableSolution { .. })));
}

#[test]
fn returned_scores_are_the_projected_target() {
    init_logging();
    let (target, background, _) = four_group_scenario(23);
    for scale in [false, true] {
        let config = SearchConfig {
            scale,
            ..scenario_config()
        };
        let result = ContrastiveSearch::new(config)
            .run(
                target.view(),
                background.view(),
                &ThresholdedPowerSolver::default(),
                &KMeans::default(),
            )
            .unwrap();

        let mut preprocessed = centered(target.view());
        if scale {
            let std = target.std_axis(Axis(0), 1.0);
            preprocessed /= &std;
        }
        let projected = preprocessed.dot(&result.loadings);
        assert_eq!(projected.dim(), result.scores.dim());
        assert!((&projected - &result.scores).iter().all(|d| d.abs() < 1e-8));
    }
}

#[test]
fn known_labels_score_against_the_true_partition() {
    init_logging();
    let (target, background, labels) = four_group_scenario(29);
    let config = SearchConfig {
        known_labels: Some(labels),
        criterion: ClusterQualityCriterion::CalinskiHarabasz,
        ..scenario_config()
    };
    let result = ContrastiveSearch::new(config)
        .run(
            target.view(),
            background.view(),
            &ThresholdedPowerSolver::default(),
            &KMeans::default(),
        )
        .unwrap();
    assert!(result.contrast > 0.0);
    assert!(!result
        .warnings
        .iter()
        .any(|w| matches!(w, SearchWarning::DegenerateClustering { .. })));
}

#[test]
fn mismatched_columns_are_rejected() {
    let (target, background, _) = four_group_scenario(31);
    let narrow = background.slice(s![.., ..10]).to_owned();
    let result = ContrastiveSearch::new(scenario_config()).run(
        target.view(),
        narrow.view(),
        &ThresholdedPowerSolver::default(),
        &KMeans::default(),
    );
    assert!(matches!(
        result,
        Err(ScpcaError::DimensionMismatch { expected: 30, found: 10, .. })
    ));

    let one_row = target.slice(s![..1, ..]).to_owned();
    let result = ContrastiveSearch::new(scenario_config()).run(
        one_row.view(),
        background.view(),
        &ThresholdedPowerSolver::default(),
        &KMeans::default(),
    );
    assert!(matches!(result, Err(ScpcaError::InsufficientObservations { .. })));
}
