use approx::assert_relative_eq;
use ndarray::Array2;
use terrasource::core::{SlblParams, SlblSolver};
use terrasource::{Deadline, Grid, TerrainError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 5x5 grid: no-data border, zero ring, one raised centre cell
fn pinned_ring_dem() -> Grid {
    let mut data = Array2::from_elem((5, 5), f64::NAN);
    for i in 1..4 {
        for j in 1..4 {
            data[[i, j]] = 0.0;
        }
    }
    data[[2, 2]] = 10.0;
    Grid::from_array(data, 1.0).unwrap()
}

fn hill_dem(size: usize, cell_size: f64) -> Grid {
    let c = (size as f64 - 1.0) / 2.0;
    let data = Array2::from_shape_fn((size, size), |(i, j)| {
        let r = ((i as f64 - c).powi(2) + (j as f64 - c).powi(2)).sqrt();
        1200.0 + 40.0 * (-r * r / 20.0).exp() + 0.5 * i as f64
    });
    Grid::from_array(data, cell_size).unwrap()
}

#[test]
fn test_flat_dem_converges_in_one_iteration() {
    init_logging();
    let dem = Grid::from_array(Array2::from_elem((5, 5), 250.0), 1.0).unwrap();
    let outcome = SlblSolver::new(SlblParams::default()).solve(&dem).unwrap();

    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 1);
    assert!(outcome.max_change <= outcome.tolerance);
    assert_eq!(outcome.surface.dim(), (5, 5));
    assert!(outcome.surface.data.iter().all(|v| v.is_finite() && *v <= 250.0));
}

#[test]
fn test_pinned_ring_converges_in_exactly_two_iterations() {
    init_logging();
    let params = SlblParams { z_max: 1.0, ..Default::default() };
    let outcome = SlblSolver::new(params).solve(&pinned_ring_dem()).unwrap();

    // 3x3 valid block: mean width = mean length = 2, A_hs = 4, C = 1
    assert_relative_eq!(outcome.curvature, 1.0);
    assert_relative_eq!(outcome.tolerance, 2.0);
    assert!(outcome.converged);
    assert_eq!(outcome.iterations, 2);
    assert_relative_eq!(outcome.surface.data[[2, 2]], -1.0);
    assert_eq!(outcome.surface.data[[1, 1]], 0.0);
    // former no-data border is filled with the lowest DEM elevation
    assert_eq!(outcome.surface.data[[0, 0]], 0.0);
}

#[test]
fn test_iteration_cap_reports_non_convergence() {
    init_logging();
    let params = SlblParams { z_max: 1.0, max_iterations: 1, ..Default::default() };
    let outcome = SlblSolver::new(params).solve(&pinned_ring_dem()).unwrap();

    assert!(!outcome.converged);
    assert_eq!(outcome.iterations, 1);
    assert_relative_eq!(outcome.max_change, 11.0);

    match outcome.into_converged() {
        Err(TerrainError::ConvergenceFailure { iterations, tolerance, .. }) => {
            assert_eq!(iterations, 1);
            assert_relative_eq!(tolerance, 2.0);
        }
        other => panic!("expected ConvergenceFailure, got {:?}", other),
    }
}

#[test]
fn test_output_is_finite_and_below_dem() {
    init_logging();
    let mut dem = hill_dem(15, 10.0);
    for k in 0..15 {
        dem.data[[0, k]] = f64::NAN;
        dem.data[[k, 14]] = f64::NAN;
    }

    let outcome = SlblSolver::new(SlblParams::default()).solve(&dem).unwrap();
    assert!(outcome.converged);
    assert_eq!(outcome.surface.dim(), dem.dim());

    for ((i, j), s) in outcome.surface.data.indexed_iter() {
        assert!(s.is_finite(), "cell ({}, {}) is not finite", i, j);
        let z = dem.data[[i, j]];
        if z.is_finite() {
            assert!(*s <= z, "cell ({}, {}) rose above the DEM", i, j);
        }
    }
    // the hilltop is carved into
    assert!(outcome.surface.data[[7, 7]] < dem.data[[7, 7]]);
}

#[test]
fn test_solve_is_idempotent_near_fixed_point() {
    init_logging();
    let dem = hill_dem(12, 5.0);
    let first = SlblSolver::new(SlblParams::default()).solve(&dem).unwrap();
    assert!(first.converged);

    let params = SlblParams { max_iterations: 1, ..Default::default() };
    let second = SlblSolver::new(params).solve(&first.surface).unwrap();

    assert_relative_eq!(second.tolerance, first.tolerance, epsilon = 1e-12);
    assert!(second.max_change <= first.tolerance + 1e-9);
}

#[test]
fn test_single_valid_cell_is_degenerate() {
    init_logging();
    let mut data = Array2::from_elem((3, 3), f64::NAN);
    data[[1, 1]] = 100.0;
    let dem = Grid::from_array(data, 1.0).unwrap();

    let result = SlblSolver::new(SlblParams::default()).solve(&dem);
    assert!(matches!(result, Err(TerrainError::DegenerateRegion(_))));

    let empty = Grid::from_array(Array2::from_elem((3, 3), f64::NAN), 1.0).unwrap();
    let result = SlblSolver::new(SlblParams::default()).solve(&empty);
    assert!(matches!(result, Err(TerrainError::DegenerateRegion(_))));
}

#[test]
fn test_invalid_parameters_rejected() {
    let dem = Grid::from_array(Array2::from_elem((3, 3), 1.0), 1.0).unwrap();
    for params in [
        SlblParams { z_max: 0.0, ..Default::default() },
        SlblParams { max_iterations: 0, ..Default::default() },
    ] {
        let result = SlblSolver::new(params).solve(&dem);
        assert!(matches!(result, Err(TerrainError::InvalidInput(_))));
    }
}

#[test]
fn test_expired_deadline_aborts() {
    let dem = hill_dem(8, 1.0);
    let solver = SlblSolver::new(SlblParams::default()).with_deadline(Deadline::at(std::time::Instant::now()));
    assert!(matches!(solver.solve(&dem), Err(TerrainError::DeadlineExceeded { .. })));
}
