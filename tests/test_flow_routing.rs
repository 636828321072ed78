use ndarray::Array2;
use terrasource::core::flow_routing::{accumulate, direction, downstream, NO_FLOW};

#[test]
fn test_corner_outlet_collects_whole_grid() {
    // Uniform slope down toward (0, 0)
    let tile = Array2::from_shape_fn((5, 5), |(i, j)| (i + j) as f64);
    let dirs = direction(&tile);
    let acc = accumulate(&tile, &dirs).unwrap();

    assert_eq!(dirs[[0, 0]], NO_FLOW);
    assert_eq!(dirs[[2, 2]], 3); // NW
    assert_eq!(dirs[[0, 3]], 4); // W
    assert_eq!(dirs[[3, 0]], 2); // N
    assert_eq!(acc[[0, 0]], 25);
}

#[test]
fn test_monotonic_slope_toward_edge() {
    let tile = Array2::from_shape_fn((6, 7), |(_, j)| 10.0 * j as f64);
    let dirs = direction(&tile);
    let acc = accumulate(&tile, &dirs).unwrap();

    assert_eq!(*acc.iter().min().unwrap(), 1);
    for ((i, j), &a) in acc.indexed_iter() {
        assert_eq!(a, (7 - j) as u32, "cell ({}, {})", i, j);
    }

    // Non-decreasing along every flow path
    for ((i, j), &code) in dirs.indexed_iter() {
        if let Some(next) = downstream(i, j, code, dirs.dim()) {
            assert!(acc[next] > acc[[i, j]]);
        }
    }
}

#[test]
fn test_central_pit_collects_all_neighbours() {
    let mut tile = Array2::from_elem((3, 3), 5.0);
    tile[[1, 1]] = 1.0;
    let dirs = direction(&tile);
    let acc = accumulate(&tile, &dirs).unwrap();

    assert_eq!(dirs[[1, 1]], NO_FLOW);
    assert_eq!(acc[[1, 1]], 9);
    assert_eq!(acc[[0, 0]], 1);
}

#[test]
fn test_isolated_cell_counts_itself() {
    // (1, 1) has no lower neighbour and every neighbour drains elsewhere
    let tile = Array2::from_shape_fn((3, 5), |(_, j)| if j == 4 { 0.0 } else { 10.0 });
    let dirs = direction(&tile);
    let acc = accumulate(&tile, &dirs).unwrap();

    assert_eq!(dirs[[1, 1]], NO_FLOW);
    for ((i, j), &code) in dirs.indexed_iter() {
        assert_ne!(downstream(i, j, code, dirs.dim()), Some((1, 1)));
    }
    assert_eq!(acc[[1, 1]], 1);

    // A flat tile has no edges at all
    let flat = Array2::from_elem((4, 4), 7.0);
    let flat_acc = accumulate(&flat, &direction(&flat)).unwrap();
    assert!(flat_acc.iter().all(|&a| a == 1));
}

#[test]
fn test_nodata_does_not_route() {
    let mut tile = Array2::from_shape_fn((3, 4), |(_, j)| j as f64);
    tile[[1, 1]] = f64::NAN;
    let dirs = direction(&tile);
    let acc = accumulate(&tile, &dirs).unwrap();

    assert_eq!(dirs[[1, 1]], NO_FLOW);
    assert_eq!(acc[[1, 1]], 1);
    // (1, 2) cannot drain west into no-data, so it takes the next steepest diagonal
    assert_eq!(dirs[[1, 2]], 3);
    assert!(acc.iter().all(|&a| a >= 1));
}
