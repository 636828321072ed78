use approx::assert_relative_eq;
use ndarray::{s, Array2};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use terrasource::core::ls_factor::compute_ls_tile;
use terrasource::core::tiled_ls::{windows, TiledLsParams, TiledLsProcessor};
use terrasource::io::{TileWindow, WindowSource};
use terrasource::{Deadline, ElevationArray, Grid, TerrainError, TerrainResult, DEFAULT_NODATA};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 32x32 DEM of independent 8x8 bowls draining to each block centre
fn bowl_blocks() -> Grid {
    let data = Array2::from_shape_fn((32, 32), |(i, j)| {
        let di = (i % 8) as f64 - 3.5;
        let dj = (j % 8) as f64 - 3.5;
        100.0 + 2.0 * (di * di + dj * dj).sqrt()
    });
    Grid::from_array(data, 5.0).unwrap()
}

/// Ragged 37x29 plane tilted toward the top-left corner, with deterministic roughness
fn rough_plane() -> Grid {
    let data = Array2::from_shape_fn((37, 29), |(i, j)| {
        let noise = ((i * 37 + j * 101) % 17) as f64 * 0.07;
        500.0 + 1.2 * i as f64 + 0.4 * j as f64 + noise
    });
    Grid::from_array(data, 2.0).unwrap()
}

fn processor(chunk_size: usize) -> TiledLsProcessor {
    TiledLsProcessor::new(TiledLsParams { chunk_size, batch_size: 3, ..Default::default() })
}

/// Source that fails to read one window
struct FlakySource {
    grid: Grid,
    fail_at: (usize, usize),
}

impl WindowSource for FlakySource {
    fn shape(&self) -> (usize, usize) {
        self.grid.dim()
    }

    fn read_window(&mut self, window: &TileWindow) -> TerrainResult<ElevationArray> {
        if (window.tile_row, window.tile_col) == self.fail_at {
            return Err(TerrainError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "truncated block",
            )));
        }
        self.grid.read_window(window)
    }
}

#[test]
fn test_interior_cells_invariant_to_chunk_size() {
    init_logging();
    let dem = bowl_blocks();
    let whole = compute_ls_tile(&dem.data, dem.cell_size()).unwrap();

    for chunk in [8, 16] {
        let (ls, report) = processor(chunk).compute_ls(&dem).unwrap();
        assert_eq!(report.total_tiles, (32 / chunk) * (32 / chunk));
        assert!(!report.has_failures());

        for ((i, j), v) in ls.data.indexed_iter() {
            let edge = [0, 7].contains(&(i % 8)) || [0, 7].contains(&(j % 8));
            if !edge {
                assert_relative_eq!(*v, whole[[i, j]], epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_each_window_matches_standalone_kernel_on_rough_plane() {
    init_logging();
    let dem = rough_plane();

    for (chunk, batch_size) in [(8, 1), (16, 3), (16, 8)] {
        let params = TiledLsParams { chunk_size: chunk, batch_size, ..Default::default() };
        let (ls, report) = TiledLsProcessor::new(params).compute_ls(&dem).unwrap();
        assert!(!report.has_failures());

        for w in windows(37, 29, chunk) {
            let block = dem.data.slice(s![w.row_off..w.row_off + w.rows, w.col_off..w.col_off + w.cols]).to_owned();
            let expected = compute_ls_tile(&block, dem.cell_size()).unwrap();
            let got = ls.data.slice(s![w.row_off..w.row_off + w.rows, w.col_off..w.col_off + w.cols]);
            for (a, b) in got.iter().zip(expected.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-12);
            }
        }
    }
}

#[test]
fn test_upstream_area_restarts_at_window_edges() {
    init_logging();
    // Clean plane: every cell drains north, so whole-grid catchments run the full column
    let data = Array2::from_shape_fn((37, 29), |(i, j)| 500.0 + 1.2 * i as f64 + 0.4 * j as f64);
    let dem = Grid::from_array(data, 2.0).unwrap();
    let whole = compute_ls_tile(&dem.data, dem.cell_size()).unwrap();
    let (ls, _) = processor(16).compute_ls(&dem).unwrap();

    // Rows 18..30 sit inside the second window row, 32 - i upstream cells instead of 37 - i
    for i in 18..30 {
        assert!(ls.data[[i, 8]] < whole[[i, 8]], "row {}", i);
    }
}

#[test]
fn test_all_nodata_window_is_nodata() {
    init_logging();
    let mut dem = bowl_blocks();
    for i in 8..16 {
        for j in 16..24 {
            dem.data[[i, j]] = f64::NAN;
        }
    }

    let (ls, report) = processor(8).compute_ls(&dem).unwrap();
    assert_eq!(report.empty_tiles, 1);
    assert!(!report.has_failures());
    for i in 8..16 {
        for j in 16..24 {
            assert!(ls.data[[i, j]].is_nan());
        }
    }
    assert_eq!(ls.to_output_array()[[10, 20]], DEFAULT_NODATA);
    assert!(ls.data[[3, 3]] >= 0.0);
}

#[test]
fn test_failed_read_is_recovered_as_nodata_window() {
    init_logging();
    let dem = bowl_blocks();
    let mut source = FlakySource { grid: dem.clone(), fail_at: (1, 2) };
    let mut sink = Grid::empty_like(dem.dim(), DEFAULT_NODATA, dem.geo_transform);

    let params = TiledLsParams { chunk_size: 8, cell_size: dem.cell_size(), ..Default::default() };
    let report = TiledLsProcessor::new(params).process(&mut source, &mut sink).unwrap();

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!((failure.tile_row, failure.tile_col), (1, 2));
    assert_eq!((failure.row_off, failure.col_off), (8, 16));
    assert!(failure.reason.contains("truncated block"));
    assert!(matches!(failure.to_error(), TerrainError::TileProcessing { tile_row: 1, tile_col: 2, .. }));

    assert!(sink.data[[10, 20]].is_nan());
    let computed = sink.data.iter().filter(|v| v.is_finite()).count();
    assert_eq!(computed, 32 * 32 - 64);
}

#[test]
fn test_progress_reaches_total() {
    init_logging();
    let dem = bowl_blocks();
    let seen = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let (seen_cb, calls_cb) = (Arc::clone(&seen), Arc::clone(&calls));
    let processor = processor(8).on_progress(move |done, total| {
        assert!(done <= total);
        seen_cb.fetch_max(done, Ordering::SeqCst);
        calls_cb.fetch_add(1, Ordering::SeqCst);
    });

    let (_, report) = processor.compute_ls(&dem).unwrap();
    assert_eq!(report.completed_tiles, 16);
    assert_eq!(seen.load(Ordering::SeqCst), 16);
    assert_eq!(calls.load(Ordering::SeqCst), 16);
}

#[test]
fn test_expired_deadline_aborts() {
    let dem = bowl_blocks();
    let processor = processor(8).with_deadline(Deadline::at(std::time::Instant::now()));
    assert!(matches!(processor.compute_ls(&dem), Err(TerrainError::DeadlineExceeded { .. })));
}

#[test]
fn test_window_layout_for_ragged_grid() {
    let layout = windows(1001, 500, 500);
    assert_eq!(layout.len(), 3);
    assert_eq!(layout[2].rows, 1);
    assert_eq!(layout[2].cols, 500);
    assert_eq!(layout[2].tile_row, 2);
}
