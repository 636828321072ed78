//! Windowed LS-factor processing for grids too large for one pass
//!
//! The grid is cut into non-overlapping square windows. Each window is
//! routed and scored on its own, so flow accumulation stops at window edges.
//! Windows are read and written sequentially and computed on the rayon pool
//! one batch at a time, which bounds memory to `batch_size` windows.

use crate::core::ls_factor::compute_ls_tile;
use crate::io::window::{nodata_window, TileWindow, WindowSink, WindowSource};
use crate::types::{Cell, Deadline, ElevationArray, Grid, TerrainError, TerrainResult, DEFAULT_NODATA};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Parameters for tiled LS processing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TiledLsParams {
    /// Window edge length in cells
    pub chunk_size: usize,
    /// Cell size (meters) used by `process`; `compute_ls` reads it from the grid
    pub cell_size: f64,
    /// Sentinel written for no-data output cells
    pub output_nodata: Cell,
    /// Windows held in memory and computed together
    pub batch_size: usize,
}

impl Default for TiledLsParams {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            cell_size: 1.0,
            output_nodata: DEFAULT_NODATA,
            batch_size: 8,
        }
    }
}

/// A window that could not be computed and was written as no-data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileFailure {
    pub tile_row: usize,
    pub tile_col: usize,
    pub row_off: usize,
    pub col_off: usize,
    pub reason: String,
}

impl TileFailure {
    fn new(window: &TileWindow, reason: String) -> Self {
        Self {
            tile_row: window.tile_row,
            tile_col: window.tile_col,
            row_off: window.row_off,
            col_off: window.col_off,
            reason,
        }
    }

    pub fn to_error(&self) -> TerrainError {
        TerrainError::TileProcessing {
            tile_row: self.tile_row,
            tile_col: self.tile_col,
            reason: self.reason.clone(),
        }
    }
}

/// Summary of a tiled run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TiledLsReport {
    pub total_tiles: usize,
    pub completed_tiles: usize,
    /// Windows with no valid input cell
    pub empty_tiles: usize,
    pub failures: Vec<TileFailure>,
    pub chunk_size: usize,
    pub cell_size: f64,
    pub elapsed_seconds: f64,
}

impl TiledLsReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Partition a `rows x cols` grid into row-major windows of at most `chunk x chunk`
pub fn windows(rows: usize, cols: usize, chunk: usize) -> Vec<TileWindow> {
    if chunk == 0 || rows == 0 || cols == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(rows.div_ceil(chunk) * cols.div_ceil(chunk));
    for (tile_row, row_off) in (0..rows).step_by(chunk).enumerate() {
        for (tile_col, col_off) in (0..cols).step_by(chunk).enumerate() {
            out.push(TileWindow {
                row_off,
                col_off,
                rows: chunk.min(rows - row_off),
                cols: chunk.min(cols - col_off),
                tile_row,
                tile_col,
            });
        }
    }
    out
}

/// Result of computing one window
enum TileOutcome {
    Computed(ElevationArray),
    Empty,
    Failed(String),
}

type ProgressCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Tiled LS-factor processor
pub struct TiledLsProcessor {
    params: TiledLsParams,
    deadline: Deadline,
    progress: Option<ProgressCallback>,
}

impl TiledLsProcessor {
    pub fn new(params: TiledLsParams) -> Self {
        Self { params, deadline: Deadline::none(), progress: None }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Called with (completed, total) after every window, possibly from a worker thread
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn params(&self) -> &TiledLsParams {
        &self.params
    }

    /// LS grid of an in-memory DEM, cell size taken from its transform
    pub fn compute_ls(&self, dem: &Grid) -> TerrainResult<(Grid, TiledLsReport)> {
        let mut output = Grid::empty_like(dem.dim(), self.params.output_nodata, dem.geo_transform);
        output.crs = dem.crs.clone();

        let mut source = dem;
        let report = self.run(&mut source, &mut output, dem.cell_size())?;
        Ok((output, report))
    }

    /// Stream every window of `source` through the LS kernel into `sink`
    pub fn process<S, W>(&self, source: &mut S, sink: &mut W) -> TerrainResult<TiledLsReport>
    where
        S: WindowSource + ?Sized,
        W: WindowSink + ?Sized,
    {
        self.run(source, sink, self.params.cell_size)
    }

    fn run<S, W>(&self, source: &mut S, sink: &mut W, cell_size: f64) -> TerrainResult<TiledLsReport>
    where
        S: WindowSource + ?Sized,
        W: WindowSink + ?Sized,
    {
        self.validate(cell_size)?;

        let start = Instant::now();
        let (rows, cols) = source.shape();
        let layout = windows(rows, cols, self.params.chunk_size);
        let total = layout.len();

        log::info!(
            "Starting tiled LS over {}x{} grid: {} windows of up to {}x{}",
            rows,
            cols,
            total,
            self.params.chunk_size,
            self.params.chunk_size
        );
        log::debug!("Tiled LS parameters: {:?}, cell size {}", self.params, cell_size);

        let mut report = TiledLsReport {
            total_tiles: total,
            chunk_size: self.params.chunk_size,
            cell_size,
            ..Default::default()
        };
        let completed = AtomicUsize::new(0);

        for batch in layout.chunks(self.params.batch_size) {
            self.deadline.check("tiled LS")?;

            // Sequential reads
            let inputs: Vec<(TileWindow, TerrainResult<ElevationArray>)> =
                batch.iter().map(|w| (*w, source.read_window(w))).collect();

            let outcomes = self.compute_batch(inputs, cell_size, &completed, total);

            // Sequential writes to disjoint windows
            for (window, outcome) in outcomes {
                match outcome {
                    TileOutcome::Computed(ls) => sink.write_window(&window, &ls)?,
                    TileOutcome::Empty => {
                        report.empty_tiles += 1;
                        sink.write_window(&window, &nodata_window(&window))?;
                    }
                    TileOutcome::Failed(reason) => {
                        log::warn!(
                            "Tile [{},{}] at ({}, {}) failed: {}",
                            window.tile_row,
                            window.tile_col,
                            window.row_off,
                            window.col_off,
                            reason
                        );
                        sink.write_window(&window, &nodata_window(&window))?;
                        report.failures.push(TileFailure::new(&window, reason));
                    }
                }
            }

            log::info!("Tiled LS progress: {}/{} windows", completed.load(Ordering::SeqCst), total);
        }

        report.completed_tiles = completed.load(Ordering::SeqCst);
        report.elapsed_seconds = start.elapsed().as_secs_f64();

        log::info!(
            "Tiled LS completed in {:.2}s: {} windows, {} empty, {} failed",
            report.elapsed_seconds,
            report.total_tiles,
            report.empty_tiles,
            report.failures.len()
        );

        Ok(report)
    }

    #[cfg(feature = "parallel")]
    fn compute_batch(
        &self,
        inputs: Vec<(TileWindow, TerrainResult<ElevationArray>)>,
        cell_size: f64,
        completed: &AtomicUsize,
        total: usize,
    ) -> Vec<(TileWindow, TileOutcome)> {
        inputs
            .into_par_iter()
            .map(|(window, input)| {
                let outcome = compute_window(input, cell_size);
                self.tick(completed, total);
                (window, outcome)
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn compute_batch(
        &self,
        inputs: Vec<(TileWindow, TerrainResult<ElevationArray>)>,
        cell_size: f64,
        completed: &AtomicUsize,
        total: usize,
    ) -> Vec<(TileWindow, TileOutcome)> {
        inputs
            .into_iter()
            .map(|(window, input)| {
                let outcome = compute_window(input, cell_size);
                self.tick(completed, total);
                (window, outcome)
            })
            .collect()
    }

    fn tick(&self, completed: &AtomicUsize, total: usize) {
        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(callback) = &self.progress {
            callback(done, total);
        }
    }

    fn validate(&self, cell_size: f64) -> TerrainResult<()> {
        if self.params.chunk_size == 0 {
            return Err(TerrainError::InvalidInput("chunk_size must be at least 1".to_string()));
        }
        if self.params.batch_size == 0 {
            return Err(TerrainError::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(TerrainError::InvalidInput(format!(
                "cell size must be positive, got {}",
                cell_size
            )));
        }
        Ok(())
    }
}

fn compute_window(input: TerrainResult<ElevationArray>, cell_size: f64) -> TileOutcome {
    let tile = match input {
        Ok(tile) => tile,
        Err(e) => return TileOutcome::Failed(format!("read failed: {}", e)),
    };
    if tile.iter().all(|v| v.is_nan()) {
        return TileOutcome::Empty;
    }
    match catch_unwind(AssertUnwindSafe(|| compute_ls_tile(&tile, cell_size))) {
        Ok(Ok(ls)) => TileOutcome::Computed(ls),
        Ok(Err(e)) => TileOutcome::Failed(e.to_string()),
        Err(payload) => TileOutcome::Failed(format!("kernel panicked: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_windows_cover_grid_once() {
        let layout = windows(7, 10, 4);
        assert_eq!(layout.len(), 6);
        assert_eq!(layout[0], TileWindow { row_off: 0, col_off: 0, rows: 4, cols: 4, tile_row: 0, tile_col: 0 });
        assert_eq!(layout[5], TileWindow { row_off: 4, col_off: 8, rows: 3, cols: 2, tile_row: 1, tile_col: 2 });

        let mut hits = Array2::<u8>::zeros((7, 10));
        for w in &layout {
            for i in w.row_off..w.row_off + w.rows {
                for j in w.col_off..w.col_off + w.cols {
                    hits[[i, j]] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_windows_of_empty_grid() {
        assert!(windows(0, 5, 4).is_empty());
        assert!(windows(5, 5, 0).is_empty());
    }

    #[test]
    fn test_empty_window_is_nodata() {
        let mut data = Array2::from_shape_fn((4, 4), |(i, j)| (i + j) as f64);
        for i in 0..2 {
            for j in 0..2 {
                data[[i, j]] = f64::NAN;
            }
        }
        let dem = Grid::from_array(data, 10.0).unwrap();
        let processor = TiledLsProcessor::new(TiledLsParams { chunk_size: 2, ..Default::default() });
        let (ls, report) = processor.compute_ls(&dem).unwrap();

        assert_eq!(report.total_tiles, 4);
        assert_eq!(report.empty_tiles, 1);
        assert_eq!(report.completed_tiles, 4);
        assert!(!report.has_failures());
        assert!(ls.data[[0, 0]].is_nan());
        assert!(ls.data[[3, 3]] >= 0.0);
        assert_eq!(ls.to_output_array()[[1, 1]], DEFAULT_NODATA);
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let dem = Grid::from_array(Array2::zeros((2, 2)), 1.0).unwrap();
        let processor = TiledLsProcessor::new(TiledLsParams { chunk_size: 0, ..Default::default() });
        assert!(matches!(processor.compute_ls(&dem), Err(TerrainError::InvalidInput(_))));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&payload), "boom");
    }
}
