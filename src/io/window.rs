use crate::types::{Cell, ElevationArray, Grid, TerrainError, TerrainResult};
use ndarray::s;
use serde::{Deserialize, Serialize};

/// Rectangular sub-region of a full grid. Owns no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileWindow {
    /// Row offset in the full grid
    pub row_off: usize,
    /// Column offset in the full grid
    pub col_off: usize,
    /// Number of rows in this window
    pub rows: usize,
    /// Number of columns in this window
    pub cols: usize,
    /// Window position in the tile layout
    pub tile_row: usize,
    pub tile_col: usize,
}

impl TileWindow {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Check the window lies inside a grid of `shape`
    pub fn check_within(&self, shape: (usize, usize)) -> TerrainResult<()> {
        if self.row_off + self.rows > shape.0 || self.col_off + self.cols > shape.1 {
            return Err(TerrainError::InvalidInput(format!(
                "window {:?} exceeds grid {}x{}",
                self, shape.0, shape.1
            )));
        }
        Ok(())
    }
}

/// Windowed read side of the Grid I/O capability.
///
/// Returned arrays have no-data normalized to NaN.
pub trait WindowSource {
    /// Full grid shape as (rows, cols)
    fn shape(&self) -> (usize, usize);

    fn read_window(&mut self, window: &TileWindow) -> TerrainResult<ElevationArray>;
}

/// Windowed write side of the Grid I/O capability.
///
/// NaN cells are written as the sink's own no-data sentinel.
pub trait WindowSink {
    fn write_window(&mut self, window: &TileWindow, data: &ElevationArray) -> TerrainResult<()>;
}

fn read_grid_window(grid: &Grid, window: &TileWindow) -> TerrainResult<ElevationArray> {
    window.check_within(grid.dim())?;
    Ok(grid
        .data
        .slice(s![
            window.row_off..window.row_off + window.rows,
            window.col_off..window.col_off + window.cols
        ])
        .to_owned())
}

impl WindowSource for Grid {
    fn shape(&self) -> (usize, usize) {
        self.dim()
    }

    fn read_window(&mut self, window: &TileWindow) -> TerrainResult<ElevationArray> {
        read_grid_window(self, window)
    }
}

/// Borrowed grids are read-only sources
impl WindowSource for &Grid {
    fn shape(&self) -> (usize, usize) {
        self.dim()
    }

    fn read_window(&mut self, window: &TileWindow) -> TerrainResult<ElevationArray> {
        read_grid_window(self, window)
    }
}

impl WindowSink for Grid {
    fn write_window(&mut self, window: &TileWindow, data: &ElevationArray) -> TerrainResult<()> {
        window.check_within(self.dim())?;
        if data.dim() != window.shape() {
            return Err(TerrainError::InvalidInput(format!(
                "window data is {:?}, expected {:?}",
                data.dim(),
                window.shape()
            )));
        }
        self.data
            .slice_mut(s![
                window.row_off..window.row_off + window.rows,
                window.col_off..window.col_off + window.cols
            ])
            .assign(data);
        Ok(())
    }
}

/// No-data filled array for a window
pub fn nodata_window(window: &TileWindow) -> ElevationArray {
    ElevationArray::from_elem(window.shape(), Cell::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn window(row_off: usize, col_off: usize, rows: usize, cols: usize) -> TileWindow {
        TileWindow { row_off, col_off, rows, cols, tile_row: 0, tile_col: 0 }
    }

    #[test]
    fn test_grid_window_read_write() {
        let data = Array2::from_shape_fn((4, 5), |(i, j)| (i * 10 + j) as f64);
        let mut grid = Grid::from_array(data, 1.0).unwrap();

        let w = window(1, 2, 2, 3);
        let chunk = grid.read_window(&w).unwrap();
        assert_eq!(chunk.dim(), (2, 3));
        assert_eq!(chunk[[0, 0]], 12.0);
        assert_eq!(chunk[[1, 2]], 24.0);

        grid.write_window(&w, &Array2::zeros((2, 3))).unwrap();
        assert_eq!(grid.data[[2, 4]], 0.0);
        assert_eq!(grid.data[[1, 1]], 11.0);
        assert_eq!(grid.data[[3, 4]], 34.0);
    }

    #[test]
    fn test_out_of_range_window_rejected() {
        let mut grid = Grid::from_array(Array2::zeros((3, 3)), 1.0).unwrap();
        assert!(grid.read_window(&window(2, 0, 2, 3)).is_err());
        assert!(grid.write_window(&window(0, 0, 2, 2), &Array2::zeros((3, 3))).is_err());
    }
}
