use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Real-valued cell type used for every elevation and attribute grid
pub type Cell = f64;

/// 2D elevation array (rows x cols), no-data normalized to NaN
pub type ElevationArray = Array2<Cell>;

/// Conventional output sentinel for written rasters
pub const DEFAULT_NODATA: Cell = -9999.0;

/// North-up affine pixel transform without rotation terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub top_left_y: f64,
    pub pixel_height: f64, // negative for north-up rasters
}

impl GeoTransform {
    /// Unit-origin transform with square cells of `cell_size`
    pub fn with_cell_size(cell_size: f64) -> Self {
        Self {
            top_left_x: 0.0,
            pixel_width: cell_size,
            top_left_y: 0.0,
            pixel_height: -cell_size,
        }
    }

    /// Build from a GDAL-ordered coefficient array, rejecting rotated grids
    pub fn from_gdal(gt: [f64; 6]) -> TerrainResult<Self> {
        if gt[2] != 0.0 || gt[4] != 0.0 {
            return Err(TerrainError::InvalidInput(format!(
                "rotated geotransforms are not supported (rotation terms {}, {})",
                gt[2], gt[4]
            )));
        }
        let transform = Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            top_left_y: gt[3],
            pixel_height: gt[5],
        };
        transform.validate()?;
        Ok(transform)
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.top_left_x, self.pixel_width, 0.0, self.top_left_y, 0.0, self.pixel_height]
    }

    /// Scalar cell size (meters/pixel) used by slope, distance and area math
    pub fn cell_size(&self) -> f64 {
        self.pixel_width.abs()
    }

    pub fn pixel_area(&self) -> f64 {
        (self.pixel_width * self.pixel_height).abs()
    }

    /// Geographic footprint of a `rows x cols` grid
    pub fn bounds(&self, rows: usize, cols: usize) -> BoundingBox {
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + self.pixel_width * cols as f64;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + self.pixel_height * rows as f64;
        BoundingBox {
            min_x: x0.min(x1),
            max_x: x0.max(x1),
            min_y: y0.min(y1),
            max_y: y0.max(y1),
        }
    }

    /// Transform of a sub-window starting at (`row_off`, `col_off`)
    pub fn offset(&self, row_off: usize, col_off: usize) -> Self {
        Self {
            top_left_x: self.top_left_x + self.pixel_width * col_off as f64,
            top_left_y: self.top_left_y + self.pixel_height * row_off as f64,
            ..*self
        }
    }

    pub fn validate(&self) -> TerrainResult<()> {
        let finite = self.top_left_x.is_finite()
            && self.top_left_y.is_finite()
            && self.pixel_width.is_finite()
            && self.pixel_height.is_finite();
        if !finite || self.pixel_width == 0.0 || self.pixel_height == 0.0 {
            return Err(TerrainError::InvalidInput(format!(
                "invalid pixel transform: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Geospatial bounding box in raster CRS units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl BoundingBox {
    /// Overlapping region, `None` when the boxes share no area
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let min_x = self.min_x.max(other.min_x);
        let max_x = self.max_x.min(other.max_x);
        let min_y = self.min_y.max(other.min_y);
        let max_y = self.max_y.min(other.max_y);
        if min_x < max_x && min_y < max_y {
            Some(BoundingBox { min_x, max_x, min_y, max_y })
        } else {
            None
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Summary statistics over the valid cells of a grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub valid_count: usize,
}

impl GridStats {
    /// Statistics over finite values, `None` if there are none
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Option<Self> {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values.into_iter().filter(|v| v.is_finite()) {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(Self { min, max, mean: sum / count as f64, valid_count: count })
    }
}

/// Elevation/attribute grid with its no-data sentinel and pixel transform.
///
/// Cells equal to the sentinel (or already NaN) are normalized to NaN once,
/// when the grid is built; the sentinel is only restored on output.
#[derive(Debug, Clone)]
pub struct Grid {
    pub data: ElevationArray,
    pub nodata: Cell,
    pub geo_transform: GeoTransform,
    /// Opaque CRS tag (WKT or "EPSG:xxxx"), carried through untouched
    pub crs: Option<String>,
}

impl Grid {
    pub fn new(mut data: ElevationArray, nodata: Cell, geo_transform: GeoTransform) -> TerrainResult<Self> {
        geo_transform.validate()?;
        if !nodata.is_nan() {
            data.mapv_inplace(|v| if v == nodata { Cell::NAN } else { v });
        }
        Ok(Self { data, nodata, geo_transform, crs: None })
    }

    /// Grid with square cells and the default output sentinel
    pub fn from_array(data: ElevationArray, cell_size: f64) -> TerrainResult<Self> {
        if !(cell_size > 0.0) || !cell_size.is_finite() {
            return Err(TerrainError::InvalidInput(format!(
                "cell size must be positive, got {}",
                cell_size
            )));
        }
        Self::new(data, DEFAULT_NODATA, GeoTransform::with_cell_size(cell_size))
    }

    /// Grid of the given shape filled with no-data
    pub fn empty_like(shape: (usize, usize), nodata: Cell, geo_transform: GeoTransform) -> Self {
        Self {
            data: Array2::from_elem(shape, Cell::NAN),
            nodata,
            geo_transform,
            crs: None,
        }
    }

    pub fn with_crs(mut self, crs: impl Into<String>) -> Self {
        self.crs = Some(crs.into());
        self
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn cell_size(&self) -> f64 {
        self.geo_transform.cell_size()
    }

    pub fn pixel_area(&self) -> f64 {
        self.geo_transform.pixel_area()
    }

    pub fn bounds(&self) -> BoundingBox {
        let (rows, cols) = self.dim();
        self.geo_transform.bounds(rows, cols)
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn stats(&self) -> Option<GridStats> {
        GridStats::from_values(self.data.iter().copied())
    }

    /// Smallest valid value
    pub fn min_valid(&self) -> Option<Cell> {
        self.stats().map(|s| s.min)
    }

    /// Copy of a sub-window with its own transform
    pub fn window(&self, row_off: usize, col_off: usize, rows: usize, cols: usize) -> Grid {
        Grid {
            data: self.data.slice(s![row_off..row_off + rows, col_off..col_off + cols]).to_owned(),
            nodata: self.nodata,
            geo_transform: self.geo_transform.offset(row_off, col_off),
            crs: self.crs.clone(),
        }
    }

    /// Data with no-data written back as the sentinel value
    pub fn to_output_array(&self) -> ElevationArray {
        let nodata = self.nodata;
        self.data.mapv(|v| if v.is_finite() { v } else { nodata })
    }
}

/// Optional wall-clock limit checked at iteration and tile boundaries
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    pub fn after(duration: std::time::Duration) -> Self {
        Self(Some(Instant::now() + duration))
    }

    pub fn check(&self, stage: &str) -> TerrainResult<()> {
        match self.0 {
            Some(limit) if Instant::now() >= limit => Err(TerrainError::DeadlineExceeded {
                stage: stage.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Pipeline stage names used in structured failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Clip,
    Relaxation,
    Alignment,
    Integration,
    Resample,
    TiledLs,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Clip => write!(f, "clip"),
            Stage::Relaxation => write!(f, "relaxation"),
            Stage::Alignment => write!(f, "alignment"),
            Stage::Integration => write!(f, "integration"),
            Stage::Resample => write!(f, "resample"),
            Stage::TiledLs => write!(f, "tiled LS"),
        }
    }
}

/// Error types for terrain processing
#[derive(Debug, thiserror::Error)]
pub enum TerrainError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Degenerate valid-cell region: {0}")]
    DegenerateRegion(String),

    #[error("Relaxation did not converge after {iterations} iterations (max change {max_change:.6}, tolerance {tolerance:.6})")]
    ConvergenceFailure {
        iterations: usize,
        max_change: f64,
        tolerance: f64,
    },

    #[error("Tile [{tile_row},{tile_col}] failed: {reason}")]
    TileProcessing {
        tile_row: usize,
        tile_col: usize,
        reason: String,
    },

    #[error("Grids cannot be aligned: {0}")]
    AlignmentMismatch(String),

    #[error("No valid cells: {0}")]
    NoValidCells(String),

    #[error("Deadline exceeded during {stage}")]
    DeadlineExceeded { stage: String },

    #[error("{stage} stage failed: {source}")]
    StageFailed {
        stage: Stage,
        #[source]
        source: Box<TerrainError>,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

impl TerrainError {
    /// Innermost error, unwrapping stage context
    pub fn root(&self) -> &TerrainError {
        match self {
            TerrainError::StageFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type for terrain operations
pub type TerrainResult<T> = Result<T, TerrainError>;

/// Attach the failing stage to an error leaving a pipeline
pub trait StageContext<T> {
    fn in_stage(self, stage: Stage) -> TerrainResult<T>;
}

impl<T> StageContext<T> for TerrainResult<T> {
    fn in_stage(self, stage: Stage) -> TerrainResult<T> {
        self.map_err(|e| match e {
            already @ TerrainError::StageFailed { .. } => already,
            other => TerrainError::StageFailed { stage, source: Box::new(other) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sentinel_normalized_once() {
        let data = array![[1.0, -9999.0], [f64::NAN, 4.0]];
        let grid = Grid::new(data, -9999.0, GeoTransform::with_cell_size(2.0)).unwrap();

        assert_eq!(grid.valid_count(), 2);
        assert!(grid.data[[0, 1]].is_nan());

        let out = grid.to_output_array();
        assert_eq!(out[[0, 1]], -9999.0);
        assert_eq!(out[[1, 0]], -9999.0);
        assert_eq!(out[[1, 1]], 4.0);
    }

    #[test]
    fn test_rotated_transform_rejected() {
        let result = GeoTransform::from_gdal([0.0, 1.0, 0.5, 0.0, 0.0, -1.0]);
        assert!(matches!(result, Err(TerrainError::InvalidInput(_))));
    }

    #[test]
    fn test_bounds_and_intersection() {
        let gt = GeoTransform { top_left_x: 100.0, pixel_width: 5.0, top_left_y: 200.0, pixel_height: -5.0 };
        let bbox = gt.bounds(4, 2);
        assert_eq!(bbox, BoundingBox { min_x: 100.0, max_x: 110.0, min_y: 180.0, max_y: 200.0 });

        let other = BoundingBox { min_x: 110.0, max_x: 120.0, min_y: 180.0, max_y: 200.0 };
        assert!(bbox.intersection(&other).is_none()); // touching edges only
    }

    #[test]
    fn test_stats_ignore_nodata() {
        let grid = Grid::from_array(array![[1.0, f64::NAN], [3.0, 5.0]], 1.0).unwrap();
        let stats = grid.stats().unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(stats.valid_count, 3);

        let empty = Grid::from_array(Array2::from_elem((2, 2), f64::NAN), 1.0).unwrap();
        assert!(empty.stats().is_none());
    }

    #[test]
    fn test_stage_context_wraps_once() {
        let err: TerrainResult<()> = Err(TerrainError::NoValidCells("none".to_string()));
        let wrapped = err.in_stage(Stage::Integration).in_stage(Stage::Alignment);
        match wrapped {
            Err(TerrainError::StageFailed { stage, ref source }) => {
                assert_eq!(stage, Stage::Integration);
                assert!(matches!(**source, TerrainError::NoValidCells(_)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
