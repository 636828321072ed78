use crate::types::{Cell, ElevationArray, GeoTransform, Grid, TerrainError, TerrainResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resampling capability used by grid alignment and LS pre-resampling.
///
/// Implementations map `grid` onto the pixel lattice described by `target`
/// and `shape`; cells with no source coverage come back as no-data.
pub trait Resampler: Send + Sync {
    fn resample(&self, grid: &Grid, target: &GeoTransform, shape: (usize, usize)) -> TerrainResult<Grid>;
}

/// Resampling kernel selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    /// Area-weighted mean of the covered source cells
    #[default]
    Average,
    Bilinear,
    Nearest,
}

impl ResampleMethod {
    pub fn resampler(self) -> &'static dyn Resampler {
        match self {
            ResampleMethod::Average => &AverageResampler,
            ResampleMethod::Bilinear => &BilinearResampler,
            ResampleMethod::Nearest => &NearestResampler,
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResampleMethod::Average => "average",
            ResampleMethod::Bilinear => "bilinear",
            ResampleMethod::Nearest => "nearest",
        };
        f.write_str(name)
    }
}

impl FromStr for ResampleMethod {
    type Err = TerrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "average" => Ok(ResampleMethod::Average),
            "bilinear" => Ok(ResampleMethod::Bilinear),
            "nearest" => Ok(ResampleMethod::Nearest),
            other => Err(TerrainError::InvalidInput(format!(
                "unknown resampling method '{}' (expected average, bilinear or nearest)",
                other
            ))),
        }
    }
}

fn check_source(grid: &Grid, target: &GeoTransform) -> TerrainResult<()> {
    target.validate()?;
    let (height, width) = grid.dim();
    if height == 0 || width == 0 {
        return Err(TerrainError::InvalidInput("cannot resample an empty grid".to_string()));
    }
    Ok(())
}

fn resampled_grid(grid: &Grid, target: &GeoTransform, data: ElevationArray) -> Grid {
    Grid {
        data,
        nodata: grid.nodata,
        geo_transform: *target,
        crs: grid.crs.clone(),
    }
}

/// Bilinear interpolation between pixel centers
#[derive(Debug, Clone, Copy, Default)]
pub struct BilinearResampler;

impl Resampler for BilinearResampler {
    fn resample(&self, grid: &Grid, target: &GeoTransform, shape: (usize, usize)) -> TerrainResult<Grid> {
        log::debug!("Resampling {:?} grid onto {:?} lattice", grid.dim(), shape);
        log::debug!("Target transform: {:?}", target);

        check_source(grid, target)?;

        let source = grid.geo_transform;
        let mut resampled = Array2::from_elem(shape, Cell::NAN);

        Zip::indexed(&mut resampled).for_each(|(i, j), value| {
            // Target pixel center in map coordinates
            let x = target.top_left_x + (j as f64 + 0.5) * target.pixel_width;
            let y = target.top_left_y + (i as f64 + 0.5) * target.pixel_height;

            // Fractional source indices, measured between pixel centers
            let col = (x - source.top_left_x) / source.pixel_width - 0.5;
            let row = (y - source.top_left_y) / source.pixel_height - 0.5;

            *value = sample_bilinear(&grid.data, snap(row), snap(col));
        });

        Ok(resampled_grid(grid, target, resampled))
    }
}

/// Value of the source cell containing each target pixel center
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestResampler;

impl Resampler for NearestResampler {
    fn resample(&self, grid: &Grid, target: &GeoTransform, shape: (usize, usize)) -> TerrainResult<Grid> {
        log::debug!("Nearest-neighbour resampling {:?} grid onto {:?} lattice", grid.dim(), shape);
        check_source(grid, target)?;

        let source = grid.geo_transform;
        let (height, width) = grid.dim();
        let mut resampled = Array2::from_elem(shape, Cell::NAN);

        Zip::indexed(&mut resampled).for_each(|(i, j), value| {
            let x = target.top_left_x + (j as f64 + 0.5) * target.pixel_width;
            let y = target.top_left_y + (i as f64 + 0.5) * target.pixel_height;

            let col = snap((x - source.top_left_x) / source.pixel_width).floor();
            let row = snap((y - source.top_left_y) / source.pixel_height).floor();
            if row >= 0.0 && col >= 0.0 && row < height as f64 && col < width as f64 {
                *value = grid.data[[row as usize, col as usize]];
            }
        });

        Ok(resampled_grid(grid, target, resampled))
    }
}

/// Area-weighted mean of the source cells overlapping each target pixel.
///
/// No-data source cells are left out of the mean; a target pixel with no
/// valid overlap is no-data.
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageResampler;

impl Resampler for AverageResampler {
    fn resample(&self, grid: &Grid, target: &GeoTransform, shape: (usize, usize)) -> TerrainResult<Grid> {
        log::debug!("Averaging {:?} grid onto {:?} lattice", grid.dim(), shape);
        check_source(grid, target)?;

        let source = grid.geo_transform;
        let (height, width) = grid.dim();
        let mut resampled = Array2::from_elem(shape, Cell::NAN);

        Zip::indexed(&mut resampled).for_each(|(i, j), value| {
            // Target pixel edges as fractional source indices
            let x0 = target.top_left_x + j as f64 * target.pixel_width;
            let x1 = x0 + target.pixel_width;
            let y0 = target.top_left_y + i as f64 * target.pixel_height;
            let y1 = y0 + target.pixel_height;

            let cols = fractional_span(x0, x1, source.top_left_x, source.pixel_width, width);
            let rows = fractional_span(y0, y1, source.top_left_y, source.pixel_height, height);
            if let (Some(cols), Some(rows)) = (cols, rows) {
                *value = area_mean(&grid.data, rows, cols);
            }
        });

        Ok(resampled_grid(grid, target, resampled))
    }
}

/// Source index interval covered by map interval `[a, b]`, clipped to the grid
fn fractional_span(a: f64, b: f64, origin: f64, step: f64, len: usize) -> Option<(f64, f64)> {
    let p = snap((a - origin) / step);
    let q = snap((b - origin) / step);
    let lo = p.min(q).max(0.0);
    let hi = p.max(q).min(len as f64);
    if hi > lo {
        Some((lo, hi))
    } else {
        None
    }
}

fn area_mean(data: &ElevationArray, rows: (f64, f64), cols: (f64, f64)) -> Cell {
    let mut weighted = 0.0;
    let mut total = 0.0;

    for r in rows.0.floor() as usize..rows.1.ceil() as usize {
        let wr = overlap(r, rows);
        for c in cols.0.floor() as usize..cols.1.ceil() as usize {
            let v = data[[r, c]];
            if v.is_nan() {
                continue;
            }
            let w = wr * overlap(c, cols);
            weighted += v * w;
            total += w;
        }
    }

    if total > 0.0 {
        weighted / total
    } else {
        Cell::NAN
    }
}

/// Length of cell `index` inside `span`
fn overlap(index: usize, span: (f64, f64)) -> f64 {
    let start = index as f64;
    ((start + 1.0).min(span.1) - start.max(span.0)).max(0.0)
}

/// Remove floating noise from indices that land on a pixel center
fn snap(index: f64) -> f64 {
    let rounded = index.round();
    if (index - rounded).abs() < 1e-9 {
        rounded
    } else {
        index
    }
}

fn sample_bilinear(data: &ElevationArray, row: f64, col: f64) -> Cell {
    let (height, width) = data.dim();

    // Half a pixel of coverage beyond the outermost centers
    if row < -0.5 || col < -0.5 || row > height as f64 - 0.5 || col > width as f64 - 0.5 {
        return Cell::NAN;
    }
    let row = row.clamp(0.0, (height - 1) as f64);
    let col = col.clamp(0.0, (width - 1) as f64);

    let y1 = row.floor() as usize;
    let x1 = col.floor() as usize;
    let y2 = (y1 + 1).min(height - 1);
    let x2 = (x1 + 1).min(width - 1);

    let dy = row - y1 as f64;
    let dx = col - x1 as f64;

    let corners = [
        (y1, x1, (1.0 - dx) * (1.0 - dy)),
        (y1, x2, dx * (1.0 - dy)),
        (y2, x1, (1.0 - dx) * dy),
        (y2, x2, dx * dy),
    ];

    let mut interpolated = 0.0;
    for (r, c, weight) in corners {
        if weight == 0.0 {
            continue;
        }
        let v = data[[r, c]];
        if v.is_nan() {
            return Cell::NAN;
        }
        interpolated += v * weight;
    }
    interpolated
}
