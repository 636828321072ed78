//! Grid alignment and elevation-difference volume integration

use crate::io::resample::Resampler;
use crate::types::{GeoTransform, Grid, GridStats, TerrainError, TerrainResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Slack for floating noise when counting whole target pixels
pub(crate) const PIXEL_COUNT_EPSILON: f64 = 1e-9;

/// Two grids on one index space: same shape, same transform
#[derive(Debug, Clone)]
pub struct AlignedGridPair {
    first: Grid,
    second: Grid,
}

impl AlignedGridPair {
    pub fn new(first: Grid, second: Grid) -> TerrainResult<Self> {
        if first.dim() != second.dim() {
            return Err(TerrainError::AlignmentMismatch(format!(
                "shapes differ: {:?} vs {:?}",
                first.dim(),
                second.dim()
            )));
        }
        if first.geo_transform != second.geo_transform {
            return Err(TerrainError::AlignmentMismatch(format!(
                "transforms differ: {:?} vs {:?}",
                first.geo_transform, second.geo_transform
            )));
        }
        Ok(Self { first, second })
    }

    pub fn first(&self) -> &Grid {
        &self.first
    }

    pub fn second(&self) -> &Grid {
        &self.second
    }

    pub fn dim(&self) -> (usize, usize) {
        self.first.dim()
    }

    pub fn geo_transform(&self) -> &GeoTransform {
        &self.first.geo_transform
    }

    pub fn pixel_area(&self) -> f64 {
        self.first.pixel_area()
    }

    pub fn into_parts(self) -> (Grid, Grid) {
        (self.first, self.second)
    }
}

/// Resamples two grids onto the bounds of the first at the resolution of the second
pub struct GridAligner<'r> {
    resampler: &'r dyn Resampler,
}

impl<'r> GridAligner<'r> {
    pub fn new(resampler: &'r dyn Resampler) -> Self {
        Self { resampler }
    }

    /// Common pixel lattice for `a` and `b`
    pub fn target_lattice(a: &Grid, b: &Grid) -> TerrainResult<(GeoTransform, (usize, usize))> {
        let bounds = a.bounds();
        if bounds.intersection(&b.bounds()).is_none() {
            return Err(TerrainError::AlignmentMismatch(format!(
                "grid footprints do not overlap: {:?} vs {:?}",
                bounds,
                b.bounds()
            )));
        }

        let res_x = b.geo_transform.pixel_width.abs();
        let res_y = b.geo_transform.pixel_height.abs();
        let cols = (bounds.width() / res_x + PIXEL_COUNT_EPSILON).floor() as usize;
        let rows = (bounds.height() / res_y + PIXEL_COUNT_EPSILON).floor() as usize;

        if rows == 0 || cols == 0 {
            return Err(TerrainError::AlignmentMismatch(format!(
                "target grid is empty ({}x{}) for extent {:.3} x {:.3} at resolution {} x {}",
                rows,
                cols,
                bounds.width(),
                bounds.height(),
                res_x,
                res_y
            )));
        }

        let target = GeoTransform {
            top_left_x: bounds.min_x,
            pixel_width: res_x,
            top_left_y: bounds.max_y,
            pixel_height: -res_y,
        };
        Ok((target, (rows, cols)))
    }

    pub fn align(&self, a: &Grid, b: &Grid) -> TerrainResult<AlignedGridPair> {
        log::info!("Aligning {:?} grid to {:?} grid resolution", a.dim(), b.dim());

        let (target, shape) = Self::target_lattice(a, b)?;
        log::debug!("Alignment target: {:?}, shape {:?}", target, shape);

        let first = self.resampler.resample(a, &target, shape)?;
        let second = self.resampler.resample(b, &target, shape)?;

        let shared = Zip::from(&first.data)
            .and(&second.data)
            .fold(0usize, |n, x, y| if x.is_nan() || y.is_nan() { n } else { n + 1 });
        if shared == 0 {
            return Err(TerrainError::AlignmentMismatch(
                "no cell is valid in both resampled grids".to_string(),
            ));
        }

        log::info!("Aligned grids to {}x{} ({} shared valid cells)", shape.0, shape.1, shared);
        AlignedGridPair::new(first, second)
    }
}

/// Exclusive elevation range of plausible values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl Default for ValidRange {
    fn default() -> Self {
        Self { min: -500.0, max: 9000.0 }
    }
}

impl ValidRange {
    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }
}

#[inline]
fn usable(value: f64, sentinel: f64, range: &ValidRange) -> bool {
    !value.is_nan() && value != sentinel && range.contains(value)
}

/// Cells that take part in integration
pub fn validity_mask(pair: &AlignedGridPair, range: &ValidRange) -> Array2<bool> {
    let (a, b) = (pair.first(), pair.second());
    let mut mask = Array2::from_elem(pair.dim(), false);
    Zip::from(&mut mask)
        .and(&a.data)
        .and(&b.data)
        .for_each(|m, &x, &y| {
            *m = usable(x, a.nodata, range) && usable(y, b.nodata, range);
        });
    mask
}

/// Integrated elevation difference between the two grids of a pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEstimate {
    /// |sum(first - second)| * pixel area
    pub volume: f64,
    /// sum(first - second) * pixel area
    pub signed_volume: f64,
    pub pixel_area: f64,
    pub valid_cells: usize,
    /// Per-cell difference statistics
    pub difference: GridStats,
}

pub fn integrate_volume(pair: &AlignedGridPair, pixel_area: f64, range: &ValidRange) -> TerrainResult<VolumeEstimate> {
    if !(pixel_area > 0.0) || !pixel_area.is_finite() {
        return Err(TerrainError::InvalidInput(format!(
            "pixel area must be positive, got {}",
            pixel_area
        )));
    }

    let mask = validity_mask(pair, range);
    let diffs: Vec<f64> = Zip::from(&mask)
        .and(&pair.first().data)
        .and(&pair.second().data)
        .fold(Vec::new(), |mut acc, &m, &x, &y| {
            if m {
                acc.push(x - y);
            }
            acc
        });

    let Some(difference) = GridStats::from_values(diffs.iter().copied()) else {
        log::warn!("No valid cells in the aligned grids, volume is undefined");
        return Err(TerrainError::NoValidCells(format!(
            "no cell of the {}x{} aligned grids lies inside ({}, {}) in both grids",
            pair.dim().0,
            pair.dim().1,
            range.min,
            range.max
        )));
    };

    let sum: f64 = diffs.iter().sum();
    let signed_volume = sum * pixel_area;
    let estimate = VolumeEstimate {
        volume: signed_volume.abs(),
        signed_volume,
        pixel_area,
        valid_cells: difference.valid_count,
        difference,
    };

    log::info!(
        "Integrated volume {:.3} over {} cells (pixel area {:.3})",
        estimate.volume,
        estimate.valid_cells,
        pixel_area
    );
    log::debug!(
        "Difference stats: min {:.3}, max {:.3}, mean {:.3}",
        difference.min,
        difference.max,
        difference.mean
    );

    Ok(estimate)
}
