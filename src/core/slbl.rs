//! Sloping Local Base Level (SLBL) failure-surface reconstruction
//!
//! Iteratively lowers a copy of the DEM toward the mean of its 4-neighbour
//! extremes minus a curvature constant, producing the inferred basal surface
//! of a landslide or debris source area.

use crate::types::{Cell, Deadline, ElevationArray, Grid, TerrainError, TerrainResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Parameters for SLBL relaxation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlblParams {
    /// Maximum vertical depth of the failure (meters)
    pub z_max: f64,
    /// Iteration cap
    pub max_iterations: usize,
    /// Clamp half-width as a multiple of `z_max`
    pub clamp_factor: f64,
    /// Values below this are treated as numerical blow-up
    pub blowup_threshold: f64,
}

impl Default for SlblParams {
    fn default() -> Self {
        Self {
            z_max: 5.0,
            max_iterations: 10_000,
            clamp_factor: 2_000.0, // +/- 1e4 m for the default depth
            blowup_threshold: -1e10,
        }
    }
}

/// Planform scale of the valid-cell region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionGeometry {
    /// Mean row-wise extent of valid cells (meters)
    pub avg_width: f64,
    /// Mean column-wise extent of valid cells (meters)
    pub avg_length: f64,
    /// Squared mean of width and length (square meters)
    pub area: f64,
}

impl RegionGeometry {
    /// Measure the valid region of `data`.
    ///
    /// Fails with `DegenerateRegion` when there are no valid cells or when
    /// either mean extent is zero, since the curvature constant is then undefined.
    pub fn measure(data: &ElevationArray, cell_size: f64) -> TerrainResult<Self> {
        let (rows, cols) = data.dim();
        let mut row_span: Vec<Option<(usize, usize)>> = vec![None; rows];
        let mut col_span: Vec<Option<(usize, usize)>> = vec![None; cols];

        for ((i, j), v) in data.indexed_iter() {
            if v.is_nan() {
                continue;
            }
            row_span[i] = Some(match row_span[i] {
                None => (j, j),
                Some((lo, hi)) => (lo.min(j), hi.max(j)),
            });
            col_span[j] = Some(match col_span[j] {
                None => (i, i),
                Some((lo, hi)) => (lo.min(i), hi.max(i)),
            });
        }

        let widths: Vec<f64> = row_span.iter().flatten().map(|(lo, hi)| (hi - lo) as f64).collect();
        let lengths: Vec<f64> = col_span.iter().flatten().map(|(lo, hi)| (hi - lo) as f64).collect();

        if widths.is_empty() {
            return Err(TerrainError::DegenerateRegion("DEM has no valid cells".to_string()));
        }

        let avg_width = widths.iter().sum::<f64>() / widths.len() as f64 * cell_size;
        let avg_length = lengths.iter().sum::<f64>() / lengths.len() as f64 * cell_size;

        if avg_width <= 0.0 || avg_length <= 0.0 {
            return Err(TerrainError::DegenerateRegion(format!(
                "valid region has zero extent (mean width {:.3} m, mean length {:.3} m)",
                avg_width, avg_length
            )));
        }

        let half_sum = (avg_width + avg_length) / 2.0;
        Ok(Self { avg_width, avg_length, area: half_sum * half_sum })
    }

    /// Curvature constant C = 4 z_max dx^2 / A_hs
    pub fn curvature(&self, z_max: f64, cell_size: f64) -> f64 {
        4.0 * z_max * cell_size * cell_size / self.area
    }
}

/// Result of an SLBL run
#[derive(Debug, Clone)]
pub struct SlblOutcome {
    /// Reconstructed failure surface, same shape as the DEM, every cell finite
    pub surface: Grid,
    pub converged: bool,
    pub iterations: usize,
    /// Largest absolute change in the final iteration
    pub max_change: f64,
    /// Convergence tolerance (2C)
    pub tolerance: f64,
    /// Curvature constant C
    pub curvature: f64,
    pub geometry: RegionGeometry,
}

impl SlblOutcome {
    /// Surface of a converged run, or `ConvergenceFailure`
    pub fn into_converged(self) -> TerrainResult<Grid> {
        if self.converged {
            Ok(self.surface)
        } else {
            Err(TerrainError::ConvergenceFailure {
                iterations: self.iterations,
                max_change: self.max_change,
                tolerance: self.tolerance,
            })
        }
    }
}

/// SLBL relaxation solver
pub struct SlblSolver {
    params: SlblParams,
    deadline: Deadline,
}

impl SlblSolver {
    pub fn new(params: SlblParams) -> Self {
        Self { params, deadline: Deadline::none() }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn params(&self) -> &SlblParams {
        &self.params
    }

    /// Reconstruct the failure surface under `dem`
    pub fn solve(&self, dem: &Grid) -> TerrainResult<SlblOutcome> {
        log::info!("Starting SLBL relaxation");
        log::debug!("SLBL parameters: {:?}", self.params);

        self.validate(dem)?;

        let cell_size = dem.cell_size();
        let geometry = RegionGeometry::measure(&dem.data, cell_size)?;
        let curvature = geometry.curvature(self.params.z_max, cell_size);
        let tolerance = 2.0 * curvature;
        let band = self.params.z_max * self.params.clamp_factor;

        log::debug!(
            "Mean width {:.3} m, mean length {:.3} m, A_hs {:.3} m2",
            geometry.avg_width,
            geometry.avg_length,
            geometry.area
        );
        log::debug!("Curvature constant C = {:.6}, tolerance = {:.6}", curvature, tolerance);

        let mut surface = dem.data.clone();
        let mut next = Array2::from_elem(surface.dim(), Cell::NAN);
        let mut iterations = 0;
        let mut max_change = f64::INFINITY;
        let mut converged = false;

        while iterations < self.params.max_iterations {
            self.deadline.check("SLBL relaxation")?;
            iterations += 1;

            relax_pass(&surface, &dem.data, curvature, band, &mut next);
            max_change = largest_change(&surface, &next);
            self.sanitize(&mut next);

            std::mem::swap(&mut surface, &mut next);

            log::debug!("Iteration {}, max change {:.6}", iterations, max_change);

            if max_change < tolerance {
                converged = true;
                break;
            }
        }

        if converged {
            log::info!("SLBL converged after {} iterations (max change {:.6})", iterations, max_change);
        } else {
            log::warn!(
                "SLBL stopped at the iteration cap ({}) with max change {:.6} >= tolerance {:.6}",
                iterations,
                max_change,
                tolerance
            );
        }

        // Remaining gaps take the lowest DEM elevation
        if let Some(floor) = dem.min_valid() {
            let mut filled = 0usize;
            surface.mapv_inplace(|v| {
                if v.is_finite() {
                    v
                } else {
                    filled += 1;
                    floor
                }
            });
            if filled > 0 {
                log::debug!("Filled {} no-data cells with minimum elevation {:.3}", filled, floor);
            }
        }

        Ok(SlblOutcome {
            surface: Grid {
                data: surface,
                nodata: dem.nodata,
                geo_transform: dem.geo_transform,
                crs: dem.crs.clone(),
            },
            converged,
            iterations,
            max_change,
            tolerance,
            curvature,
            geometry,
        })
    }

    fn validate(&self, dem: &Grid) -> TerrainResult<()> {
        let (rows, cols) = dem.dim();
        if rows == 0 || cols == 0 {
            return Err(TerrainError::InvalidInput("DEM is empty".to_string()));
        }
        if !(self.params.z_max > 0.0) || !self.params.z_max.is_finite() {
            return Err(TerrainError::InvalidInput(format!(
                "z_max must be positive, got {}",
                self.params.z_max
            )));
        }
        if !(dem.cell_size() > 0.0) || !dem.cell_size().is_finite() {
            return Err(TerrainError::InvalidInput(format!(
                "cell size must be positive, got {}",
                dem.cell_size()
            )));
        }
        if self.params.max_iterations == 0 {
            return Err(TerrainError::InvalidInput("max_iterations must be at least 1".to_string()));
        }
        if !(self.params.clamp_factor > 0.0) {
            return Err(TerrainError::InvalidInput(format!(
                "clamp_factor must be positive, got {}",
                self.params.clamp_factor
            )));
        }
        Ok(())
    }

    /// Non-finite and blown-up values become no-data
    fn sanitize(&self, surface: &mut ElevationArray) {
        let threshold = self.params.blowup_threshold;
        let mut invalidated = 0usize;
        surface.mapv_inplace(|v| {
            if v.is_nan() {
                v
            } else if !v.is_finite() || v < threshold {
                invalidated += 1;
                Cell::NAN
            } else {
                v
            }
        });
        if invalidated > 0 {
            log::warn!("Invalidated {} non-finite or runaway cells", invalidated);
        }
    }
}

/// New value of one cell given the previous surface
#[inline]
fn relax_cell(prev: &ElevationArray, dem: &ElevationArray, i: usize, j: usize, curvature: f64, band: f64) -> Cell {
    let (rows, cols) = prev.dim();
    let current = prev[[i, j]];
    if current.is_nan() {
        return current;
    }

    // Edges reuse the cell's own value
    let up = if i > 0 { prev[[i - 1, j]] } else { current };
    let down = if i + 1 < rows { prev[[i + 1, j]] } else { current };
    let left = if j > 0 { prev[[i, j - 1]] } else { current };
    let right = if j + 1 < cols { prev[[i, j + 1]] } else { current };

    // Cells on the rim of the valid region stay fixed
    if up.is_nan() || down.is_nan() || left.is_nan() || right.is_nan() {
        return current;
    }

    let highest = up.max(down).max(left.max(right));
    let lowest = up.min(down).min(left.min(right));
    let target = (highest + lowest) / 2.0 - curvature;

    let lowered = if current > target { target } else { current };
    let base = dem[[i, j]];
    lowered.clamp(base - band, base + band)
}

#[cfg(feature = "parallel")]
fn relax_pass(prev: &ElevationArray, dem: &ElevationArray, curvature: f64, band: f64, next: &mut ElevationArray) {
    Zip::indexed(next).par_for_each(|(i, j), out| {
        *out = relax_cell(prev, dem, i, j, curvature, band);
    });
}

#[cfg(not(feature = "parallel"))]
fn relax_pass(prev: &ElevationArray, dem: &ElevationArray, curvature: f64, band: f64, next: &mut ElevationArray) {
    Zip::indexed(next).for_each(|(i, j), out| {
        *out = relax_cell(prev, dem, i, j, curvature, band);
    });
}

/// Largest absolute change, ignoring cells that are no-data on either side
fn largest_change(prev: &ElevationArray, next: &ElevationArray) -> f64 {
    Zip::from(prev).and(next).fold(0.0f64, |acc, &a, &b| {
        let delta = (b - a).abs();
        if delta.is_finite() {
            acc.max(delta)
        } else {
            acc
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_geometry_of_rectangle() {
        let data = Array2::from_elem((3, 5), 1.0);
        let geometry = RegionGeometry::measure(&data, 2.0).unwrap();

        // widths 4 cells, lengths 2 cells
        assert_relative_eq!(geometry.avg_width, 8.0);
        assert_relative_eq!(geometry.avg_length, 4.0);
        assert_relative_eq!(geometry.area, 36.0);
        assert_relative_eq!(geometry.curvature(5.0, 2.0), 4.0 * 5.0 * 4.0 / 36.0);
    }

    #[test]
    fn test_geometry_single_row_is_degenerate() {
        let data = array![[f64::NAN, f64::NAN, f64::NAN], [1.0, 2.0, 3.0]];
        let result = RegionGeometry::measure(&data, 1.0);
        assert!(matches!(result, Err(TerrainError::DegenerateRegion(_))));
    }

    #[test]
    fn test_relax_cell_edges_reuse_own_value() {
        let prev = array![[10.0, 4.0], [2.0, 6.0]];
        // corner (0,0): neighbours up=10 (self), left=10 (self), down=2, right=4
        let v = relax_cell(&prev, &prev, 0, 0, 1.0, 1e4);
        assert_relative_eq!(v, (10.0 + 2.0) / 2.0 - 1.0);
    }

    #[test]
    fn test_relax_cell_pinned_next_to_nodata() {
        let prev = array![[f64::NAN, 0.0, 0.0], [0.0, 9.0, 0.0], [0.0, 0.0, 0.0]];
        assert_eq!(relax_cell(&prev, &prev, 0, 1, 1.0, 1e4), 0.0);
        assert_relative_eq!(relax_cell(&prev, &prev, 1, 1, 1.0, 1e4), -1.0);
    }

    #[test]
    fn test_clamp_band_limits_lowering() {
        let prev = array![[0.0, 0.0, 0.0], [0.0, 100.0, 0.0], [0.0, 0.0, 0.0]];
        let v = relax_cell(&prev, &prev, 1, 1, 1.0, 10.0);
        assert_eq!(v, 90.0);
    }

    #[test]
    fn test_largest_change_ignores_nodata() {
        let a = array![[1.0, f64::NAN], [3.0, 4.0]];
        let b = array![[1.5, 2.0], [3.0, 1.0]];
        assert_relative_eq!(largest_change(&a, &b), 3.0);
    }
}
