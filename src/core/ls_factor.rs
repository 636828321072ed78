//! Slope-length and steepness (LS) factor for a single tile

use crate::core::flow_routing::{accumulate, direction, AccumulationGrid};
use crate::types::{Cell, ElevationArray, TerrainError, TerrainResult};
use ndarray::{Array2, Zip};

/// Unit plot length (meters)
const UNIT_PLOT_LENGTH: f64 = 22.1;

/// Finite-difference derivative along one axis at `i`, given the values at
/// `i - 1`, `i` and `i + 1` (`None` outside the tile).
#[inline]
fn derivative(prev: Option<Cell>, here: Cell, next: Option<Cell>, cell_size: f64) -> f64 {
    let prev = prev.filter(|v| !v.is_nan());
    let next = next.filter(|v| !v.is_nan());
    match (prev, next) {
        (Some(p), Some(n)) => (n - p) / (2.0 * cell_size),
        (None, Some(n)) => (n - here) / cell_size,
        (Some(p), None) => (here - p) / cell_size,
        (None, None) => 0.0,
    }
}

/// Slope in degrees from centred differences, one-sided at edges and no-data
pub fn slope_degrees(tile: &ElevationArray, cell_size: f64) -> ElevationArray {
    let (rows, cols) = tile.dim();
    let mut slope = Array2::from_elem((rows, cols), Cell::NAN);

    Zip::indexed(&mut slope).for_each(|(i, j), out| {
        let z = tile[[i, j]];
        if z.is_nan() {
            return;
        }
        let dz_dx = derivative(
            (j > 0).then(|| tile[[i, j - 1]]),
            z,
            (j + 1 < cols).then(|| tile[[i, j + 1]]),
            cell_size,
        );
        let dz_dy = derivative(
            (i > 0).then(|| tile[[i - 1, j]]),
            z,
            (i + 1 < rows).then(|| tile[[i + 1, j]]),
            cell_size,
        );
        *out = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
    });

    slope
}

/// Rill-to-interrill ratio for a slope sine
pub fn beta(sin_theta: f64) -> f64 {
    let b = (sin_theta / 0.0896) / (3.0 * sin_theta.powf(0.8) + 0.56);
    if b.is_finite() {
        b
    } else {
        0.0
    }
}

/// Slope-length exponent m = beta / (beta + 1)
pub fn length_exponent(sin_theta: f64) -> f64 {
    let b = beta(sin_theta);
    let m = b / (b + 1.0);
    if m.is_finite() {
        m
    } else {
        0.0
    }
}

/// Steepness factor S, piecewise in the slope angle
pub fn steepness(slope_deg: f64) -> f64 {
    let sin_theta = slope_deg.to_radians().sin();
    let s = if slope_deg < 5.0 {
        10.8 * sin_theta + 0.036
    } else if slope_deg < 10.0 {
        16.8 * sin_theta - 0.50
    } else {
        21.9 * sin_theta - 0.96
    };
    s.max(0.0)
}

/// Slope-length factor L for a contributing cell count
pub fn slope_length(accumulation: u32, cell_size: f64, m: f64) -> f64 {
    let lambda = (accumulation as f64).sqrt() * cell_size;
    let l = (lambda / UNIT_PLOT_LENGTH).powf(m);
    if l.is_finite() {
        l
    } else {
        0.0
    }
}

/// LS value of one valid cell
pub fn ls_value(slope_deg: f64, accumulation: u32, cell_size: f64) -> f64 {
    let sin_theta = slope_deg.to_radians().sin();
    let m = length_exponent(sin_theta);
    let ls = slope_length(accumulation, cell_size, m) * steepness(slope_deg);
    if ls.is_finite() {
        ls.max(0.0)
    } else {
        0.0
    }
}

/// LS grid of one tile from its own flow routing.
///
/// No-data cells stay no-data; every valid cell gets a finite LS >= 0.
pub fn compute_ls_tile(tile: &ElevationArray, cell_size: f64) -> TerrainResult<ElevationArray> {
    if !(cell_size > 0.0) || !cell_size.is_finite() {
        return Err(TerrainError::InvalidInput(format!(
            "cell size must be positive, got {}",
            cell_size
        )));
    }

    let dirs = direction(tile);
    let acc: AccumulationGrid = accumulate(tile, &dirs)?;
    let slope = slope_degrees(tile, cell_size);

    let mut ls = Array2::from_elem(tile.dim(), Cell::NAN);
    Zip::from(&mut ls)
        .and(tile)
        .and(&slope)
        .and(&acc)
        .for_each(|out, &z, &s, &a| {
            if !z.is_nan() {
                *out = ls_value(s, a, cell_size);
            }
        });

    Ok(ls)
}
