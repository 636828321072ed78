//! D8 flow routing for a single tile
//!
//! Each valid cell drains to the steepest strictly-lower of its eight
//! neighbours. Accumulation counts every cell draining through a cell,
//! itself included. Routing never crosses the tile edge.

use crate::types::{ElevationArray, TerrainError, TerrainResult};
use ndarray::{Array2, Zip};
use std::collections::VecDeque;

/// Flow direction code for cells without an outflow
pub const NO_FLOW: i8 = -1;

/// (row, col) offsets in code order: E, NE, N, NW, W, SW, S, SE
pub const D8_OFFSETS: [(isize, isize); 8] = [
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
];

/// Distance in cells for each code
const D8_DIST: [f64; 8] = [
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
    1.0,
    std::f64::consts::SQRT_2,
];

/// Per-tile direction codes (0..7 or `NO_FLOW`)
pub type FlowDirectionGrid = Array2<i8>;

/// Per-tile upstream cell counts, each at least 1
pub type AccumulationGrid = Array2<u32>;

/// Downstream cell of `(row, col)` for `code`, if it lies inside `shape`
#[inline]
pub fn downstream(row: usize, col: usize, code: i8, shape: (usize, usize)) -> Option<(usize, usize)> {
    if !(0..8).contains(&code) {
        return None;
    }
    let (dr, dc) = D8_OFFSETS[code as usize];
    let nr = row as isize + dr;
    let nc = col as isize + dc;
    if nr < 0 || nc < 0 || nr as usize >= shape.0 || nc as usize >= shape.1 {
        return None;
    }
    Some((nr as usize, nc as usize))
}

#[inline]
fn steepest_descent(tile: &ElevationArray, row: usize, col: usize) -> i8 {
    let z = tile[[row, col]];
    if z.is_nan() {
        return NO_FLOW;
    }

    let shape = tile.dim();
    let mut best = NO_FLOW;
    let mut max_slope = 0.0;

    for code in 0..8i8 {
        let Some((nr, nc)) = downstream(row, col, code, shape) else {
            continue;
        };
        let zn = tile[[nr, nc]];
        if zn.is_nan() {
            continue;
        }
        let slope = (z - zn) / D8_DIST[code as usize];
        // Strict comparison keeps the first of equal slopes
        if slope > max_slope {
            max_slope = slope;
            best = code;
        }
    }
    best
}

/// D8 flow direction of every cell in `tile`.
///
/// Slopes are compared in cell units, so the cell size does not change the
/// chosen direction. Flats, pits and no-data cells get `NO_FLOW`.
pub fn direction(tile: &ElevationArray) -> FlowDirectionGrid {
    let mut dirs = Array2::from_elem(tile.dim(), NO_FLOW);

    #[cfg(feature = "parallel")]
    Zip::indexed(&mut dirs).par_for_each(|(i, j), d| {
        *d = steepest_descent(tile, i, j);
    });

    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut dirs).for_each(|(i, j), d| {
        *d = steepest_descent(tile, i, j);
    });

    dirs
}

/// Topological flow accumulation over a direction grid.
///
/// Cells with no upstream contributors seed a FIFO queue in row-major order;
/// a cell's count is final when it is dequeued and is then added downstream.
pub fn accumulate(tile: &ElevationArray, dirs: &FlowDirectionGrid) -> TerrainResult<AccumulationGrid> {
    if tile.dim() != dirs.dim() {
        return Err(TerrainError::InvalidInput(format!(
            "direction grid {:?} does not match tile {:?}",
            dirs.dim(),
            tile.dim()
        )));
    }

    let shape = dirs.dim();
    let mut in_degree = Array2::<u32>::zeros(shape);

    for ((row, col), &code) in dirs.indexed_iter() {
        if code == NO_FLOW {
            continue;
        }
        if !(0..8).contains(&code) {
            return Err(TerrainError::InvalidInput(format!(
                "invalid flow direction code {} at ({}, {})",
                code, row, col
            )));
        }
        if let Some(target) = downstream(row, col, code, shape) {
            in_degree[target] += 1;
        }
    }

    let mut accumulation = Array2::<u32>::ones(shape);
    let mut queue: VecDeque<(usize, usize)> = in_degree
        .indexed_iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut resolved = 0usize;
    while let Some((row, col)) = queue.pop_front() {
        resolved += 1;
        let Some(target) = downstream(row, col, dirs[[row, col]], shape) else {
            continue;
        };
        let upstream = accumulation[[row, col]];
        accumulation[target] += upstream;
        in_degree[target] -= 1;
        if in_degree[target] == 0 {
            queue.push_back(target);
        }
    }

    if resolved < accumulation.len() {
        return Err(TerrainError::InvalidInput(format!(
            "flow direction grid contains a cycle ({} of {} cells unresolved)",
            accumulation.len() - resolved,
            accumulation.len()
        )));
    }

    Ok(accumulation)
}
