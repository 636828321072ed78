use crate::types::{Cell, Grid, TerrainError, TerrainResult};
use ndarray::Array2;

/// Polygon mask capability.
///
/// Polygons are reprojected into raster CRS and rasterized outside the core;
/// the core only asks for a clipped grid.
pub trait PolygonMask {
    fn clip(&self, grid: &Grid) -> TerrainResult<Grid>;
}

/// Mask already rasterized onto the grid's index space
#[derive(Debug, Clone)]
pub struct RasterMask {
    inside: Array2<bool>,
    crop: bool,
}

impl RasterMask {
    pub fn new(inside: Array2<bool>) -> Self {
        Self { inside, crop: false }
    }

    /// Also shrink the output to the bounding extent of the inside cells
    pub fn cropped(mut self) -> Self {
        self.crop = true;
        self
    }

    pub fn inside_count(&self) -> usize {
        self.inside.iter().filter(|&&v| v).count()
    }

    /// Row/column extent of inside cells as (row0, row1, col0, col1), inclusive
    fn extent(&self) -> Option<(usize, usize, usize, usize)> {
        let mut extent: Option<(usize, usize, usize, usize)> = None;
        for ((i, j), &inside) in self.inside.indexed_iter() {
            if !inside {
                continue;
            }
            extent = Some(match extent {
                None => (i, i, j, j),
                Some((r0, r1, c0, c1)) => (r0.min(i), r1.max(i), c0.min(j), c1.max(j)),
            });
        }
        extent
    }
}

impl PolygonMask for RasterMask {
    fn clip(&self, grid: &Grid) -> TerrainResult<Grid> {
        if self.inside.dim() != grid.dim() {
            return Err(TerrainError::InvalidInput(format!(
                "mask shape {:?} does not match grid shape {:?}",
                self.inside.dim(),
                grid.dim()
            )));
        }

        let (r0, r1, c0, c1) = self.extent().ok_or_else(|| {
            TerrainError::NoValidCells("polygon mask covers no grid cells".to_string())
        })?;

        let mut clipped = grid.clone();
        ndarray::Zip::from(&mut clipped.data)
            .and(&self.inside)
            .for_each(|v, &inside| {
                if !inside {
                    *v = Cell::NAN;
                }
            });

        log::debug!(
            "Clipped grid to {} mask cells (extent rows {}..={}, cols {}..={})",
            self.inside_count(),
            r0,
            r1,
            c0,
            c1
        );

        if self.crop {
            Ok(clipped.window(r0, c0, r1 - r0 + 1, c1 - c0 + 1))
        } else {
            Ok(clipped)
        }
    }
}
