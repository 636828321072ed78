//! terrasource: terrain-grid engine for debris-flow source volumes and soil-erosion LS factors
//!
//! Reconstructs the basal failure surface under a slope with the Sloping Local
//! Base Level method, integrates the evacuated volume between two aligned
//! grids, and computes the slope-length and steepness (LS) factor over large
//! DEMs window by window.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, Cell, Deadline, ElevationArray, GeoTransform, Grid, GridStats, Stage, StageContext,
    TerrainError, TerrainResult, DEFAULT_NODATA,
};

pub use crate::core::{
    compute_ls_factor, estimate_source_volume, integrate_volume, GridAligner, LsPipelineParams,
    ProcessingReport, SlblParams, SlblSolver, SourceVolumeParams, TiledLsParams, TiledLsProcessor,
    ValidRange,
};
pub use io::{
    AverageResampler, BilinearResampler, NearestResampler, PolygonMask, RasterMask, ResampleMethod, Resampler,
    WindowSink, WindowSource,
};

#[cfg(feature = "python")]
mod python {
    use crate::core::{
        compute_ls_factor, estimate_source_volume, LsPipelineParams, SlblParams, SlblSolver,
        SourceVolumeParams, TiledLsParams,
    };
    use crate::io::{PolygonMask, RasterMask, ResampleMethod};
    use crate::types::{Deadline, GeoTransform, Grid, TerrainError};
    use crate::ValidRange;
    use numpy::{PyReadonlyArray2, ToPyArray};
    use pyo3::exceptions::{PyRuntimeError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    /// Convert PyReadonlyArray2 to ndarray Array2
    fn numpy_to_array2<T>(arr: PyReadonlyArray2<T>) -> ndarray::Array2<T>
    where
        T: Copy + numpy::Element,
    {
        arr.as_array().to_owned()
    }

    fn to_py_err(err: TerrainError) -> PyErr {
        match err.root() {
            TerrainError::InvalidInput(_) | TerrainError::DegenerateRegion(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }

    fn grid_from_numpy(dem: PyReadonlyArray2<f64>, cell_size: f64, nodata: f64) -> PyResult<Grid> {
        if !(cell_size > 0.0) {
            return Err(PyValueError::new_err(format!("cell_size must be positive, got {}", cell_size)));
        }
        Grid::new(numpy_to_array2(dem), nodata, GeoTransform::with_cell_size(cell_size)).map_err(to_py_err)
    }

    /// Reconstruct the SLBL failure surface of a DEM
    #[pyfunction]
    #[pyo3(signature = (dem, cell_size, z_max=5.0, max_iterations=10000, nodata=-9999.0))]
    fn solve_failure_surface(
        py: Python,
        dem: PyReadonlyArray2<f64>,
        cell_size: f64,
        z_max: f64,
        max_iterations: usize,
        nodata: f64,
    ) -> PyResult<PyObject> {
        let grid = grid_from_numpy(dem, cell_size, nodata)?;
        let params = SlblParams { z_max, max_iterations, ..Default::default() };

        let outcome = py
            .allow_threads(|| SlblSolver::new(params).solve(&grid))
            .map_err(to_py_err)?;

        let result = PyDict::new(py);
        result.set_item("surface", outcome.surface.to_output_array().to_pyarray(py))?;
        result.set_item("converged", outcome.converged)?;
        result.set_item("iterations", outcome.iterations)?;
        result.set_item("max_change", outcome.max_change)?;
        result.set_item("tolerance", outcome.tolerance)?;
        result.set_item("curvature", outcome.curvature)?;
        Ok(result.into())
    }

    /// Tiled LS factor of a DEM
    #[pyfunction]
    #[pyo3(
        name = "compute_ls_factor",
        signature = (dem, cell_size, chunk_size=500, nodata=-9999.0, target_resolution=None, resample_method="average")
    )]
    fn compute_ls_factor_py(
        py: Python,
        dem: PyReadonlyArray2<f64>,
        cell_size: f64,
        chunk_size: usize,
        nodata: f64,
        target_resolution: Option<f64>,
        resample_method: &str,
    ) -> PyResult<PyObject> {
        let grid = grid_from_numpy(dem, cell_size, nodata)?;
        let resample_method: ResampleMethod = resample_method.parse().map_err(to_py_err)?;
        let params = LsPipelineParams {
            tiling: TiledLsParams { chunk_size, output_nodata: nodata, ..Default::default() },
            target_resolution,
            resample_method,
        };

        let output = py
            .allow_threads(|| compute_ls_factor(&grid, &params, Deadline::none()))
            .map_err(to_py_err)?;

        let result = PyDict::new(py);
        result.set_item("ls", output.ls.to_output_array().to_pyarray(py))?;
        result.set_item("cell_size", output.ls.cell_size())?;
        result.set_item("resample_method", resample_method.to_string())?;
        result.set_item("total_tiles", output.tiles.total_tiles)?;
        result.set_item("failed_tiles", output.tiles.failures.len())?;
        if let Some(stats) = output.ls_stats {
            result.set_item("min", stats.min)?;
            result.set_item("max", stats.max)?;
            result.set_item("mean", stats.mean)?;
        }
        Ok(result.into())
    }

    /// Source volume above the SLBL surface, optionally inside a rasterized polygon
    #[pyfunction]
    #[pyo3(signature = (dem, cell_size, z_max=5.0, nodata=-9999.0, mask=None, min_valid=-500.0, max_valid=9000.0))]
    #[allow(clippy::too_many_arguments)]
    fn estimate_volume(
        py: Python,
        dem: PyReadonlyArray2<f64>,
        cell_size: f64,
        z_max: f64,
        nodata: f64,
        mask: Option<PyReadonlyArray2<bool>>,
        min_valid: f64,
        max_valid: f64,
    ) -> PyResult<PyObject> {
        let grid = grid_from_numpy(dem, cell_size, nodata)?;
        let mask = mask.map(|m| RasterMask::new(numpy_to_array2(m)).cropped());
        let params = SourceVolumeParams {
            slbl: SlblParams { z_max, ..Default::default() },
            valid_range: ValidRange { min: min_valid, max: max_valid },
            require_convergence: false,
        };

        let output = py
            .allow_threads(|| {
                let mask = mask.as_ref().map(|m| m as &dyn PolygonMask);
                estimate_source_volume(&grid, mask, &params, Deadline::none())
            })
            .map_err(to_py_err)?;

        let result = PyDict::new(py);
        result.set_item("volume", output.volume.volume)?;
        result.set_item("valid_cells", output.volume.valid_cells)?;
        result.set_item("converged", output.slbl.converged)?;
        result.set_item("iterations", output.slbl.iterations)?;
        result.set_item("surface", output.surface.to_output_array().to_pyarray(py))?;
        result.set_item("report", output.report.export_json().map_err(to_py_err)?)?;
        Ok(result.into())
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(solve_failure_surface, m)?)?;
        m.add_function(wrap_pyfunction!(compute_ls_factor_py, m)?)?;
        m.add_function(wrap_pyfunction!(estimate_volume, m)?)?;
        Ok(())
    }
}
