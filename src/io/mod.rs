//! Grid I/O, masking and resampling adapters

pub mod mask;
pub mod resample;
pub mod window;

#[cfg(feature = "gdal")]
pub mod raster;

pub use mask::{PolygonMask, RasterMask};
pub use resample::{AverageResampler, BilinearResampler, NearestResampler, ResampleMethod, Resampler};
pub use window::{nodata_window, TileWindow, WindowSink, WindowSource};

#[cfg(feature = "gdal")]
pub use raster::{compute_ls_factor_file, read_grid, write_grid, GdalWindowReader, GdalWindowWriter};
