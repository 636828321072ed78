use crate::core::tiled_ls::{TiledLsParams, TiledLsProcessor, TiledLsReport};
use crate::io::window::{TileWindow, WindowSink, WindowSource};
use crate::types::{Cell, ElevationArray, GeoTransform, Grid, TerrainError, TerrainResult};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Windowed reader over the first band of a GDAL raster
pub struct GdalWindowReader {
    dataset: Dataset,
    shape: (usize, usize),
    nodata: Option<f64>,
    geo_transform: GeoTransform,
    crs: Option<String>,
}

impl GdalWindowReader {
    pub fn open<P: AsRef<Path>>(path: P) -> TerrainResult<Self> {
        log::info!("Opening raster: {}", path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?)?;
        let (width, height) = dataset.raster_size();
        let nodata = dataset.rasterband(1)?.no_data_value();
        let projection = dataset.projection();
        let crs = if projection.is_empty() { None } else { Some(projection) };

        log::debug!("Raster size: {}x{}, no-data {:?}", width, height, nodata);
        log::debug!("Raster geotransform: {:?}", geo_transform);

        Ok(Self { dataset, shape: (height, width), nodata, geo_transform, crs })
    }

    pub fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    pub fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }
}

impl WindowSource for GdalWindowReader {
    fn shape(&self) -> (usize, usize) {
        self.shape
    }

    fn read_window(&mut self, window: &TileWindow) -> TerrainResult<ElevationArray> {
        window.check_within(self.shape)?;
        let band = self.dataset.rasterband(1)?;
        let buffer = band.read_as::<f64>(
            (window.col_off as isize, window.row_off as isize),
            (window.cols, window.rows),
            (window.cols, window.rows),
            None,
        )?;

        let mut data = Array2::from_shape_vec(window.shape(), buffer.data)
            .map_err(|e| TerrainError::InvalidInput(format!("failed to reshape window data: {}", e)))?;

        if let Some(nodata) = self.nodata {
            data.mapv_inplace(|v| if v == nodata { Cell::NAN } else { v });
        }
        Ok(data)
    }
}

/// GeoTIFF writer that publishes its file only on `finish`.
///
/// Data goes to a temporary file beside the target; dropping the writer
/// without finishing removes it.
pub struct GdalWindowWriter {
    dataset: Dataset,
    temp_path: tempfile::TempPath,
    target: PathBuf,
    nodata: f64,
    shape: (usize, usize),
}

impl GdalWindowWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        shape: (usize, usize),
        geo_transform: &GeoTransform,
        nodata: f64,
        crs: Option<&str>,
    ) -> TerrainResult<Self> {
        let target = path.as_ref().to_path_buf();
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp_path = tempfile::Builder::new()
            .prefix(".terrasource-")
            .suffix(".tif")
            .tempfile_in(&dir)?
            .into_temp_path();

        let (height, width) = shape;
        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut dataset = driver.create_with_band_type::<f64, _>(
            &temp_path,
            width as isize,
            height as isize,
            1,
        )?;
        dataset.set_geo_transform(&geo_transform.to_gdal())?;
        if let Some(crs) = crs {
            dataset.set_projection(crs)?;
        }
        dataset.rasterband(1)?.set_no_data_value(Some(nodata))?;

        log::debug!("Writing {}x{} raster via {}", height, width, temp_path.display());
        Ok(Self { dataset, temp_path, target, nodata, shape })
    }

    /// Close the dataset and move it to the target path
    pub fn finish(self) -> TerrainResult<PathBuf> {
        let Self { dataset, temp_path, target, .. } = self;
        drop(dataset);
        temp_path.persist(&target).map_err(|e| TerrainError::Io(e.error))?;
        log::info!("Raster saved to: {}", target.display());
        Ok(target)
    }
}

impl WindowSink for GdalWindowWriter {
    fn write_window(&mut self, window: &TileWindow, data: &ElevationArray) -> TerrainResult<()> {
        window.check_within(self.shape)?;
        if data.dim() != window.shape() {
            return Err(TerrainError::InvalidInput(format!(
                "window data is {:?}, expected {:?}",
                data.dim(),
                window.shape()
            )));
        }
        let nodata = self.nodata;
        let flat: Vec<f64> = data.iter().map(|&v| if v.is_finite() { v } else { nodata }).collect();
        let buffer = Buffer::new((window.cols, window.rows), flat);

        let mut band = self.dataset.rasterband(1)?;
        band.write((window.col_off as isize, window.row_off as isize), (window.cols, window.rows), &buffer)?;
        Ok(())
    }
}

/// Read a whole raster into memory
pub fn read_grid<P: AsRef<Path>>(path: P) -> TerrainResult<Grid> {
    let mut reader = GdalWindowReader::open(path)?;
    let (rows, cols) = reader.shape();
    let full = TileWindow { row_off: 0, col_off: 0, rows, cols, tile_row: 0, tile_col: 0 };
    let data = reader.read_window(&full)?;

    let nodata = reader.nodata().unwrap_or(crate::types::DEFAULT_NODATA);
    let mut grid = Grid::new(data, nodata, reader.geo_transform())?;
    grid.crs = reader.crs.take();
    Ok(grid)
}

/// Write a grid as a GeoTIFF, no-data as the grid's sentinel
pub fn write_grid<P: AsRef<Path>>(path: P, grid: &Grid) -> TerrainResult<PathBuf> {
    let (rows, cols) = grid.dim();
    let mut writer = GdalWindowWriter::create(path, grid.dim(), &grid.geo_transform, grid.nodata, grid.crs.as_deref())?;
    let full = TileWindow { row_off: 0, col_off: 0, rows, cols, tile_row: 0, tile_col: 0 };
    writer.write_window(&full, &grid.data)?;
    writer.finish()
}

/// Stream the LS factor of `input` into a new GeoTIFF at `output`.
///
/// The cell size comes from the input transform.
pub fn compute_ls_factor_file<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    params: &TiledLsParams,
) -> TerrainResult<TiledLsReport> {
    let mut reader = GdalWindowReader::open(input)?;
    let transform = reader.geo_transform();
    let crs = reader.crs().map(str::to_string);
    let mut writer = GdalWindowWriter::create(
        output,
        reader.shape(),
        &transform,
        params.output_nodata,
        crs.as_deref(),
    )?;

    let params = TiledLsParams { cell_size: transform.cell_size(), ..params.clone() };
    let report = TiledLsProcessor::new(params).process(&mut reader, &mut writer)?;
    writer.finish()?;
    Ok(report)
}
