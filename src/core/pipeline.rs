//! End-to-end pipelines: source volume and LS factor
//!
//! All configuration travels in the parameter structs; errors leave a
//! pipeline wrapped in `StageFailed` naming the step that failed.

use crate::core::report::{ProcessingReport, StepStatus};
use crate::core::slbl::{RegionGeometry, SlblParams, SlblSolver};
use crate::core::tiled_ls::{TiledLsParams, TiledLsProcessor, TiledLsReport};
use crate::core::volume::{integrate_volume, GridAligner, ValidRange, VolumeEstimate, PIXEL_COUNT_EPSILON};
use crate::io::mask::PolygonMask;
use crate::io::resample::{BilinearResampler, ResampleMethod, Resampler};
use crate::types::{
    Deadline, GeoTransform, Grid, GridStats, Stage, StageContext, TerrainError, TerrainResult,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Parameters of the source-volume pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceVolumeParams {
    pub slbl: SlblParams,
    pub valid_range: ValidRange,
    /// Treat a solve that hit the iteration cap as an error
    pub require_convergence: bool,
}

/// Convergence summary of the relaxation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlblSummary {
    pub converged: bool,
    pub iterations: usize,
    pub max_change: f64,
    pub tolerance: f64,
    pub curvature: f64,
    pub geometry: RegionGeometry,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceVolumeResult {
    #[serde(skip)]
    pub surface: Grid,
    pub slbl: SlblSummary,
    pub volume: VolumeEstimate,
    pub dem_stats: Option<GridStats>,
    pub surface_stats: Option<GridStats>,
    pub report: ProcessingReport,
}

/// Estimate the material volume above the reconstructed failure surface.
///
/// Steps: optional clip to the source polygon, SLBL relaxation, alignment of
/// surface and DEM, integration of their difference.
pub fn estimate_source_volume(
    dem: &Grid,
    mask: Option<&dyn PolygonMask>,
    params: &SourceVolumeParams,
    deadline: Deadline,
) -> TerrainResult<SourceVolumeResult> {
    log::info!("Starting source-volume estimation on {:?} DEM", dem.dim());

    let mut report = ProcessingReport::new(format!("source-volume-{}", chrono::Utc::now().timestamp_millis()));
    report.set_parameters("source_volume", params)?;

    let step = Instant::now();
    let clipped = match mask {
        Some(mask) => {
            let clipped = mask.clip(dem).in_stage(Stage::Clip)?;
            report.record_step(
                "clip",
                step.elapsed().as_secs_f64(),
                StepStatus::Success,
                format!("{} valid cells inside the source polygon", clipped.valid_count()),
            );
            clipped
        }
        None => dem.clone(),
    };

    let step = Instant::now();
    let outcome = SlblSolver::new(params.slbl.clone())
        .with_deadline(deadline)
        .solve(&clipped)
        .in_stage(Stage::Relaxation)?;

    let slbl = SlblSummary {
        converged: outcome.converged,
        iterations: outcome.iterations,
        max_change: outcome.max_change,
        tolerance: outcome.tolerance,
        curvature: outcome.curvature,
        geometry: outcome.geometry,
    };

    let status = if outcome.converged {
        StepStatus::Success
    } else if params.require_convergence {
        StepStatus::Error
    } else {
        StepStatus::Warning
    };
    report.record_step(
        "relaxation",
        step.elapsed().as_secs_f64(),
        status,
        format!("{} iterations, max change {:.6}", outcome.iterations, outcome.max_change),
    );

    let surface = if params.require_convergence {
        outcome.into_converged().in_stage(Stage::Relaxation)?
    } else {
        if !outcome.converged {
            let warning = format!(
                "failure surface did not converge within {} iterations (max change {:.6}, tolerance {:.6})",
                outcome.iterations, outcome.max_change, outcome.tolerance
            );
            log::warn!("{}", warning);
            report.add_warning(warning);
        }
        outcome.surface
    };

    deadline.check(&Stage::Alignment.to_string()).in_stage(Stage::Alignment)?;
    let step = Instant::now();
    let resampler = BilinearResampler;
    let pair = GridAligner::new(&resampler)
        .align(&surface, &clipped)
        .in_stage(Stage::Alignment)?;
    report.record_step(
        "alignment",
        step.elapsed().as_secs_f64(),
        StepStatus::Success,
        format!("{}x{} common grid", pair.dim().0, pair.dim().1),
    );

    let step = Instant::now();
    let volume = integrate_volume(&pair, pair.pixel_area(), &params.valid_range).in_stage(Stage::Integration)?;
    report.record_step(
        "integration",
        step.elapsed().as_secs_f64(),
        StepStatus::Success,
        format!("{:.3} over {} cells", volume.volume, volume.valid_cells),
    );

    let dem_stats = clipped.stats();
    let surface_stats = surface.stats();
    report.add_statistics("dem", dem_stats);
    report.add_statistics("failure_surface", surface_stats);
    report.add_statistics("difference", Some(volume.difference));

    log::info!("Source volume: {:.3} ({} cells)", volume.volume, volume.valid_cells);
    log::debug!("{}", report.generate_summary());

    Ok(SourceVolumeResult {
        surface,
        slbl,
        volume,
        dem_stats,
        surface_stats,
        report,
    })
}

/// Parameters of the LS-factor pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LsPipelineParams {
    pub tiling: TiledLsParams,
    /// Resample the DEM to this cell size before tiling
    pub target_resolution: Option<f64>,
    /// Kernel used when `target_resolution` applies
    #[serde(default)]
    pub resample_method: ResampleMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct LsFactorResult {
    #[serde(skip)]
    pub ls: Grid,
    pub tiles: TiledLsReport,
    pub ls_stats: Option<GridStats>,
    pub report: ProcessingReport,
}

/// Lattice covering `dem`'s footprint at `resolution`
fn resampled_lattice(dem: &Grid, resolution: f64) -> TerrainResult<(GeoTransform, (usize, usize))> {
    if !(resolution > 0.0) || !resolution.is_finite() {
        return Err(TerrainError::InvalidInput(format!(
            "target resolution must be positive, got {}",
            resolution
        )));
    }
    let bounds = dem.bounds();
    let cols = (bounds.width() / resolution + PIXEL_COUNT_EPSILON).floor() as usize;
    let rows = (bounds.height() / resolution + PIXEL_COUNT_EPSILON).floor() as usize;
    if rows == 0 || cols == 0 {
        return Err(TerrainError::InvalidInput(format!(
            "resolution {} leaves no whole cell in a {:.3} x {:.3} extent",
            resolution,
            bounds.width(),
            bounds.height()
        )));
    }
    let target = GeoTransform {
        top_left_x: bounds.min_x,
        pixel_width: resolution,
        top_left_y: bounds.max_y,
        pixel_height: -resolution,
    };
    Ok((target, (rows, cols)))
}

/// LS factor of a DEM, optionally resampled to a target resolution first
pub fn compute_ls_factor(dem: &Grid, params: &LsPipelineParams, deadline: Deadline) -> TerrainResult<LsFactorResult> {
    log::info!("Starting LS-factor computation on {:?} DEM", dem.dim());

    let mut report = ProcessingReport::new(format!("ls-factor-{}", chrono::Utc::now().timestamp_millis()));
    report.set_parameters("ls_factor", params)?;

    let resampled;
    let input = match params.target_resolution {
        Some(resolution) if (resolution - dem.cell_size()).abs() > f64::EPSILON => {
            let step = Instant::now();
            let method = params.resample_method;
            log::info!("Resampling DEM from {} to {} m cells ({})", dem.cell_size(), resolution, method);
            let (target, shape) = resampled_lattice(dem, resolution).in_stage(Stage::Resample)?;
            resampled = method.resampler().resample(dem, &target, shape).in_stage(Stage::Resample)?;
            report.record_step(
                "resample",
                step.elapsed().as_secs_f64(),
                StepStatus::Success,
                format!("{}x{} at {} m, {}", shape.0, shape.1, resolution, method),
            );
            &resampled
        }
        _ => dem,
    };

    let step = Instant::now();
    let (ls, tiles) = TiledLsProcessor::new(params.tiling.clone())
        .with_deadline(deadline)
        .compute_ls(input)
        .in_stage(Stage::TiledLs)?;

    let status = if tiles.has_failures() { StepStatus::Warning } else { StepStatus::Success };
    report.record_step(
        "tiled_ls",
        step.elapsed().as_secs_f64(),
        status,
        format!("{} windows, {} failed", tiles.total_tiles, tiles.failures.len()),
    );
    report.add_tile_failures(&tiles.failures);
    if tiles.has_failures() {
        report.add_warning(format!("{} windows were written as no-data", tiles.failures.len()));
    }

    let ls_stats = ls.stats();
    report.add_statistics("dem", input.stats());
    report.add_statistics("ls", ls_stats);

    if let Some(s) = ls_stats {
        log::info!("LS statistics: min {:.4}, max {:.4}, mean {:.4}", s.min, s.max, s.mean);
    }
    log::debug!("{}", report.generate_summary());

    Ok(LsFactorResult { ls, tiles, ls_stats, report })
}
