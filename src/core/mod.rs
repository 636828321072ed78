//! Core terrain processing modules

pub mod flow_routing;
pub mod ls_factor;
pub mod pipeline;
pub mod report;
pub mod slbl;
pub mod tiled_ls;
pub mod volume;

// Re-export main types
pub use flow_routing::{accumulate, direction, AccumulationGrid, FlowDirectionGrid, NO_FLOW};
pub use ls_factor::compute_ls_tile;
pub use pipeline::{
    compute_ls_factor, estimate_source_volume, LsFactorResult, LsPipelineParams, SlblSummary,
    SourceVolumeParams, SourceVolumeResult,
};
pub use report::{ProcessingReport, ProcessingStep, StepStatus};
pub use slbl::{RegionGeometry, SlblOutcome, SlblParams, SlblSolver};
pub use tiled_ls::{windows, TileFailure, TiledLsParams, TiledLsProcessor, TiledLsReport};
pub use volume::{integrate_volume, validity_mask, AlignedGridPair, GridAligner, ValidRange, VolumeEstimate};
