//! bifrost-spectrometer: Reduction engine for the BIFROST indirect-geometry
//! spectrometer.
//!
//! This crate turns detector events into normalized events with energy and
//! momentum transfer:
//! - **graph** - Coordinate transformation planner and executor
//! - **primary** / **secondary** - Source-to-sample and sample-to-detector geometry
//! - **tof** - Time-of-flight lookup tables and frame unwrapping
//! - **normalization** - Monitor and proton-charge normalization
//! - **cutting** / **histogram** - Rotation grouping, cuts and Q maps
//! - **export** - SQW pixel rows
//! - **workflow** - The complete per-run pipeline, inelastic and elastic
//!

pub mod conversion;
pub mod cutting;
pub mod detector;
pub mod export;
pub mod graph;
pub mod histogram;
pub mod normalization;
pub mod primary;
pub mod secondary;
pub mod source;
pub mod tof;
pub mod workflow;

pub use conversion::{
    add_incident_energy, add_inelastic_coordinates, add_monitor_wavelength_coord,
    add_spectrometer_coords, add_total_path_length, convert_tof_to_q, elastic_momentum_transfer,
    energy_transfer, inelastic_coordinate_transformation_graph_at_sample,
    monitor_coordinate_transformation_graph, single_crystal_coordinate_transformation_graph,
};
pub use cutting::{
    cut, group_by_rotation, project_momentum_transfer, q_map, q_slice, split_by_setting, CutAxis,
    InstrumentAngle, QProjection, Setting,
};
pub use detector::{
    calibrated_detector, combine_detectors, label_triplet, merge_triplets, AnalyzerMap, DetectorLayout,
    TRIPLET_DIM,
};
pub use export::{sqw_pixel_buffer, SqwBinSizes, SqwPixelBuffer};
pub use graph::{CoordTransformGraph, Node, TransformOptions, TransformPlan};
pub use histogram::{hist_events, BinSpec};
pub use normalization::{
    monitor_distribution, normalize_by_monitor_and_proton_charge, UncertaintyBroadcastMode,
};
pub use primary::{primary_spectrometer_graph, Chopper, PrimarySpectrometer};
pub use secondary::{move_time_to_sample, secondary_spectrometer_graph, Analyzer};
pub use source::{Source, ESS_SOURCE};
pub use tof::{
    detector_time_of_flight_data, elastic_time_of_flight_data, monitor_time_of_flight_data,
    LookupTableBuilder,
    SimulationResults, TimeOfFlightLookupTable,
};
pub use workflow::{BifrostWorkflow, ReducedRun, RunInput, TripletInput};
