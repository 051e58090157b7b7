//! Reduction of one BIFROST run.
//!
//! The stages are:
//!
//! 1. calibrate every detector triplet with its analyzer (in parallel),
//! 2. merge the triplets into one detector,
//! 3. group events by sample and detector-vessel rotation,
//! 4. shift event times from the detector to the sample,
//! 5. compute the time of flight from the lookup table,
//! 6. attach incident energy,
//! 7. normalize by the monitor and the proton charge,
//! 8. attach energy and momentum transfer.

use crate::conversion::{
    add_incident_energy, add_inelastic_coordinates, add_monitor_wavelength_coord,
    add_total_path_length, convert_tof_to_q, inelastic_coordinate_transformation_graph_at_sample,
    monitor_coordinate_transformation_graph, single_crystal_coordinate_transformation_graph,
};
use crate::cutting::{group_by_rotation, project_momentum_transfer, InstrumentAngle, QProjection};
use crate::detector::{calibrated_detector, label_triplet, merge_triplets, DetectorLayout};
use crate::export::{sqw_pixel_buffer, SqwBinSizes, SqwPixelBuffer};
use crate::graph::{CoordTransformGraph, Node};
use crate::histogram::BinSpec;
use crate::normalization::{normalize_by_monitor_and_proton_charge, UncertaintyBroadcastMode};
use crate::primary::primary_spectrometer_graph;
use crate::secondary::{move_time_to_sample, secondary_spectrometer_graph, Analyzer};
use crate::source::Source;
use crate::tof::{
    compute_monitor_ltotal, convert_simulated_time_to_event_time_offset,
    detector_time_of_flight_data, elastic_time_of_flight_data, monitor_time_of_flight_data,
    TimeOfFlightLookupTable,
};
use bifrost_core::{DataArray, Result, Unit, Variable};
use log::{info, warn};
use nalgebra::Vector3;
use rayon::prelude::*;

/// Events of one detector triplet and the analyzer in front of it.
#[derive(Debug, Clone)]
pub struct TripletInput {
    pub name: String,
    /// Binned events over the file dims `dim_0`, `dim_1` with
    /// `detector_number` and `position` coordinates.
    pub events: DataArray,
    pub analyzer: Analyzer,
}

/// Everything loaded from one run.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub triplets: Vec<TripletInput>,
    /// Normalization monitor histogram over frame time `t`, with `position`.
    pub monitor: DataArray,
    /// Source position in m.
    pub source_position: Vector3<f64>,
    /// Sample position in m.
    pub sample_position: Vector3<f64>,
    pub a3: InstrumentAngle,
    pub a4: InstrumentAngle,
    pub proton_charge: Variable,
}

/// Output of [`BifrostWorkflow::reduce`].
#[derive(Debug, Clone)]
pub struct ReducedRun {
    /// Normalized events with `incident_energy`, `final_energy`,
    /// `final_wavevector`, `incident_beam`, `a3` and `a4`.
    pub normalized: DataArray,
    /// Normalized events with `energy_transfer` and
    /// `sample_table_momentum_transfer`.
    pub events: DataArray,
    /// Monitor with `incident_wavelength` edges.
    pub monitor: DataArray,
}

/// Reduction settings shared by all runs.
#[derive(Debug, Clone)]
pub struct BifrostWorkflow {
    source: Source,
    gravity: Vector3<f64>,
    layout: DetectorLayout,
    lookup_table: TimeOfFlightLookupTable,
    pulse_stride_offset: Option<usize>,
    simulated: bool,
    uncertainty_mode: UncertaintyBroadcastMode,
}

impl BifrostWorkflow {
    /// Workflow for the ESS source with standard gravity.
    #[must_use]
    pub fn new(lookup_table: TimeOfFlightLookupTable) -> Self {
        Self {
            source: Source::default(),
            gravity: Vector3::new(0.0, -9.81, 0.0),
            layout: DetectorLayout::default(),
            lookup_table,
            pulse_stride_offset: None,
            simulated: false,
            uncertainty_mode: UncertaintyBroadcastMode::default(),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Set the gravity vector in m/s².
    #[must_use]
    pub fn with_gravity(mut self, gravity: Vector3<f64>) -> Self {
        self.gravity = gravity;
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: DetectorLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Fix the pulse within a frame instead of guessing it.
    #[must_use]
    pub fn with_pulse_stride_offset(mut self, offset: Option<usize>) -> Self {
        self.pulse_stride_offset = offset;
        self
    }

    /// Treat event times as full simulated arrival times.
    #[must_use]
    pub fn with_simulated_input(mut self, simulated: bool) -> Self {
        self.simulated = simulated;
        self
    }

    #[must_use]
    pub fn with_uncertainty_mode(mut self, mode: UncertaintyBroadcastMode) -> Self {
        self.uncertainty_mode = mode;
        self
    }

    #[must_use]
    pub fn source(&self) -> &Source {
        &self.source
    }

    #[must_use]
    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    #[must_use]
    pub fn lookup_table(&self) -> &TimeOfFlightLookupTable {
        &self.lookup_table
    }

    /// Primary beamline graph with the run's source and sample positions.
    #[must_use]
    pub fn beamline_graph(&self, run: &RunInput) -> CoordTransformGraph {
        primary_spectrometer_graph()
            .with(
                "source_position",
                Node::Constant(Variable::vector(run.source_position, Unit::METER)),
            )
            .with(
                "sample_position",
                Node::Constant(Variable::vector(run.sample_position, Unit::METER)),
            )
    }

    /// Calibrate all triplets, in parallel.
    ///
    /// # Errors
    /// Returns the first error of any triplet.
    pub fn calibrate_triplets(&self, run: &RunInput) -> Result<Vec<DataArray>> {
        let primary = self.beamline_graph(run);
        let period = self.source.period();
        run.triplets
            .par_iter()
            .map(|triplet| {
                let secondary = secondary_spectrometer_graph(&triplet.analyzer);
                let mut events = triplet.events.clone();
                if self.simulated {
                    events = convert_simulated_time_to_event_time_offset(&events, &period)?;
                }
                let calibrated = calibrated_detector(events, &self.layout, &primary, &secondary)?;
                let non_finite = calibrated.coord("final_energy")?.count_non_finite();
                if non_finite > 0 {
                    warn!("{}: {non_finite} pixels have non-finite final energy", triplet.name);
                }
                Ok(calibrated)
            })
            .collect()
    }

    /// Detector events with time of flight and incident energy.
    ///
    /// # Errors
    /// Returns errors of the individual stages.
    pub fn detector_events(&self, run: &RunInput) -> Result<DataArray> {
        let triplets = self.calibrate_triplets(run)?;
        info!("Calibrated {} triplets", triplets.len());
        let merged = merge_triplets(&triplets)?;
        let grouped = group_by_rotation(&merged, &run.a3, &run.a4)?;
        let at_sample = move_time_to_sample(&grouped, &self.source.period())?;
        let tof = detector_time_of_flight_data(&at_sample, &self.lookup_table, self.pulse_stride_offset)?;
        let graph = inelastic_coordinate_transformation_graph_at_sample(self.gravity);
        let events = add_incident_energy(&tof, &graph)?;
        info!(
            "Prepared {} detector events over {:?}",
            events.event_count(),
            events.dims()
        );
        Ok(events)
    }

    /// Monitor histogram over incident wavelength.
    ///
    /// # Errors
    /// Returns errors of the individual stages.
    pub fn normalization_monitor(&self, run: &RunInput) -> Result<DataArray> {
        let graph =
            monitor_coordinate_transformation_graph(&Variable::vector(run.source_position, Unit::METER));
        let ltotal = compute_monitor_ltotal(&run.monitor, &graph)?;
        let monitor = monitor_time_of_flight_data(&run.monitor, &self.lookup_table, &ltotal)?;
        add_monitor_wavelength_coord(&monitor, &graph)
    }

    /// Run all stages.
    ///
    /// # Errors
    /// Returns errors of the individual stages.
    pub fn reduce(&self, run: &RunInput) -> Result<ReducedRun> {
        let (events, monitor) = rayon::join(
            || self.detector_events(run),
            || self.normalization_monitor(run),
        );
        let (events, monitor) = (events?, monitor?);
        let normalized = normalize_by_monitor_and_proton_charge(
            &events,
            &monitor,
            &run.proton_charge,
            self.uncertainty_mode,
        )?;
        let graph = inelastic_coordinate_transformation_graph_at_sample(self.gravity);
        let inelastic = add_inelastic_coordinates(&normalized, &graph)?;
        let non_finite = inelastic.event_coord("energy_transfer")?.count_non_finite();
        if non_finite > 0 {
            warn!("{non_finite} events have a non-finite energy transfer");
        }
        info!(
            "Reduced {} events with total weight {:.6e}",
            inelastic.event_count(),
            inelastic.total()
        );
        Ok(ReducedRun {
            normalized,
            events: inelastic,
            monitor,
        })
    }

    /// Elastic events of the Bragg peak monitor with sample-table Q.
    ///
    /// Triplets are merged and grouped by rotation without analyzer
    /// geometry. Times of flight use the straight path source → sample →
    /// pixel and the detector arrival time. No normalization is applied.
    ///
    /// # Errors
    /// Returns errors of the individual stages.
    pub fn elastic_events(&self, run: &RunInput) -> Result<DataArray> {
        let period = self.source.period();
        let labeled = run
            .triplets
            .par_iter()
            .map(|triplet| {
                let events = if self.simulated {
                    convert_simulated_time_to_event_time_offset(&triplet.events, &period)?
                } else {
                    triplet.events.clone()
                };
                label_triplet(events, &self.layout)
            })
            .collect::<Result<Vec<_>>>()?;
        let merged = merge_triplets(&labeled)?;
        let grouped = group_by_rotation(&merged, &run.a3, &run.a4)?;
        let graph = self
            .beamline_graph(run)
            .merge(&single_crystal_coordinate_transformation_graph(self.gravity));
        let with_ltotal = add_total_path_length(&grouped, &graph)?;
        let tof = elastic_time_of_flight_data(&with_ltotal, &self.lookup_table, self.pulse_stride_offset)?;
        let events = convert_tof_to_q(&tof, &graph)?;
        let non_finite = events
            .event_coord("sample_table_momentum_transfer")?
            .norm()?
            .count_non_finite();
        if non_finite > 0 {
            warn!("{non_finite} elastic events have a non-finite momentum transfer");
        }
        info!("Converted {} elastic events to Q", events.event_count());
        Ok(events)
    }

    /// Elastic events projected for a Q map, see [`project_momentum_transfer`].
    ///
    /// # Errors
    /// Returns errors of [`Self::elastic_events`] and the projection.
    pub fn elastic_q_map_events(&self, run: &RunInput, projection: &QProjection) -> Result<DataArray> {
        project_momentum_transfer(&self.elastic_events(run)?, projection)
    }

    /// SQW pixel rows of a reduced run.
    ///
    /// # Errors
    /// See [`sqw_pixel_buffer`].
    pub fn sqw_pixels(
        &self,
        reduced: &ReducedRun,
        energy_bins: &BinSpec,
        bin_sizes: SqwBinSizes,
    ) -> Result<SqwPixelBuffer> {
        sqw_pixel_buffer(&reduced.normalized, energy_bins, bin_sizes, self.gravity)
    }
}
