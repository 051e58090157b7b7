//! Time-of-flight lookup tables and unwrapping.
//!
//! Detectors record `event_time_offset`, the time since the most recent
//! pulse. Which pulse a neutron came from is ambiguous; a lookup table built
//! from a simulation of the source and choppers maps (path length, time within
//! the frame) to the time of flight since the pulse that emitted it.
//!
//! Table times are stored in seconds, distances in meters.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use crate::graph::{CoordTransformGraph, TransformOptions};
use crate::source::Source;
use bifrost_core::{in_same_unit, zip_with, DataArray, Error, Result, Unit, Variable, EVENT_DIM};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayD, Axis, Zip};
use rayon::prelude::*;

/// Default distance step of a table, in m.
pub const DEFAULT_DISTANCE_RESOLUTION: f64 = 0.1;
/// Default time step of a table, in s.
pub const DEFAULT_TIME_RESOLUTION: f64 = 250e-6;
/// Default largest accepted relative spread of tof within a table cell.
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.1;

/// Time of flight as a function of distance and time within the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeOfFlightLookupTable {
    /// Distance grid in m, ascending with step `distance_resolution`.
    pub distance: Vec<f64>,
    /// Time grid (cell centres) in s, ascending with step `time_resolution`.
    pub time: Vec<f64>,
    /// Time of flight in s, shaped `(distance, time)`; NaN marks masked cells.
    pub tof: Array2<f64>,
    /// Source pulse period in s.
    pub pulse_period: f64,
    /// Number of pulses per frame.
    pub pulse_stride: usize,
    pub distance_resolution: f64,
    pub time_resolution: f64,
}

/// Index and fractional offset of `x` on a uniform grid, clamped to the grid
/// when `clamp` is set.
fn locate(grid: &[f64], step: f64, x: f64, clamp: bool) -> Option<(usize, f64)> {
    let (first, last) = (*grid.first()?, *grid.last()?);
    if !x.is_finite() {
        return None;
    }
    if grid.len() == 1 {
        return ((x - first).abs() <= 0.5 * step || clamp).then_some((0, 0.0));
    }
    let tolerance = 1e-9 * step;
    let x = if clamp {
        x.clamp(first, last)
    } else if x < first - tolerance || x > last + tolerance {
        return None;
    } else {
        x.clamp(first, last)
    };
    let position = (x - first) / step;
    let index = (position.floor() as usize).min(grid.len() - 2);
    Some((index, position - index as f64))
}

impl TimeOfFlightLookupTable {
    /// Length of one frame in s.
    #[must_use]
    pub fn frame_period(&self) -> f64 {
        self.pulse_period * self.pulse_stride as f64
    }

    /// Range of distances covered by the table, in m.
    #[must_use]
    pub fn distance_range(&self) -> (f64, f64) {
        (
            self.distance.first().copied().unwrap_or(f64::NAN),
            self.distance.last().copied().unwrap_or(f64::NAN),
        )
    }

    /// Time of flight in s by bilinear interpolation.
    ///
    /// NaN outside the distance range, outside `[0, frame_period]` in time,
    /// or next to a masked cell.
    #[must_use]
    pub fn evaluate(&self, distance: f64, time: f64) -> f64 {
        if !(0.0..=self.frame_period()).contains(&time) {
            return f64::NAN;
        }
        let Some((i, fd)) = locate(&self.distance, self.distance_resolution, distance, false) else {
            return f64::NAN;
        };
        let Some((j, ft)) = locate(&self.time, self.time_resolution, time, true) else {
            return f64::NAN;
        };
        let i1 = (i + 1).min(self.distance.len() - 1);
        let j1 = (j + 1).min(self.time.len() - 1);
        let at = |a: usize, b: usize, w: f64| if w == 0.0 { 0.0 } else { w * self.tof[[a, b]] };
        at(i, j, (1.0 - fd) * (1.0 - ft))
            + at(i, j1, (1.0 - fd) * ft)
            + at(i1, j, fd * (1.0 - ft))
            + at(i1, j1, fd * ft)
    }

    /// Fraction of masked cells.
    #[must_use]
    pub fn masked_fraction(&self) -> f64 {
        let masked = self.tof.iter().filter(|t| t.is_nan()).count();
        masked as f64 / self.tof.len().max(1) as f64
    }
}

/// Neutrons of a source simulation, all recorded at `distance`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationResults {
    /// Time each neutron passes `distance`, in s after the pulse.
    pub time: Vec<f64>,
    /// Speed in m/s.
    pub speed: Vec<f64>,
    pub weight: Vec<f64>,
    /// Position along the beam at which times are recorded, in m.
    pub distance: f64,
}

/// `i`-th element of the van der Corput sequence in `base`.
fn van_der_corput(mut i: u64, base: u64) -> f64 {
    let mut value = 0.0;
    let mut denominator = 1.0;
    while i > 0 {
        denominator *= base as f64;
        value += (i % base) as f64 / denominator;
        i /= base;
    }
    value
}

impl SimulationResults {
    /// Neutrons emitted uniformly over the pulse, with wavelengths spread
    /// uniformly over the source's speed range.
    ///
    /// Points follow a Halton sequence, so results are reproducible.
    #[must_use]
    pub fn from_source(source: &Source, neutrons: usize) -> Self {
        let (v_min, v_max) = source.velocities;
        let (slow, fast) = (1.0 / v_min, 1.0 / v_max);
        let mut time = Vec::with_capacity(neutrons);
        let mut speed = Vec::with_capacity(neutrons);
        for i in 1..=neutrons as u64 {
            time.push(source.delay + source.pulse_duration * van_der_corput(i, 2));
            speed.push(1.0 / (fast + (slow - fast) * van_der_corput(i, 3)));
        }
        Self {
            time,
            speed,
            weight: vec![1.0; neutrons],
            distance: 0.0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.time.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Builds a [`TimeOfFlightLookupTable`] from simulated neutrons.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct LookupTableBuilder {
    ltotal_range: (f64, f64),
    distance_resolution: f64,
    time_resolution: f64,
    pulse_period: f64,
    pulse_stride: usize,
    error_threshold: f64,
}

impl LookupTableBuilder {
    /// Builder for distances `ltotal_range` (m) and the pulses of `source`.
    pub fn new(source: &Source, ltotal_range: (f64, f64)) -> Self {
        Self {
            ltotal_range,
            distance_resolution: DEFAULT_DISTANCE_RESOLUTION,
            time_resolution: DEFAULT_TIME_RESOLUTION,
            pulse_period: source.period_seconds(),
            pulse_stride: 1,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
        }
    }

    pub fn with_distance_resolution(mut self, resolution: f64) -> Self {
        self.distance_resolution = resolution;
        self
    }

    pub fn with_time_resolution(mut self, resolution: f64) -> Self {
        self.time_resolution = resolution;
        self
    }

    pub fn with_pulse_stride(mut self, stride: usize) -> Self {
        self.pulse_stride = stride;
        self
    }

    pub fn with_error_threshold(mut self, threshold: f64) -> Self {
        self.error_threshold = threshold;
        self
    }

    fn validate(&self) -> Result<()> {
        let (lo, hi) = self.ltotal_range;
        if !(lo.is_finite() && hi.is_finite() && lo <= hi) {
            return Err(Error::InvalidConfig(format!("invalid distance range {lo}..{hi}")));
        }
        if self.distance_resolution <= 0.0 || self.time_resolution <= 0.0 {
            return Err(Error::InvalidConfig(
                "table resolutions must be positive".to_string(),
            ));
        }
        if self.pulse_stride == 0 || self.pulse_period <= 0.0 {
            return Err(Error::InvalidConfig(
                "pulse period and stride must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Tabulate the mean time of flight per cell.
    ///
    /// Cells without neutrons or with a relative tof spread above the error
    /// threshold are masked with NaN.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for invalid settings or
    /// [`Error::EmptyRange`] for an empty simulation.
    pub fn build(&self, simulation: &SimulationResults) -> Result<TimeOfFlightLookupTable> {
        self.validate()?;
        if simulation.is_empty() {
            return Err(Error::EmptyRange {
                dim: "neutron".to_string(),
            });
        }
        let (lo, hi) = self.ltotal_range;
        let n_distance = ((hi - lo) / self.distance_resolution).ceil() as usize + 1;
        let distance: Vec<f64> = (0..n_distance)
            .map(|i| lo + i as f64 * self.distance_resolution)
            .collect();
        let frame = self.pulse_period * self.pulse_stride as f64;
        let n_time = (frame / self.time_resolution).ceil().max(1.0) as usize;
        let time_resolution = frame / n_time as f64;
        let time: Vec<f64> = (0..n_time)
            .map(|j| (j as f64 + 0.5) * time_resolution)
            .collect();

        let rows: Vec<Vec<f64>> = distance
            .par_iter()
            .map(|&d| {
                let mut sum_w = vec![0.0; n_time];
                let mut sum_t = vec![0.0; n_time];
                let mut sum_t2 = vec![0.0; n_time];
                for ((&t, &v), &w) in simulation
                    .time
                    .iter()
                    .zip(&simulation.speed)
                    .zip(&simulation.weight)
                {
                    let tof = t + (d - simulation.distance) / v;
                    let bin = ((tof.rem_euclid(frame) / time_resolution) as usize).min(n_time - 1);
                    sum_w[bin] += w;
                    sum_t[bin] += w * tof;
                    sum_t2[bin] += w * tof * tof;
                }
                (0..n_time)
                    .map(|j| {
                        if sum_w[j] <= 0.0 {
                            return f64::NAN;
                        }
                        let mean = sum_t[j] / sum_w[j];
                        let variance = (sum_t2[j] / sum_w[j] - mean * mean).max(0.0);
                        if variance.sqrt() / mean > self.error_threshold {
                            f64::NAN
                        } else {
                            mean
                        }
                    })
                    .collect()
            })
            .collect();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let tof = Array2::from_shape_vec((n_distance, n_time), flat)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        let table = TimeOfFlightLookupTable {
            distance,
            time,
            tof,
            pulse_period: self.pulse_period,
            pulse_stride: self.pulse_stride,
            distance_resolution: self.distance_resolution,
            time_resolution,
        };
        info!(
            "Built {}x{} time-of-flight table from {} neutrons ({:.1}% masked)",
            n_distance,
            n_time,
            simulation.len(),
            100.0 * table.masked_fraction()
        );
        Ok(table)
    }
}

/// Pulse index of each event relative to the first pulse in the data.
fn pulse_indices(event_time_zero: &Variable, pulse_period: f64) -> Result<Vec<i64>> {
    let etz = event_time_zero.to_unit(&Unit::NANOSECOND)?;
    let etz = etz.ints()?;
    let first = etz.iter().copied().min().unwrap_or(0);
    let period_ns = pulse_period * 1e9;
    Ok(etz
        .iter()
        .map(|&t| ((t - first) as f64 / period_ns).round() as i64)
        .collect())
}

fn unwrap_times(
    table: &TimeOfFlightLookupTable,
    ltotal: &[f64],
    eto: &[f64],
    pulses: Option<&[i64]>,
    offset: i64,
) -> Vec<f64> {
    let stride = table.pulse_stride as i64;
    ltotal
        .iter()
        .zip(eto)
        .enumerate()
        .map(|(i, (&l, &t))| {
            let frame_index = pulses.map_or(0, |p| (p[i] - offset).rem_euclid(stride));
            table.evaluate(l, t + frame_index as f64 * table.pulse_period)
        })
        .collect()
}

/// Replace `event_time_offset` by the time of flight at the sample.
///
/// The path length is the per-pixel `L1` coordinate; `event_time_offset`
/// must already be the time at the sample. With a pulse stride above 1 the
/// pulse within the frame comes from `event_time_zero` and
/// `pulse_stride_offset`, or is guessed by minimizing unmatched events.
///
/// The result has an event coordinate `sample_tof` in ns and no longer
/// carries `event_time_zero` or `event_time_offset`.
///
/// # Errors
/// Returns an error if the data is not binned or lacks required coordinates.
pub fn detector_time_of_flight_data(
    data: &DataArray,
    table: &TimeOfFlightLookupTable,
    pulse_stride_offset: Option<usize>,
) -> Result<DataArray> {
    time_of_flight_along(data, table, pulse_stride_offset, "L1", "sample_tof")
}

/// Replace `event_time_offset` by the time of flight over `Ltotal`.
///
/// For elastic scattering the neutron keeps its speed after the sample, so
/// the table is evaluated at the full straight-line path length and the
/// detector time. Adds the event coordinate `tof` in ns; pulse-stride
/// handling is as in [`detector_time_of_flight_data`].
///
/// # Errors
/// Returns an error if the data is not binned or lacks `Ltotal` or event
/// times.
pub fn elastic_time_of_flight_data(
    data: &DataArray,
    table: &TimeOfFlightLookupTable,
    pulse_stride_offset: Option<usize>,
) -> Result<DataArray> {
    time_of_flight_along(data, table, pulse_stride_offset, "Ltotal", "tof")
}

fn time_of_flight_along(
    data: &DataArray,
    table: &TimeOfFlightLookupTable,
    pulse_stride_offset: Option<usize>,
    distance: &str,
    output: &str,
) -> Result<DataArray> {
    let events = data.require_events()?;
    let eto = events
        .coord("event_time_offset")?
        .to_float()?
        .to_unit(&Unit::SECOND)?
        .to_vec::<f64>()?;
    let ltotal = data.event_coord(distance)?.to_unit(&Unit::METER)?.to_vec::<f64>()?;
    let pulses = if table.pulse_stride > 1 {
        Some(pulse_indices(events.coord("event_time_zero")?, table.pulse_period)?)
    } else {
        None
    };
    let tof = match (pulses.as_deref(), pulse_stride_offset) {
        (None, _) => unwrap_times(table, &ltotal, &eto, None, 0),
        (Some(p), Some(offset)) => unwrap_times(table, &ltotal, &eto, Some(p), offset as i64),
        (Some(p), None) => {
            let (offset, tof) = (0..table.pulse_stride as i64)
                .map(|offset| (offset, unwrap_times(table, &ltotal, &eto, Some(p), offset)))
                .min_by_key(|(_, tof)| tof.iter().filter(|t| t.is_nan()).count())
                .ok_or_else(|| Error::InvalidConfig("pulse stride must be positive".to_string()))?;
            debug!("Guessed pulse stride offset {offset}");
            tof
        }
    };
    let unmatched = tof.iter().filter(|t| t.is_nan()).count();
    if unmatched > 0 {
        warn!(
            "{unmatched} of {} events fall outside the time-of-flight table",
            tof.len()
        );
    }
    let tof = Variable::floats_1d(EVENT_DIM, tof, Unit::SECOND).to_unit(&Unit::NANOSECOND)?;

    let mut out = data.clone();
    let events = out
        .events_mut()
        .ok_or_else(|| Error::Unsupported("time of flight requires events".to_string()))?;
    events.coords.remove("event_time_offset");
    events.coords.remove("event_time_zero");
    events.insert_coord(output, tof)?;
    info!("Computed time of flight for {} events", out.event_count());
    Ok(out)
}

/// Path length from the source to a monitor.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn compute_monitor_ltotal(monitor: &DataArray, graph: &CoordTransformGraph) -> Result<Variable> {
    let out = graph.transform(
        monitor,
        &["Ltotal"],
        TransformOptions::default()
            .keep_intermediate(false)
            .keep_aliases(false),
    )?;
    Ok(out.coord("Ltotal")?.clone())
}

/// Redistribute one histogram lane with edges `from` onto edges `to`,
/// assuming constant density within each source bin.
fn resample_lane(from: &[f64], values: &[f64], to: &[f64]) -> (Vec<f64>, f64) {
    let mut out = vec![0.0; to.len().saturating_sub(1)];
    let mut dropped = 0.0;
    for (i, &value) in values.iter().enumerate() {
        let (lo, hi) = (from[i], from[i + 1]);
        if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
            dropped += value;
            continue;
        }
        for (k, target) in out.iter_mut().enumerate() {
            let overlap = hi.min(to[k + 1]) - lo.max(to[k]);
            if overlap > 0.0 {
                *target += value * overlap / (hi - lo);
            }
        }
    }
    (out, dropped)
}

/// Convert a monitor histogram over frame time `t` to time of flight.
///
/// Bin edges are mapped through the table at the monitor's path length and
/// the counts resampled onto a uniform, monotonic `tof` grid with the same
/// number of bins. Bins whose edges cannot be mapped are dropped (logged).
///
/// # Errors
/// Returns an error for binned monitors or a missing `t` edge coordinate.
pub fn monitor_time_of_flight_data(
    monitor: &DataArray,
    table: &TimeOfFlightLookupTable,
    ltotal: &Variable,
) -> Result<DataArray> {
    let mut monitor = monitor.clone().rename_dim("t", "tof");
    if let Some(coord) = monitor.remove_coord("t") {
        monitor.insert_coord_entry("tof", coord)?;
    }
    let edges = monitor.coord("tof")?.clone();
    if edges.ndim() != 1 || !monitor.coord_entry("tof").is_some_and(bifrost_core::Coord::is_edges) {
        return Err(Error::Unsupported(
            "monitor time of flight requires 1-d bin edges".to_string(),
        ));
    }
    let length = ltotal.to_unit(&Unit::METER)?.value::<f64>()?;
    let mapped: Vec<f64> = edges
        .to_float()?
        .to_unit(&Unit::SECOND)?
        .to_vec::<f64>()?
        .iter()
        .map(|&t| table.evaluate(length, t))
        .collect();
    let lo = mapped.iter().copied().filter(|t| t.is_finite()).reduce(f64::min);
    let hi = mapped.iter().copied().filter(|t| t.is_finite()).reduce(f64::max);
    let (Some(lo), Some(hi)) = (lo, hi) else {
        return Err(Error::EmptyRange {
            dim: "tof".to_string(),
        });
    };
    let n_edges = mapped.len();
    let target: Vec<f64> = Variable::linspace("tof", lo, hi, n_edges, Unit::SECOND).to_vec::<f64>()?;

    let axis = monitor
        .dims()
        .iter()
        .position(|d| d == "tof")
        .ok_or_else(|| Error::MissingCoordinate("dimension 'tof'".to_string()))?;
    let (values, variances) = monitor.dense_values()?;
    let mut dropped = 0.0;
    let mut resample = |array: &ArrayD<f64>, count: bool| -> ArrayD<f64> {
        let mut out = ArrayD::zeros(array.raw_dim());
        Zip::from(out.lanes_mut(Axis(axis)))
            .and(array.lanes(Axis(axis)))
            .for_each(|mut target_lane, lane| {
                let lane: Vec<f64> = lane.iter().copied().collect();
                let (resampled, lost) = resample_lane(&mapped, &lane, &target);
                if count {
                    dropped += lost;
                }
                for (t, r) in target_lane.iter_mut().zip(resampled) {
                    *t = r;
                }
            });
        out
    };
    let new_values = resample(values, true);
    let new_variances = variances.map(|v| resample(v, false));
    if dropped > 0.0 {
        warn!("Dropped {dropped} monitor counts outside the time-of-flight table");
    }
    let unit = monitor.unit();
    monitor = monitor.with_content(
        bifrost_core::Content::Dense {
            values: new_values,
            variances: new_variances,
        },
        unit,
    )?;
    let tof_edges = Variable::floats_1d("tof", target, Unit::SECOND).to_unit(&edges.unit())?;
    debug!("Monitor time of flight spans {lo:.6}..{hi:.6} s");
    monitor.insert_edges("tof", "tof", tof_edges)?;
    Ok(monitor)
}

/// Fold simulated arrival times into the pulse period.
///
/// McStas records the full time since the pulse; real data only has the
/// time since the most recent pulse. Already wrapped data is unchanged.
///
/// # Errors
/// Returns an error if the data is not binned or lacks `event_time_offset`.
pub fn convert_simulated_time_to_event_time_offset(
    data: &DataArray,
    pulse_period: &Variable,
) -> Result<DataArray> {
    let mut out = data.clone();
    let events = out
        .events_mut()
        .ok_or_else(|| Error::Unsupported("simulated times require events".to_string()))?;
    let eto = events.coord("event_time_offset")?.to_float()?;
    let period = in_same_unit(pulse_period, &eto)?;
    let wrapped = zip_with(&eto, &period, eto.unit(), |t: &f64, p: &f64| t.rem_euclid(*p))?;
    events.insert_coord("event_time_offset", wrapped)?;
    Ok(out)
}
