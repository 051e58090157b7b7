//! Grouping by instrument setting, cuts and Q maps.

#![allow(clippy::cast_possible_truncation)]

use crate::graph::{CoordTransformGraph, Node, TransformOptions};
use crate::histogram::{hist_events, BinSpec};
use bifrost_core::{
    Content, DType, DataArray, Error, Result, Unit, Variable, EVENT_DIM,
};
use log::{debug, info, warn};
use nalgebra::Vector3;

/// Dimension along which instrument settings are enumerated.
pub const SETTING_DIM: &str = "time";
/// Output dimension of [`q_slice`].
pub const SAMPLE_ROTATION_DIM: &str = "sample_rotation";

/// A sample or instrument angle, fixed or logged over time.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentAngle {
    /// The same angle for the whole run.
    Fixed(Variable),
    /// Angle values logged at `time` (epoch, dimension `time`).
    Logged { time: Variable, value: Variable },
}

fn epoch_ns(var: &Variable) -> Result<Vec<i64>> {
    let ns = var.to_unit(&Unit::NANOSECOND)?;
    if ns.dtype() == DType::Int {
        return ns.to_vec::<i64>();
    }
    Ok(ns.to_vec::<f64>()?.iter().map(|t| t.round() as i64).collect())
}

impl InstrumentAngle {
    /// Unit of the angle.
    #[must_use]
    pub fn unit(&self) -> Unit {
        match self {
            Self::Fixed(value) | Self::Logged { value, .. } => value.unit(),
        }
    }

    /// Angle for each pulse time: the most recent logged value at or before
    /// it, NaN before the first entry.
    ///
    /// # Errors
    /// Returns an error for non-time units or mismatched log lengths.
    pub fn at(&self, event_time_zero: &Variable) -> Result<Vec<f64>> {
        match self {
            Self::Fixed(value) => {
                let angle = value.to_float()?.value::<f64>()?;
                Ok(vec![angle; event_time_zero.len()])
            }
            Self::Logged { time, value } => {
                let time = epoch_ns(time)?;
                let value = value.to_float()?.to_vec::<f64>()?;
                if time.len() != value.len() {
                    return Err(Error::DimensionMismatch {
                        dim: SETTING_DIM.to_string(),
                        expected: time.len(),
                        found: value.len(),
                    });
                }
                Ok(epoch_ns(event_time_zero)?
                    .iter()
                    .map(|t| match time.partition_point(|x| x <= t) {
                        0 => f64::NAN,
                        i => value[i - 1],
                    })
                    .collect())
            }
        }
    }
}

fn unique_sorted(values: &[f64]) -> Vec<f64> {
    let mut unique: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    unique.sort_by(f64::total_cmp);
    unique.dedup();
    unique
}

/// Group events into new inner dimensions `a3` and `a4` by the angles at
/// their pulse time.
///
/// Fixed angles produce dimensions of length one. Events before the first
/// logged angle are dropped.
///
/// # Errors
/// Returns an error for dense data or a missing `event_time_zero` when an
/// angle is logged.
pub fn group_by_rotation(data: &DataArray, a3: &InstrumentAngle, a4: &InstrumentAngle) -> Result<DataArray> {
    let events = data.require_events()?;
    let pulse_times = match events.coords.get("event_time_zero") {
        Some(etz) => etz.clone(),
        None if matches!((a3, a4), (InstrumentAngle::Fixed(_), InstrumentAngle::Fixed(_))) => {
            Variable::ints_1d(EVENT_DIM, vec![0; events.len()], Unit::NANOSECOND)
        }
        None => return Err(Error::MissingCoordinate("event_time_zero".to_string())),
    };
    let a3_events = a3.at(&pulse_times)?;
    let a4_events = a4.at(&pulse_times)?;
    let a3_groups = unique_sorted(&a3_events);
    let a4_groups = unique_sorted(&a4_events);
    let (n3, n4) = (a3_groups.len(), a4_groups.len());

    let mut keep = Vec::with_capacity(events.len());
    let mut bins = Vec::with_capacity(events.len());
    for ((&bin, &x3), &x4) in events.bin.iter().zip(&a3_events).zip(&a4_events) {
        let i3 = a3_groups.binary_search_by(|g| g.total_cmp(&x3));
        let i4 = a4_groups.binary_search_by(|g| g.total_cmp(&x4));
        if let (Ok(i3), Ok(i4)) = (i3, i4) {
            keep.push(true);
            bins.push(bin * n3 * n4 + i3 * n4 + i4);
        } else {
            keep.push(false);
        }
    }
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped > 0 {
        warn!("Dropping {dropped} events recorded before the first logged angle");
    }
    let mut grouped = events.filter(&keep)?;
    grouped.bin = bins;

    let mut dims: Vec<&str> = data.dims().iter().map(String::as_str).collect();
    dims.extend(["a3", "a4"]);
    let mut shape = data.shape().to_vec();
    shape.extend([n3, n4]);
    let mut out = DataArray::binned(&dims, &shape, grouped, data.unit())?;
    for (name, coord) in data.coords() {
        out.insert_coord_entry(name, coord.clone())?;
    }
    for (name, mask) in data.masks() {
        out.insert_mask(name, mask.clone())?;
    }
    out.insert_coord("a3", Variable::floats_1d("a3", a3_groups, a3.unit()))?;
    out.insert_coord("a4", Variable::floats_1d("a4", a4_groups, a4.unit()))?;
    info!("Grouped {} events into {n3} x {n4} rotation settings", out.event_count());
    Ok(out)
}

/// Detector and monitor data of one instrument setting.
#[derive(Debug, Clone, PartialEq)]
pub struct Setting {
    pub detector: DataArray,
    pub monitor: DataArray,
}

/// Split rotation-grouped detector data and a monitor into one entry per
/// `(a3, a4)` setting.
///
/// The detector settings are flattened to a `time` dimension, which must
/// have the same length as the monitor's `time` dimension if it has one.
///
/// # Errors
/// Returns [`Error::DimensionMismatch`] for differing `time` lengths.
pub fn split_by_setting(detector: &DataArray, monitor: &DataArray) -> Result<Vec<Setting>> {
    if detector.size_of("a3").is_none() || detector.size_of("a4").is_none() {
        warn!("Detector data is not grouped by a3 and a4; not splitting");
        return Ok(vec![Setting {
            detector: detector.clone(),
            monitor: monitor.clone(),
        }]);
    }
    let flat = detector.clone().flatten(&["a3", "a4"], SETTING_DIM)?;
    let n_settings = flat.size_of(SETTING_DIM).unwrap_or(1);
    if let Some(n_monitor) = monitor.size_of(SETTING_DIM) {
        if n_monitor != n_settings {
            return Err(Error::DimensionMismatch {
                dim: SETTING_DIM.to_string(),
                expected: n_settings,
                found: n_monitor,
            });
        }
    }
    (0..n_settings)
        .map(|i| {
            let monitor = if monitor.size_of(SETTING_DIM).is_some() {
                monitor.slice(SETTING_DIM, i)?
            } else {
                monitor.clone()
            };
            Ok(Setting {
                detector: flat.slice(SETTING_DIM, i)?,
                monitor,
            })
        })
        .collect()
}

/// A projection of Q and energy transfer onto a line, with bins on it.
#[derive(Debug, Clone)]
#[must_use]
pub struct CutAxis {
    /// Name of the projected coordinate.
    pub output: String,
    /// Computes the projection from named coordinates.
    pub node: Node,
    pub bins: BinSpec,
}

impl CutAxis {
    pub fn new(output: &str, node: Node, bins: BinSpec) -> Self {
        Self {
            output: output.to_string(),
            node,
            bins,
        }
    }

    /// Projection of the sample-table momentum transfer onto `direction`.
    pub fn from_q_vector(output: &str, direction: Vector3<f64>, bins: BinSpec) -> Self {
        let direction = Variable::vector(direction.normalize(), Unit::DIMENSIONLESS);
        Self::new(
            output,
            Node::unary("sample_table_momentum_transfer", move |q| direction.dot(q)),
            bins,
        )
    }

    /// Energy transfer as is.
    pub fn energy_transfer(output: &str, bins: BinSpec) -> Self {
        Self::new(output, Node::alias("energy_transfer"), bins)
    }

    /// Norm of the sample-table momentum transfer.
    pub fn q_norm(output: &str, bins: BinSpec) -> Self {
        Self::new(
            output,
            Node::unary("sample_table_momentum_transfer", Variable::norm),
            bins,
        )
    }

    fn inputs(&self) -> Vec<&str> {
        match &self.node {
            Node::Constant(_) => Vec::new(),
            Node::Alias(source) => vec![source.as_str()],
            Node::Function { inputs, .. } => inputs.iter().map(String::as_str).collect(),
        }
    }
}

/// Project all events onto two cut axes and histogram them.
///
/// The result has dimensions `(axis_2.output, axis_1.output)`.
///
/// # Errors
/// Returns an error for dense data, missing inputs or empty ranges.
pub fn cut(data: &DataArray, axis_1: &CutAxis, axis_2: &CutAxis) -> Result<DataArray> {
    let events = data.require_events()?;
    let dense_inputs: Vec<&str> = axis_1
        .inputs()
        .into_iter()
        .chain(axis_2.inputs())
        .filter(|name| !events.coords.contains_key(*name) && data.coords().contains_key(*name))
        .collect();
    let flat = data.concat_bins(&dense_inputs)?;
    let graph = CoordTransformGraph::new()
        .with(&axis_1.output, axis_1.node.clone())
        .with(&axis_2.output, axis_2.node.clone());
    let projected = graph.transform(
        &flat,
        &[axis_1.output.as_str(), axis_2.output.as_str()],
        TransformOptions::default().keep_inputs(false),
    )?;
    let histogram = hist_events(
        &projected,
        &[
            (axis_2.output.as_str(), axis_2.bins.clone()),
            (axis_1.output.as_str(), axis_1.bins.clone()),
        ],
    )?;
    debug!(
        "Cut {} events along '{}' and '{}'",
        projected.event_count(),
        axis_1.output,
        axis_2.output
    );
    Ok(histogram)
}

/// Directions in Q spanning a two-dimensional Q map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QProjection {
    pub parallel: Vector3<f64>,
    pub perpendicular: Vector3<f64>,
}

impl Default for QProjection {
    fn default() -> Self {
        Self {
            parallel: Vector3::z(),
            perpendicular: Vector3::x(),
        }
    }
}

/// Project Q onto the axes of `projection` and compute its norm.
///
/// Adds event coordinates `Q_parallel`, `Q_perpendicular` and `Q`, moves
/// `a3` onto the events and concatenates all bins.
///
/// # Errors
/// Returns an error if the events lack `sample_table_momentum_transfer`.
pub fn project_momentum_transfer(data: &DataArray, projection: &QProjection) -> Result<DataArray> {
    let along = |v: Vector3<f64>| {
        let v = Variable::vector(v.normalize(), Unit::DIMENSIONLESS);
        Node::unary("sample_table_momentum_transfer", move |q| q.dot(&v))
    };
    let graph = CoordTransformGraph::new()
        .with("Q_parallel", along(projection.parallel))
        .with("Q_perpendicular", along(projection.perpendicular))
        .with("Q", Node::unary("sample_table_momentum_transfer", Variable::norm));
    let transformed = graph.transform(
        data,
        &["Q_parallel", "Q_perpendicular", "Q"],
        TransformOptions::default().keep_inputs(false),
    )?;
    let keep: &[&str] = if transformed.coords().contains_key("a3") {
        &["a3"]
    } else {
        &[]
    };
    transformed.concat_bins(keep)
}

/// Two-dimensional Q map of projected events, over
/// `(Q_perpendicular, Q_parallel)`.
///
/// # Errors
/// Returns an error if the events lack the projected coordinates or a range
/// must be derived from no data.
pub fn q_map(events: &DataArray, q_parallel_bins: &BinSpec, q_perpendicular_bins: &BinSpec) -> Result<DataArray> {
    hist_events(
        events,
        &[
            ("Q_perpendicular", q_perpendicular_bins.clone()),
            ("Q_parallel", q_parallel_bins.clone()),
        ],
    )
}

/// Histogram over `a3` of the events with `lo <= Q < hi`.
///
/// An empty selection yields a two-point zero placeholder spanning the
/// `a3` range of all events.
///
/// # Errors
/// Returns an error if the events lack `Q` or `a3`, or carry no finite `a3`.
pub fn q_slice(events: &DataArray, q_range: (f64, f64), a3_bins: &BinSpec) -> Result<DataArray> {
    let table = events.require_events()?;
    let q = events.event_coord("Q")?.to_vec::<f64>()?;
    let keep: Vec<bool> = q.iter().map(|&q| q >= q_range.0 && q < q_range.1).collect();
    let sliced = events
        .clone()
        .with_content(Content::Binned(table.filter(&keep)?), events.unit())?;
    match hist_events(&sliced, &[("a3", a3_bins.clone())]) {
        Ok(histogram) => rename(histogram, "a3", SAMPLE_ROTATION_DIM),
        Err(Error::EmptyRange { .. }) => empty_rotation_like(events),
        Err(e) => Err(e),
    }
}

/// Rename a dimension together with its coordinate.
fn rename(data: DataArray, from: &str, to: &str) -> Result<DataArray> {
    let mut data = data.rename_dim(from, to);
    if let Some(coord) = data.remove_coord(from) {
        data.insert_coord_entry(to, coord)?;
    }
    Ok(data)
}

fn empty_rotation_like(events: &DataArray) -> Result<DataArray> {
    let a3 = events.event_coord("a3")?;
    let (Some(lo), Some(hi)) = (a3.nanmin()?, a3.nanmax()?) else {
        return Err(Error::EmptyRange {
            dim: "a3".to_string(),
        });
    };
    let zeros = Variable::floats_1d(SAMPLE_ROTATION_DIM, vec![0.0, 0.0], events.unit());
    let variances = ndarray::ArrayD::zeros(ndarray::IxDyn(&[2]));
    let mut out = DataArray::dense(&zeros, Some(variances))?;
    out.insert_coord(
        SAMPLE_ROTATION_DIM,
        Variable::floats_1d(SAMPLE_ROTATION_DIM, vec![lo, hi], a3.unit()),
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use bifrost_core::EventTable;

    fn events_at(pulses: Vec<i64>) -> DataArray {
        let n = pulses.len();
        let mut table = EventTable::unit_weights((0..n).map(|i| i % 2).collect());
        table
            .insert_coord("event_time_zero", Variable::ints_1d(EVENT_DIM, pulses, Unit::NANOSECOND))
            .unwrap();
        DataArray::binned(&["pixel"], &[2], table, Unit::COUNTS).unwrap()
    }

    fn logged(times: Vec<i64>, values: Vec<f64>) -> InstrumentAngle {
        InstrumentAngle::Logged {
            time: Variable::ints_1d("time", times, Unit::NANOSECOND),
            value: Variable::floats_1d("time", values, Unit::DEGREE),
        }
    }

    #[test]
    fn test_angle_lookup_takes_preceding_value() {
        let angle = logged(vec![100, 200, 300], vec![0.0, 2.0, 4.0]);
        let at = angle
            .at(&Variable::ints_1d(EVENT_DIM, vec![50, 100, 250, 1000], Unit::NANOSECOND))
            .unwrap();
        assert!(at[0].is_nan());
        assert_eq!(&at[1..], &[0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_group_by_rotation() {
        let data = events_at(vec![150, 150, 250, 250, 350, 50]);
        let a3 = logged(vec![100, 200, 300], vec![0.0, 2.0, 0.0]);
        let a4 = InstrumentAngle::Fixed(Variable::scalar(30.0, Unit::DEGREE));
        let grouped = group_by_rotation(&data, &a3, &a4).unwrap();
        assert_eq!(grouped.dims(), ["pixel", "a3", "a4"]);
        assert_eq!(grouped.shape(), [2, 2, 1]);
        assert_eq!(grouped.coord("a3").unwrap().to_vec::<f64>().unwrap(), vec![0.0, 2.0]);
        // The event before the first log entry is dropped.
        assert_eq!(grouped.event_count(), 5);
        let at_two = grouped.slice("a3", 1).unwrap();
        assert_eq!(at_two.event_count(), 2);
    }

    #[test]
    fn test_split_by_setting_checks_time_length() {
        let data = events_at(vec![150, 250, 350]);
        let a3 = logged(vec![100, 200, 300], vec![0.0, 1.0, 2.0]);
        let a4 = InstrumentAngle::Fixed(Variable::scalar(30.0, Unit::DEGREE));
        let grouped = group_by_rotation(&data, &a3, &a4).unwrap();
        let monitor = |n: usize| {
            DataArray::dense(&Variable::floats_1d("time", vec![1.0; n], Unit::COUNTS), None).unwrap()
        };
        let settings = split_by_setting(&grouped, &monitor(3)).unwrap();
        assert_eq!(settings.len(), 3);
        assert_eq!(settings[1].detector.event_count(), 1);
        assert_eq!(settings[1].monitor.dims().len(), 0);
        assert!(matches!(
            split_by_setting(&grouped, &monitor(2)),
            Err(Error::DimensionMismatch { expected: 3, found: 2, .. })
        ));
    }

    fn q_events() -> DataArray {
        let q = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 2.0),
            Vector3::new(0.5, 0.0, 0.5),
        ];
        let mut table = EventTable::unit_weights(vec![0, 1, 1]);
        table
            .insert_coord(
                "sample_table_momentum_transfer",
                Variable::vectors_1d(EVENT_DIM, q, Unit::INVERSE_ANGSTROM),
            )
            .unwrap();
        table
            .insert_coord(
                "energy_transfer",
                Variable::floats_1d(EVENT_DIM, vec![0.1, -0.2, 0.3], Unit::MILLI_ELECTRON_VOLT),
            )
            .unwrap();
        let mut da = DataArray::binned(&["a3"], &[2], table, Unit::COUNTS).unwrap();
        da.insert_coord("a3", Variable::floats_1d("a3", vec![10.0, 20.0], Unit::DEGREE))
            .unwrap();
        da
    }

    #[test]
    fn test_cut_conserves_counts() {
        let qx = CutAxis::from_q_vector("Qx", Vector3::new(2.0, 0.0, 0.0), BinSpec::Count(4));
        let energy = CutAxis::energy_transfer("E", BinSpec::Count(3));
        let histogram = cut(&q_events(), &qx, &energy).unwrap();
        assert_eq!(histogram.dims(), ["E", "Qx"]);
        assert_relative_eq!(histogram.total(), 3.0);
    }

    #[test]
    fn test_projection_and_q_slice() {
        let projected = project_momentum_transfer(&q_events(), &QProjection::default()).unwrap();
        let events = projected.events().unwrap();
        assert_eq!(projected.dims().len(), 0);
        assert_eq!(
            events.coord("Q_parallel").unwrap().to_vec::<f64>().unwrap(),
            vec![0.0, 2.0, 0.5]
        );
        assert_eq!(events.coord("a3").unwrap().to_vec::<f64>().unwrap(), vec![10.0, 20.0, 20.0]);
        assert!(!events.coords.contains_key("sample_table_momentum_transfer"));

        let bins = BinSpec::linspace("a3", 0.0, 30.0, 3, Unit::DEGREE);
        let slice = q_slice(&projected, (0.9, 1.1), &bins).unwrap();
        assert_eq!(slice.dims(), [SAMPLE_ROTATION_DIM]);
        assert_eq!(slice.data().unwrap().to_vec::<f64>().unwrap(), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_q_map_keeps_all_events() {
        let projected = project_momentum_transfer(&q_events(), &QProjection::default()).unwrap();
        let map = q_map(&projected, &BinSpec::Count(4), &BinSpec::Count(2)).unwrap();
        assert_eq!(map.dims(), ["Q_perpendicular", "Q_parallel"]);
        assert_eq!(map.shape(), [2, 4]);
        assert_eq!(map.total(), 3.0);
    }

    #[test]
    fn test_empty_q_slice_gives_placeholder() {
        let projected = project_momentum_transfer(&q_events(), &QProjection::default()).unwrap();
        let slice = q_slice(&projected, (5.0, 6.0), &BinSpec::Count(10)).unwrap();
        assert_eq!(slice.data().unwrap().to_vec::<f64>().unwrap(), vec![0.0, 0.0]);
        assert_eq!(
            slice.coord(SAMPLE_ROTATION_DIM).unwrap().to_vec::<f64>().unwrap(),
            vec![10.0, 20.0]
        );
    }
}
