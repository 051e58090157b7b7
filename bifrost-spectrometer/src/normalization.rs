//! Monitor and proton-charge normalization.
//!
//! Detector events are divided by the wavelength distribution of a beam
//! monitor, normalized to unit integral, and by the accumulated proton
//! charge:
//!
//! ```text
//! d_e' = d_e · Δλ_i · Σ_j m_j / (m_i · C)
//! ```
//!
//! where `i` is the monitor bin holding the event's incident wavelength.

use crate::histogram::bin_index;
use bifrost_core::{CoordKind, DataArray, Error, Result, Unit, Variable, EVENT_DIM};
use log::{debug, info, warn};
use ndarray::{ArrayD, IxDyn};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Coordinate used to look up the monitor for each event.
pub const NORMALIZATION_COORD: &str = "incident_wavelength";

/// How uncertainties of the normalization term reach the events.
///
/// The normalization has one value per monitor bin but is applied to many
/// events, which correlates their uncertainties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum UncertaintyBroadcastMode {
    /// Ignore the normalization variances.
    #[default]
    Drop,
    /// Scale the variances by the number of events sharing a monitor bin.
    UpperBound,
    /// Refuse to broadcast variances.
    Fail,
}

impl fmt::Display for UncertaintyBroadcastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Drop => "drop",
            Self::UpperBound => "upper_bound",
            Self::Fail => "fail",
        };
        f.write_str(name)
    }
}

impl FromStr for UncertaintyBroadcastMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop" => Ok(Self::Drop),
            "upper_bound" => Ok(Self::UpperBound),
            "fail" => Ok(Self::Fail),
            other => Err(Error::InvalidConfig(format!(
                "unknown uncertainty broadcast mode '{other}'"
            ))),
        }
    }
}

/// Dimension and edges (Å) of the monitor wavelength coordinate.
fn wavelength_edges(monitor: &DataArray) -> Result<(String, Vec<f64>)> {
    let entry = monitor
        .coord_entry(NORMALIZATION_COORD)
        .ok_or_else(|| Error::MissingCoordinate(NORMALIZATION_COORD.to_string()))?;
    let CoordKind::BinEdges { dim } = &entry.kind else {
        return Err(Error::Unsupported(format!(
            "monitor '{NORMALIZATION_COORD}' must be bin edges"
        )));
    };
    if monitor.dims() != [dim.clone()] {
        return Err(Error::ShapeMismatch(format!(
            "monitor must be one-dimensional along '{dim}', got {:?}",
            monitor.dims()
        )));
    }
    let edges = entry.var.to_unit(&Unit::ANGSTROM)?.to_vec::<f64>()?;
    Ok((dim.clone(), edges))
}

/// Monitor counts as a probability density in wavelength, in 1/Å.
///
/// A `time` dimension is summed first. Masked bins are excluded from the
/// total and keep their masks.
///
/// # Errors
/// Returns an error if the monitor lacks wavelength edges or holds no counts.
pub fn monitor_distribution(monitor: &DataArray) -> Result<DataArray> {
    let monitor = if monitor.size_of("time").is_some() {
        monitor.sum_dim("time")?
    } else {
        monitor.clone()
    };
    let (dim, edges) = wavelength_edges(&monitor)?;
    let masked = monitor.combined_mask()?;
    let (values, variances) = monitor.dense_values()?;
    let total: f64 = values
        .iter()
        .zip(&masked)
        .filter(|(_, &m)| !m)
        .map(|(v, _)| v)
        .sum();
    if total == 0.0 {
        return Err(Error::EmptyRange { dim });
    }
    let scale: Vec<f64> = edges.windows(2).map(|w| 1.0 / ((w[1] - w[0]) * total)).collect();
    let density: Vec<f64> = values.iter().zip(&scale).map(|(m, s)| m * s).collect();
    let density_variances = variances
        .map(|v| {
            let v: Vec<f64> = v.iter().zip(&scale).map(|(v, s)| v * s * s).collect();
            ArrayD::from_shape_vec(IxDyn(&[v.len()]), v)
        })
        .transpose()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;

    let mut out = DataArray::dense(
        &Variable::floats_1d(&dim, density, Unit::INVERSE_ANGSTROM),
        density_variances,
    )?;
    out.insert_edges(
        NORMALIZATION_COORD,
        &dim,
        Variable::floats_1d(&dim, edges, Unit::ANGSTROM),
    )?;
    for (name, mask) in monitor.masks() {
        out.insert_mask(name, mask.clone())?;
    }
    Ok(out)
}

/// Divide detector event weights by the monitor distribution and the proton
/// charge.
///
/// `proton_charge` is a scalar or varies along dimensions of the detector
/// (for example one value per `a3`/`a4` setting). Events whose wavelength
/// lies outside the monitor or in a masked monitor bin are dropped.
///
/// # Errors
/// Returns [`Error::UncertaintyBroadcast`] in [`UncertaintyBroadcastMode::Fail`]
/// when the monitor has variances, or errors for missing coordinates.
#[allow(clippy::cast_precision_loss)]
pub fn normalize_by_monitor_and_proton_charge(
    detector: &DataArray,
    monitor: &DataArray,
    proton_charge: &Variable,
    mode: UncertaintyBroadcastMode,
) -> Result<DataArray> {
    let distribution = monitor_distribution(monitor)?;
    let (_, edges) = wavelength_edges(&distribution)?;
    let masked = distribution.combined_mask()?;
    let (density, density_variances) = distribution.dense_values()?;
    let density: Vec<f64> = density.iter().copied().collect();
    let mut norm_variances: Option<Vec<f64>> = match (mode, density_variances) {
        (_, None) | (UncertaintyBroadcastMode::Drop, _) => None,
        (UncertaintyBroadcastMode::Fail, Some(_)) => {
            return Err(Error::UncertaintyBroadcast(
                "monitor variances cannot be broadcast to detector events".to_string(),
            ))
        }
        (UncertaintyBroadcastMode::UpperBound, Some(v)) => Some(v.iter().copied().collect()),
    };

    let events = detector.require_events()?;
    let wavelength = detector
        .event_coord(NORMALIZATION_COORD)?
        .to_unit(&Unit::ANGSTROM)?
        .to_vec::<f64>()?;
    let charge = proton_charge
        .to_float()?
        .gather(detector.dims(), detector.shape(), &events.bin, EVENT_DIM)?
        .to_vec::<f64>()?;

    let lookup: Vec<Option<usize>> = wavelength
        .iter()
        .map(|&w| bin_index(&edges, w).filter(|&i| !masked[i]))
        .collect();
    let keep: Vec<bool> = lookup.iter().map(Option::is_some).collect();
    let dropped = keep.iter().filter(|k| !**k).count();
    if dropped > 0 {
        warn!(
            "Dropping {dropped} of {} events outside the monitor wavelength range or in masked monitor bins",
            events.len()
        );
    }

    if let Some(variances) = norm_variances.as_mut() {
        let mut per_bin = vec![0usize; variances.len()];
        for i in lookup.iter().flatten() {
            per_bin[*i] += 1;
        }
        for (v, n) in variances.iter_mut().zip(per_bin) {
            *v *= n as f64;
        }
    }

    let mut normalized = events.filter(&keep)?;
    let kept = lookup.iter().zip(&charge).filter_map(|(i, c)| i.map(|i| (i, *c)));
    for (e, (bin, c)) in kept.enumerate() {
        let n = density[bin] * c;
        let w = normalized.weights[e];
        normalized.weights[e] = w / n;
        if let Some(var) = normalized.variances.as_mut() {
            let norm_var = norm_variances.as_ref().map_or(0.0, |v| v[bin] * c * c);
            var[e] = var[e] / (n * n) + w * w * norm_var / n.powi(4);
        }
    }
    let non_finite = normalized.weights.iter().filter(|w| !w.is_finite()).count();
    if non_finite > 0 {
        warn!("{non_finite} normalized event weights are not finite");
    }

    let unit = detector.unit() / (Unit::INVERSE_ANGSTROM * proton_charge.unit());
    debug!("Normalized events have unit {unit}");
    let out = detector
        .clone()
        .with_content(bifrost_core::Content::Binned(normalized), unit)?;
    info!("Normalized {} events by monitor and proton charge", out.event_count());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use bifrost_core::EventTable;

    fn monitor(edges_unit: Unit, scale: f64, variances: bool) -> DataArray {
        let counts = Variable::floats_1d("tof", vec![10.0, 30.0, 60.0], Unit::COUNTS);
        let var = variances.then(|| ArrayD::from_shape_vec(IxDyn(&[3]), vec![10.0, 30.0, 60.0]).unwrap());
        let mut m = DataArray::dense(&counts, var).unwrap();
        let edges: Vec<f64> = [1.0, 2.0, 3.0, 5.0].iter().map(|e| e * scale).collect();
        m.insert_edges(NORMALIZATION_COORD, "tof", Variable::floats_1d("tof", edges, edges_unit))
            .unwrap();
        m
    }

    fn detector(wavelengths: Vec<f64>) -> DataArray {
        let n = wavelengths.len();
        let mut events = EventTable::unit_weights(vec![0; n]);
        events
            .insert_coord(
                NORMALIZATION_COORD,
                Variable::floats_1d(EVENT_DIM, wavelengths, Unit::ANGSTROM),
            )
            .unwrap();
        DataArray::binned(&["pixel"], &[1], events, Unit::COUNTS).unwrap()
    }

    #[test]
    fn test_distribution_has_unit_integral() {
        let d = monitor_distribution(&monitor(Unit::ANGSTROM, 1.0, false)).unwrap();
        let density = d.data().unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(density[0], 0.1);
        assert_relative_eq!(density[2], 0.3);
        let integral = density[0] + density[1] + 2.0 * density[2];
        assert_relative_eq!(integral, 1.0, max_relative = 1e-12);
    }

    #[test]
    fn test_time_dimension_is_summed() {
        let counts = Variable::from_shape_vec(
            &["time", "tof"],
            &[2, 2],
            vec![1.0, 3.0, 1.0, 3.0],
            Unit::COUNTS,
        )
        .unwrap();
        let mut m = DataArray::dense(&counts, None).unwrap();
        m.insert_edges(
            NORMALIZATION_COORD,
            "tof",
            Variable::floats_1d("tof", vec![1.0, 2.0, 3.0], Unit::ANGSTROM),
        )
        .unwrap();
        let d = monitor_distribution(&m).unwrap();
        assert_eq!(d.dims(), ["tof"]);
        assert_eq!(d.data().unwrap().to_vec::<f64>().unwrap(), vec![0.25, 0.75]);
    }

    #[test]
    fn test_normalized_weights_and_unit() {
        let det = detector(vec![1.5, 4.0, 7.0]);
        let charge = Variable::scalar(2.0, Unit::MICRO_AMPERE_HOUR);
        let out = normalize_by_monitor_and_proton_charge(
            &det,
            &monitor(Unit::ANGSTROM, 1.0, false),
            &charge,
            UncertaintyBroadcastMode::Drop,
        )
        .unwrap();
        // The event at 7 Å lies outside the monitor.
        let events = out.events().unwrap();
        assert_eq!(events.len(), 2);
        assert_relative_eq!(events.weights[0], 1.0 / (0.1 * 2.0), max_relative = 1e-12);
        assert_relative_eq!(events.weights[1], 1.0 / (0.3 * 2.0), max_relative = 1e-12);
        assert!(out.unit().same_dimension(&(Unit::ANGSTROM / Unit::MICRO_AMPERE_HOUR * Unit::COUNTS)));
    }

    #[test]
    fn test_edge_unit_does_not_change_result() {
        let det = detector(vec![1.5, 4.0]);
        let charge = Variable::scalar(1.0, Unit::MICRO_AMPERE_HOUR);
        let in_angstrom = normalize_by_monitor_and_proton_charge(
            &det,
            &monitor(Unit::ANGSTROM, 1.0, false),
            &charge,
            UncertaintyBroadcastMode::Drop,
        )
        .unwrap();
        let in_meter = normalize_by_monitor_and_proton_charge(
            &det,
            &monitor(Unit::METER, 1e-10, false),
            &charge,
            UncertaintyBroadcastMode::Drop,
        )
        .unwrap();
        assert_eq!(in_angstrom.unit(), in_meter.unit());
        for (a, b) in in_angstrom
            .events()
            .unwrap()
            .weights
            .iter()
            .zip(&in_meter.events().unwrap().weights)
        {
            assert_relative_eq!(a, b, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_broadcast_modes() {
        let det = detector(vec![1.5, 1.6]);
        let charge = Variable::scalar(1.0, Unit::MICRO_AMPERE_HOUR);
        let m = monitor(Unit::ANGSTROM, 1.0, true);
        assert!(matches!(
            normalize_by_monitor_and_proton_charge(&det, &m, &charge, UncertaintyBroadcastMode::Fail),
            Err(Error::UncertaintyBroadcast(_))
        ));
        let dropped =
            normalize_by_monitor_and_proton_charge(&det, &m, &charge, UncertaintyBroadcastMode::Drop).unwrap();
        let upper =
            normalize_by_monitor_and_proton_charge(&det, &m, &charge, UncertaintyBroadcastMode::UpperBound)
                .unwrap();
        let dropped_var = dropped.events().unwrap().variances.clone().unwrap();
        let upper_var = upper.events().unwrap().variances.clone().unwrap();
        // var(w / n) = 1 / n² without monitor variances, n = 0.1.
        assert_relative_eq!(dropped_var[0], 100.0, max_relative = 1e-12);
        assert!(upper_var[0] > dropped_var[0]);
    }

    #[test]
    fn test_masked_monitor_bins_drop_events() {
        let mut m = monitor(Unit::ANGSTROM, 1.0, false);
        m.insert_mask(
            "bad",
            Variable::from_shape_vec(&["tof"], &[3], vec![true, false, false], Unit::DIMENSIONLESS).unwrap(),
        )
        .unwrap();
        let out = normalize_by_monitor_and_proton_charge(
            &detector(vec![1.5, 2.5]),
            &m,
            &Variable::scalar(1.0, Unit::MICRO_AMPERE_HOUR),
            UncertaintyBroadcastMode::Drop,
        )
        .unwrap();
        assert_eq!(out.event_count(), 1);
        // The masked bin does not count towards the total.
        assert_relative_eq!(out.events().unwrap().weights[0], 1.0 / (30.0 / 90.0), max_relative = 1e-12);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("upper_bound".parse::<UncertaintyBroadcastMode>().unwrap(), UncertaintyBroadcastMode::UpperBound);
        assert!("sometimes".parse::<UncertaintyBroadcastMode>().is_err());
        assert_eq!(UncertaintyBroadcastMode::default().to_string(), "drop");
    }
}
