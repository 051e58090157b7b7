//! Primary spectrometer: source → sample.
//!
//! Two descriptions of the incident neutrons live here. The beamline graph
//! provides `incident_beam` and `L1` from the source and sample positions and
//! is what the lookup-table based reduction uses. The pivot-time model derives
//! the incident wavevector directly from the time at the sample, using a
//! focus distance and time defined by the first chopper(s).

use crate::graph::{CoordTransformGraph, Node};
use crate::secondary::energy_from_wavenumber;
use crate::source::Source;
use bifrost_core::constants::{HBAR, NEUTRON_MASS, PLANCK};
use bifrost_core::{in_same_unit, zip3_with, zip_with, Error, Result, Unit, Variable};
use nalgebra::Vector3;

/// Cumulative distance within which choppers after the first still define
/// the focus, in m.
pub const FOCUS_ALLOWANCE: f64 = 0.5;

/// A disk chopper along the primary flight path.
#[derive(Debug, Clone, PartialEq)]
pub struct Chopper {
    pub name: String,
    /// Position in m.
    pub position: Vector3<f64>,
    /// Opening delay after the pulse in s.
    pub delay: f64,
}

/// Geometry and timing of the primary flight path.
///
/// Guides and choppers must be ordered along the beam.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimarySpectrometer {
    pub source: Source,
    /// Source position in m.
    pub source_position: Vector3<f64>,
    /// Sample position in m.
    pub sample_position: Vector3<f64>,
    /// Guide positions in m.
    pub guides: Vec<Vector3<f64>>,
    pub choppers: Vec<Chopper>,
}

impl PrimarySpectrometer {
    /// Flight path length from the source through all guides to the sample, in m.
    #[must_use]
    pub fn path_length(&self) -> f64 {
        let mut total = 0.0;
        let mut last = self.source_position;
        for point in self.guides.iter().chain(std::iter::once(&self.sample_position)) {
            total += (point - last).norm();
            last = *point;
        }
        total
    }

    /// Names of the choppers defining the focus: the first chopper and the
    /// ones following it within `allowance` m of cumulative distance.
    #[must_use]
    pub fn focus_component_names(&self, allowance: f64) -> Vec<String> {
        let Some(first) = self.choppers.first() else {
            return Vec::new();
        };
        let mut names = vec![first.name.clone()];
        let mut last = first.position;
        let mut distance = 0.0;
        for chopper in &self.choppers[1..] {
            distance += (chopper.position - last).norm();
            last = chopper.position;
            if distance > allowance {
                break;
            }
            names.push(chopper.name.clone());
        }
        names
    }

    fn focus_choppers(&self) -> Result<Vec<&Chopper>> {
        let names = self.focus_component_names(FOCUS_ALLOWANCE);
        if names.is_empty() {
            return Err(Error::missing_component("NXdisk_chopper", "focus chopper"));
        }
        Ok(self
            .choppers
            .iter()
            .filter(|c| names.contains(&c.name))
            .collect())
    }

    /// Distance from the source to the mean focus-chopper position, in m.
    ///
    /// # Errors
    /// Returns [`Error::MissingComponent`] without choppers.
    pub fn focus_distance(&self) -> Result<f64> {
        let choppers = self.focus_choppers()?;
        let mean = choppers
            .iter()
            .fold(Vector3::zeros(), |acc, c| acc + c.position)
            / choppers.len() as f64;
        Ok((mean - self.source_position).norm())
    }

    /// Mean opening delay of the focus choppers, in s.
    ///
    /// # Errors
    /// Returns [`Error::MissingComponent`] without choppers.
    pub fn focus_time(&self) -> Result<f64> {
        let choppers = self.focus_choppers()?;
        Ok(choppers.iter().map(|c| c.delay).sum::<f64>() / choppers.len() as f64)
    }

    /// Earliest time at which a neutron can reach the sample, in s.
    #[must_use]
    pub fn pivot_time(&self) -> f64 {
        self.source.delay + self.path_length() / self.source.max_velocity()
    }
}

/// Coordinate graph of the primary beamline.
#[must_use]
pub fn primary_spectrometer_graph() -> CoordTransformGraph {
    CoordTransformGraph::new()
        .with(
            "incident_beam",
            Node::binary(["source_position", "sample_position"], |source, sample| {
                sample.try_sub(source)
            }),
        )
        .with("L1", Node::unary("incident_beam", Variable::norm))
}

/// Fold times at the sample into `[least, least + period)`.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn unwrap_sample_time(times: &Variable, period: &Variable, least: &Variable) -> Result<Variable> {
    let period = in_same_unit(period, times)?;
    let least = in_same_unit(least, times)?;
    zip3_with(times, &period, &least, times.unit(), |t: &f64, p: &f64, l: &f64| {
        l + (t - l).rem_euclid(*p)
    })
}

/// Inverse velocity of incident neutrons from the focus to the sample.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn incident_slowness(
    length: &Variable,
    time: &Variable,
    distance: &Variable,
    focus: &Variable,
) -> Result<Variable> {
    let tof = time.try_sub(&in_same_unit(focus, time)?)?;
    tof.try_div(&length.try_sub(distance)?)?
        .to_unit(&Unit::SECOND_PER_METER)
}

/// Incident wavelength `h s / mₙ` from slowness, in Å.
///
/// # Errors
/// Returns an error for a unit that is not inverse velocity.
pub fn incident_wavelength(slowness: &Variable) -> Result<Variable> {
    slowness
        .to_unit(&Unit::SECOND_PER_METER)?
        .map(Unit::ANGSTROM, |s: &f64| s * PLANCK / NEUTRON_MASS * 1e10)
}

/// Incident wavenumber `mₙ / (ħ s)` from slowness, in 1/Å.
///
/// # Errors
/// Returns an error for a unit that is not inverse velocity.
pub fn incident_wavenumber(slowness: &Variable) -> Result<Variable> {
    slowness
        .to_unit(&Unit::SECOND_PER_METER)?
        .map(Unit::INVERSE_ANGSTROM, |s: &f64| NEUTRON_MASS / HBAR / s * 1e-10)
}

/// Direction of the incident beam.
#[must_use]
pub fn incident_direction() -> Variable {
    Variable::vector(Vector3::z(), Unit::DIMENSIONLESS)
}

/// Incident wavevector from magnitude and direction.
///
/// # Errors
/// Returns an error for wrong element types or shapes.
pub fn incident_wavevector(magnitude: &Variable, direction: &Variable) -> Result<Variable> {
    zip_with(
        magnitude,
        direction,
        magnitude.unit() * direction.unit(),
        |k: &f64, d: &Vector3<f64>| d * *k,
    )
}

/// Incident energy from the incident wavenumber, in meV.
///
/// # Errors
/// Returns an error for a unit that is not inverse length.
pub fn incident_energy(wavenumber: &Variable) -> Result<Variable> {
    energy_from_wavenumber(wavenumber)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TransformOptions;
    use approx::assert_relative_eq;
    use bifrost_core::DataArray;

    fn chopper(name: &str, z: f64, delay: f64) -> Chopper {
        Chopper {
            name: name.to_string(),
            position: Vector3::new(0.0, 0.0, z),
            delay,
        }
    }

    fn primary() -> PrimarySpectrometer {
        PrimarySpectrometer {
            source: Source::default(),
            source_position: Vector3::zeros(),
            sample_position: Vector3::new(0.0, 0.0, 162.0),
            guides: vec![Vector3::new(0.0, 0.1, 50.0), Vector3::new(0.0, 0.0, 100.0)],
            choppers: vec![
                chopper("pulse_shaping_1", 6.0, 0.002),
                chopper("pulse_shaping_2", 6.2, 0.004),
                chopper("frame_overlap", 8.0, 0.01),
            ],
        }
    }

    #[test]
    fn test_path_length_follows_guides() {
        let p = primary();
        let expected = (50.0f64.powi(2) + 0.01).sqrt() * 2.0 + 62.0;
        assert_relative_eq!(p.path_length(), expected, max_relative = 1e-12);
    }

    #[test]
    fn test_focus_from_close_choppers() {
        let p = primary();
        assert_eq!(p.focus_component_names(FOCUS_ALLOWANCE), vec!["pulse_shaping_1", "pulse_shaping_2"]);
        assert_relative_eq!(p.focus_distance().unwrap(), 6.1, max_relative = 1e-12);
        assert_relative_eq!(p.focus_time().unwrap(), 0.003, max_relative = 1e-12);
    }

    #[test]
    fn test_without_choppers_focus_is_missing() {
        let mut p = primary();
        p.choppers.clear();
        assert!(matches!(p.focus_time(), Err(Error::MissingComponent { .. })));
    }

    #[test]
    fn test_unwrap_sample_time() {
        let times = Variable::floats_1d("event", vec![10.0, 60.0, 75.0], Unit::MILLISECOND);
        let period = Variable::scalar(71.428_571, Unit::MILLISECOND);
        let least = Variable::scalar(0.05, Unit::SECOND);
        let unwrapped = unwrap_sample_time(&times, &period, &least).unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(unwrapped[0], 81.428_571, max_relative = 1e-9);
        assert_relative_eq!(unwrapped[1], 60.0);
        assert_relative_eq!(unwrapped[2], 75.0);
    }

    #[test]
    fn test_incident_quantities_from_slowness() {
        // 1 ms over 1 m is 1000 m/s, λ = 3.956 Å.
        let slowness = incident_slowness(
            &Variable::scalar(11.0, Unit::METER),
            &Variable::scalar(13.0, Unit::MILLISECOND),
            &Variable::scalar(1.0, Unit::METER),
            &Variable::scalar(0.003, Unit::SECOND),
        )
        .unwrap();
        assert_relative_eq!(slowness.value::<f64>().unwrap(), 1e-3, max_relative = 1e-12);
        let wavelength = incident_wavelength(&slowness).unwrap();
        assert_relative_eq!(wavelength.value::<f64>().unwrap(), 3.956_034, max_relative = 1e-6);
        let k = incident_wavenumber(&slowness).unwrap();
        assert_relative_eq!(
            k.value::<f64>().unwrap(),
            2.0 * std::f64::consts::PI / wavelength.value::<f64>().unwrap(),
            max_relative = 1e-12
        );
        let ki = incident_wavevector(&k, &incident_direction()).unwrap();
        assert_eq!(ki.unit(), Unit::INVERSE_ANGSTROM);
        assert_relative_eq!(ki.value::<Vector3<f64>>().unwrap().z, k.value::<f64>().unwrap());
    }

    #[test]
    fn test_beamline_graph() {
        let data = Variable::floats_1d("pixel", vec![0.0], Unit::COUNTS);
        let mut da = DataArray::dense(&data, None).unwrap();
        da.insert_coord("source_position", Variable::vector(Vector3::new(0.0, 0.0, -162.0), Unit::METER))
            .unwrap();
        da.insert_coord("sample_position", Variable::vector(Vector3::zeros(), Unit::METER))
            .unwrap();
        let out = primary_spectrometer_graph()
            .transform(&da, &["L1"], TransformOptions::default())
            .unwrap();
        assert_relative_eq!(out.coord("L1").unwrap().value::<f64>().unwrap(), 162.0);
        assert!(out.coord("incident_beam").is_ok());
    }
}
