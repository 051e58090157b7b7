//! Secondary spectrometer geometry: sample → analyzer → detector.
//!
//! All functions operate element-wise on [`Variable`]s and broadcast by
//! dimension name, so the same code handles one pixel, one triplet or the
//! full detector. Geometry is time independent; results are per pixel and
//! only spread to events by the coordinate graph when needed.
//!
//! Degenerate geometry (coincident positions) is not guarded: results become
//! NaN or infinite and propagate.

use crate::graph::{CoordTransformGraph, Node};
use bifrost_core::constants::{HBAR, MILLI_ELECTRON_VOLT, NEUTRON_MASS};
use bifrost_core::{
    in_same_unit, zip3_with, zip4_with, zip_with, DataArray, Error, Result, Unit, Variable,
};
use log::{debug, warn};
use nalgebra::{Isometry3, Vector3};

/// Parameters of one analyzer crystal, or of several stacked along a
/// detector dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Analyzer {
    /// Lattice plane spacing.
    pub dspacing: Variable,
    /// Nominal center of the reflecting surface.
    pub position: Variable,
    /// Orientation of the crystal; local y is normal to the scattering plane.
    pub transform: Variable,
}

impl Analyzer {
    /// Single analyzer from plain values.
    #[must_use]
    pub fn new(dspacing: f64, dspacing_unit: Unit, position: Vector3<f64>, transform: Isometry3<f64>) -> Self {
        Self {
            dspacing: Variable::scalar(dspacing, dspacing_unit),
            position: Variable::vector(position, Unit::METER),
            transform: Variable::transform(transform, Unit::METER),
        }
    }
}

/// Vector from the sample to the reflection point on the analyzer, per pixel.
///
/// The out-of-plane part of the sample→detector vector is shared between the
/// two flight segments in proportion to their in-plane lengths.
///
/// # Errors
/// Returns an error for wrong element types, incompatible units or shapes.
pub fn sample_analyzer_vector(
    sample_position: &Variable,
    analyzer_position: &Variable,
    analyzer_transform: &Variable,
    detector_position: &Variable,
) -> Result<Variable> {
    let unit = detector_position.unit();
    let sample = in_same_unit(sample_position, detector_position)?;
    let analyzer = in_same_unit(analyzer_position, detector_position)?;
    zip4_with(
        &sample,
        &analyzer,
        analyzer_transform,
        detector_position,
        unit,
        |s: &Vector3<f64>, a: &Vector3<f64>, t: &Isometry3<f64>, d: &Vector3<f64>| {
            let yhat = t.transform_vector(&Vector3::y()).normalize();
            let sa_center = a - s;
            let sd = d - s;
            let sd_out_of_plane = sd.dot(&yhat);
            let ad_center = sd - sa_center - yhat * sd_out_of_plane;
            let l_sa = sa_center.norm();
            let l_ad = ad_center.norm();
            let sa_out_of_plane = l_sa / (l_sa + l_ad) * sd_out_of_plane;
            sa_center + yhat * sa_out_of_plane
        },
    )
}

/// Vector from the analyzer reflection point to the detector pixel.
///
/// # Errors
/// Returns an error for wrong element types, incompatible units or shapes.
pub fn analyzer_detector_vector(
    sample_position: &Variable,
    sample_analyzer_vector: &Variable,
    detector_position: &Variable,
) -> Result<Variable> {
    let reflection = sample_position.try_add(sample_analyzer_vector)?;
    detector_position.try_sub(&reflection)
}

/// Scattering angle of the sample→analyzer direction from the beam, in degrees.
///
/// # Errors
/// Returns [`Error::TypeMismatch`] for non-vector input.
pub fn detector_geometric_a4(sample_analyzer_vector: &Variable) -> Result<Variable> {
    sample_analyzer_vector
        .map(Unit::RADIAN, |v: &Vector3<f64>| v.x.atan2(v.z))?
        .to_unit(&Unit::DEGREE)
}

/// Direction of the scattered neutron.
///
/// # Errors
/// Returns [`Error::TypeMismatch`] for non-vector input.
pub fn kf_hat(sample_analyzer_vector: &Variable) -> Result<Variable> {
    sample_analyzer_vector.normalized()
}

/// Magnitude of the Bragg reflected wavevector, in 1/Å.
///
/// With `l_sa`, `l_ad` the segment lengths and `l_diff` the length of their
/// sum, `cos 2θ = (l_diff² − l_sa² − l_ad²) / (2 l_sa l_ad)` and
/// `k_f = 2π / (d √(2 − 2 cos 2θ))`.
///
/// # Errors
/// Returns an error for wrong element types, incompatible units or shapes.
pub fn final_wavenumber(
    sample_analyzer_vector: &Variable,
    analyzer_detector_vector: &Variable,
    analyzer_dspacing: &Variable,
) -> Result<Variable> {
    let ad = in_same_unit(analyzer_detector_vector, sample_analyzer_vector)?;
    let d = analyzer_dspacing.to_unit(&Unit::ANGSTROM)?;
    zip3_with(
        sample_analyzer_vector,
        &ad,
        &d,
        Unit::INVERSE_ANGSTROM,
        |sa: &Vector3<f64>, ad: &Vector3<f64>, d: &f64| {
            let l_sa = sa.norm();
            let l_ad = ad.norm();
            let l_diff = (sa + ad).norm();
            let cos2theta = (l_diff * l_diff - l_sa * l_sa - l_ad * l_ad) / (2.0 * l_sa * l_ad);
            2.0 * std::f64::consts::PI / d / (2.0 - 2.0 * cos2theta).sqrt()
        },
    )
}

/// Neutron energy `ħ²k²/2mₙ` for a wavenumber, in meV.
///
/// # Errors
/// Returns an error for non-float input or a unit that is not inverse length.
pub fn energy_from_wavenumber(wavenumber: &Variable) -> Result<Variable> {
    let k = wavenumber.to_unit(&Unit::INVERSE_METER)?;
    let factor = HBAR * HBAR / 2.0 / NEUTRON_MASS / MILLI_ELECTRON_VOLT;
    k.map(Unit::MILLI_ELECTRON_VOLT, |k: &f64| factor * k * k)
}

/// Final energy from the final wavenumber, in meV.
///
/// # Errors
/// See [`energy_from_wavenumber`].
pub fn final_energy(final_wavenumber: &Variable) -> Result<Variable> {
    energy_from_wavenumber(final_wavenumber)
}

/// Final wavevector from direction and magnitude.
///
/// # Errors
/// Returns an error for wrong element types or shapes.
pub fn final_wavevector(kf_direction: &Variable, kf_magnitude: &Variable) -> Result<Variable> {
    kf_direction.try_mul(kf_magnitude)
}

/// Flight path length from the sample to each pixel via the analyzer.
///
/// # Errors
/// Returns an error for wrong element types, incompatible units or shapes.
pub fn secondary_flight_path_length(
    sample_analyzer_vector: &Variable,
    analyzer_detector_vector: &Variable,
) -> Result<Variable> {
    sample_analyzer_vector
        .norm()?
        .try_add(&analyzer_detector_vector.norm()?)
}

/// Most likely flight time from the sample to each pixel, in ms.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn secondary_flight_time(l2: &Variable, final_wavenumber: &Variable) -> Result<Variable> {
    let l2 = l2.to_unit(&Unit::METER)?;
    let k = final_wavenumber.to_unit(&Unit::INVERSE_METER)?;
    let time = zip_with(&l2, &k, Unit::SECOND, |l: &f64, k: &f64| {
        l / (k * HBAR / NEUTRON_MASS)
    })?;
    time.to_unit(&Unit::MILLISECOND)
}

/// Time at which each neutron most likely interacted with the sample.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn sample_frame_time(detector_time: &Variable, secondary_time: &Variable) -> Result<Variable> {
    detector_time.try_sub(secondary_time)
}

/// Nominal arc index from the final energy.
///
/// Arcs are 0.575 meV apart starting at 2.7 meV.
///
/// # Errors
/// Returns an error for non-float input or a non-energy unit.
pub fn arc_number(final_energy: &Variable) -> Result<Variable> {
    final_energy
        .to_unit(&Unit::MILLI_ELECTRON_VOLT)?
        .map(Unit::DIMENSIONLESS, |e: &f64| ((e - 2.7) / 0.575).round() as i64)
}

/// Coordinate graph of the secondary spectrometer for one analyzer.
///
/// The analyzer parameters are captured as constants. `detector_position`
/// aliases the data's `position` coordinate.
#[must_use]
pub fn secondary_spectrometer_graph(analyzer: &Analyzer) -> CoordTransformGraph {
    CoordTransformGraph::new()
        .with("analyzer_dspacing", Node::Constant(analyzer.dspacing.clone()))
        .with("analyzer_position", Node::Constant(analyzer.position.clone()))
        .with("analyzer_transform", Node::Constant(analyzer.transform.clone()))
        .with("detector_position", Node::alias("position"))
        .with(
            "sample_analyzer_vector",
            Node::quaternary(
                [
                    "sample_position",
                    "analyzer_position",
                    "analyzer_transform",
                    "detector_position",
                ],
                sample_analyzer_vector,
            ),
        )
        .with(
            "analyzer_detector_vector",
            Node::ternary(
                ["sample_position", "sample_analyzer_vector", "detector_position"],
                analyzer_detector_vector,
            ),
        )
        .with(
            "final_wavenumber",
            Node::ternary(
                [
                    "sample_analyzer_vector",
                    "analyzer_detector_vector",
                    "analyzer_dspacing",
                ],
                final_wavenumber,
            ),
        )
        .with("final_energy", Node::unary("final_wavenumber", final_energy))
        .with("kf_hat", Node::unary("sample_analyzer_vector", kf_hat))
        .with(
            "final_wavevector",
            Node::binary(["kf_hat", "final_wavenumber"], final_wavevector),
        )
        .with(
            "L2",
            Node::binary(
                ["sample_analyzer_vector", "analyzer_detector_vector"],
                secondary_flight_path_length,
            ),
        )
        .with(
            "secondary_flight_time",
            Node::binary(["L2", "final_wavenumber"], secondary_flight_time),
        )
        .with(
            "detector_geometric_a4",
            Node::unary("sample_analyzer_vector", detector_geometric_a4),
        )
}

/// Detector coordinates that no longer match the time after shifting to the sample.
pub const DETECTOR_POSITION_COORDS: [&str; 3] = ["position", "x_pixel_offset", "y_pixel_offset"];

/// Shift `event_time_offset` from the detector to the sample.
///
/// The per-pixel `secondary_flight_time` is subtracted and the result folded
/// into `[0, pulse_period)`. Detector position coordinates are dropped.
///
/// # Errors
/// Returns an error if the data is not binned or lacks the required coordinates.
pub fn move_time_to_sample(data: &DataArray, pulse_period: &Variable) -> Result<DataArray> {
    let eto = data.require_events()?.coord("event_time_offset")?.to_float()?;
    let flight = data.event_coord("secondary_flight_time")?;
    let offset = in_same_unit(&flight, &eto)?;
    let time = eto.try_sub(&offset)?.rem_euclid(pulse_period)?;
    let non_finite = time.count_non_finite();
    if non_finite > 0 {
        warn!("{non_finite} events have a non-finite time at the sample");
    }
    let mut out = data.clone();
    for name in DETECTOR_POSITION_COORDS {
        out.remove_coord(name);
    }
    out.events_mut()
        .ok_or_else(|| Error::Unsupported("move_time_to_sample requires events".to_string()))?
        .insert_coord("event_time_offset", time)?;
    debug!("Moved {} event times to the sample", out.event_count());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    fn rotation_about_y(degrees: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_scaled_axis(Vector3::y() * degrees.to_radians()),
        )
    }

    #[test]
    fn test_final_wavenumber_from_scattering_angle() {
        let d = Variable::scalar(3.355, Unit::ANGSTROM);
        // Straight through: cos 2θ = 1 is singular.
        let sa = Variable::vector(Vector3::new(0.0, 0.0, 1.0), Unit::METER);
        // 2θ = 60°: cos 2θ = 1/2 so k = 2π/d.
        let angle = 60f64.to_radians();
        let ad = Variable::vector(Vector3::new(angle.sin(), 0.0, angle.cos()), Unit::METER);
        let k = final_wavenumber(&sa, &ad, &d).unwrap();
        assert_relative_eq!(k.value::<f64>().unwrap(), 2.0 * std::f64::consts::PI / 3.355, max_relative = 1e-12);
        // Pure back scattering: cos 2θ = -1 so k = π/d.
        let back = Variable::vector(Vector3::new(0.0, 0.0, -1.0), Unit::METER);
        let k = final_wavenumber(&sa, &back, &d).unwrap();
        assert_relative_eq!(k.value::<f64>().unwrap(), std::f64::consts::PI / 3.355, max_relative = 1e-12);
    }

    #[test]
    fn test_final_energy_of_known_wavenumber() {
        // 1/Å corresponds to 2.0721 meV.
        let e = final_energy(&Variable::scalar(1.0, Unit::INVERSE_ANGSTROM)).unwrap();
        assert_eq!(e.unit(), Unit::MILLI_ELECTRON_VOLT);
        assert_relative_eq!(e.value::<f64>().unwrap(), 2.072_124, max_relative = 1e-5);
    }

    #[test]
    fn test_secondary_flight_time() {
        // k = 1/Å is v = 629.6 m/s.
        let t = secondary_flight_time(
            &Variable::scalar(629.622_4, Unit::METER),
            &Variable::scalar(1.0, Unit::INVERSE_ANGSTROM),
        )
        .unwrap();
        assert_eq!(t.unit(), Unit::MILLISECOND);
        assert_relative_eq!(t.value::<f64>().unwrap(), 1000.0, max_relative = 1e-5);
    }

    #[test]
    fn test_detector_geometric_a4() {
        let v = Variable::vectors_1d(
            "pixel",
            vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.5, 1.0)],
            Unit::METER,
        );
        let a4 = detector_geometric_a4(&v).unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(a4[0], 0.0);
        assert_relative_eq!(a4[1], 90.0);
        assert_relative_eq!(a4[2], -45.0);
    }

    #[test]
    fn test_arc_number() {
        let ef = Variable::floats_1d("arc", vec![2.7, 3.2, 3.8, 4.4, 5.0], Unit::MILLI_ELECTRON_VOLT);
        assert_eq!(arc_number(&ef).unwrap().to_vec::<i64>().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_graph_produces_final_energy_per_pixel() {
        let orientation = rotation_about_y(45.0);
        let analyzer = Analyzer::new(3.355, Unit::ANGSTROM, Vector3::z(), orientation);
        let detector = Vector3::z() + (orientation * orientation).transform_vector(&Vector3::z());
        let data = Variable::floats_1d("pixel", vec![0.0], Unit::COUNTS);
        let mut da = DataArray::dense(&data, None).unwrap();
        da.insert_coord("position", Variable::vectors_1d("pixel", vec![detector], Unit::METER))
            .unwrap();
        da.insert_coord("sample_position", Variable::vector(Vector3::zeros(), Unit::METER))
            .unwrap();
        let graph = secondary_spectrometer_graph(&analyzer);
        let out = graph
            .transform(&da, &["final_energy", "L2"], crate::graph::TransformOptions::default())
            .unwrap();
        // 90° scattering: k = 2π / (d √2).
        let k = 2.0 * std::f64::consts::PI / 3.355 / 2f64.sqrt();
        let expected = energy_from_wavenumber(&Variable::scalar(k, Unit::INVERSE_ANGSTROM))
            .unwrap()
            .value::<f64>()
            .unwrap();
        let ef = out.coord("final_energy").unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(ef[0], expected, max_relative = 1e-9);
        assert_relative_eq!(out.coord("L2").unwrap().to_vec::<f64>().unwrap()[0], 2.0, max_relative = 1e-12);
        assert!(out.coord("analyzer_dspacing").is_ok());
    }
}
