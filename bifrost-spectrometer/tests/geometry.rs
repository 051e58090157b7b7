use approx::assert_relative_eq;
use bifrost_core::{Unit, Variable};
use bifrost_spectrometer::secondary::{
    analyzer_detector_vector, detector_geometric_a4, kf_hat, sample_analyzer_vector,
};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

fn analyzer_orientation() -> Variable {
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::y() * 45f64.to_radians());
    Variable::transform(Isometry3::from_parts(Translation3::identity(), rotation), Unit::METER)
}

fn vectors(var: &Variable) -> Vec<Vector3<f64>> {
    var.to_vec::<Vector3<f64>>().unwrap()
}

#[test]
fn test_out_of_plane_offset_is_shared_by_path_length() {
    let sample = Variable::vector(Vector3::zeros(), Unit::METER);
    let analyzer = Variable::vector(Vector3::z(), Unit::METER);
    let detectors = Variable::vectors_1d(
        "pixel",
        vec![
            Vector3::new(1.0, -0.1, 1.0),
            Vector3::new(1.0, 0.0, 1.0),
            Vector3::new(1.0, 0.2, 1.0),
        ],
        Unit::METER,
    );
    let sa = sample_analyzer_vector(&sample, &analyzer, &analyzer_orientation(), &detectors).unwrap();
    let ad = analyzer_detector_vector(&sample, &sa, &detectors).unwrap();
    for ((sa, ad), height) in vectors(&sa).iter().zip(vectors(&ad)).zip([-0.1, 0.0, 0.2]) {
        // Both segments are one metre long in the scattering plane.
        assert_relative_eq!(sa.y, height / 2.0, epsilon = 1e-12);
        assert_relative_eq!(ad.y, height / 2.0, epsilon = 1e-12);
        assert_relative_eq!(sa.z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(ad.x, 1.0, epsilon = 1e-12);
    }
}

/// Detector pixels at `(tube, wire)` offsets from the nominal position one
/// metre from the analyzer, reflected by the 45° analyzer.
fn offset_detectors(offsets: &[(f64, f64)]) -> Variable {
    let mirror = UnitQuaternion::from_scaled_axis(Vector3::y() * 90f64.to_radians());
    let positions = offsets
        .iter()
        .map(|&(tube, wire)| Vector3::z() + mirror * Vector3::new(tube, wire, 1.0))
        .collect();
    Variable::vectors_1d("pixel", positions, Unit::METER)
}

#[test]
fn test_in_plane_offset_keeps_nominal_vector() {
    let sample = Variable::vector(Vector3::zeros(), Unit::METER);
    let analyzer = Variable::vector(Vector3::z(), Unit::METER);
    let detectors = offset_detectors(&[(-0.1, 0.0), (0.0, 0.0), (0.1, 0.0)]);
    let sa = sample_analyzer_vector(&sample, &analyzer, &analyzer_orientation(), &detectors).unwrap();
    for sa in vectors(&sa) {
        assert_relative_eq!(sa, Vector3::z(), epsilon = 1e-12);
    }
}

#[test]
fn test_combined_offsets_shrink_out_of_plane_share() {
    let sample = Variable::vector(Vector3::zeros(), Unit::METER);
    let analyzer = Variable::vector(Vector3::z(), Unit::METER);
    let offsets: Vec<(f64, f64)> = [-0.1, 0.0, 0.1]
        .iter()
        .flat_map(|&tube| [-0.1, 0.0, 0.1].map(|wire| (tube, wire)))
        .collect();
    let detectors = offset_detectors(&offsets);
    let sa = sample_analyzer_vector(&sample, &analyzer, &analyzer_orientation(), &detectors).unwrap();
    for (sa, (tube, wire)) in vectors(&sa).iter().zip(offsets) {
        let share = wire / (1.0 + (1.0 + tube * tube).sqrt());
        assert_relative_eq!(*sa, Vector3::new(0.0, share, 1.0), epsilon = 1e-12);
    }
}

#[test]
fn test_scattered_direction_is_a_unit_vector() {
    let sa = Variable::vectors_1d(
        "pixel",
        vec![Vector3::new(0.3, 0.1, 1.2), Vector3::new(-2.0, 0.0, 0.5)],
        Unit::MILLIMETER,
    );
    let directions = kf_hat(&sa).unwrap();
    for k in vectors(&directions) {
        assert_relative_eq!(k.norm(), 1.0, epsilon = 1e-12);
    }
}

#[test]
fn test_geometric_a4_is_measured_from_the_beam() {
    let sa = Variable::vectors_1d(
        "pixel",
        vec![Vector3::new(1.0, 0.0, 1.0), Vector3::new(-1.0, 0.3, 0.0)],
        Unit::METER,
    );
    let a4 = detector_geometric_a4(&sa).unwrap();
    assert_eq!(a4.unit(), Unit::DEGREE);
    let a4 = a4.to_vec::<f64>().unwrap();
    assert_relative_eq!(a4[0], 45.0, epsilon = 1e-12);
    assert_relative_eq!(a4[1], -90.0, epsilon = 1e-12);
}
