//! Inelastic coordinate conversions.
//!
//! Energy transfer and momentum transfer (lab and sample-table frame) per
//! event, and the graphs and transformations that attach them to data. The
//! elastic graph serves single-crystal diffraction on the Bragg peak monitor.

use crate::graph::{CoordTransformGraph, Node, TransformOptions};
use crate::primary::primary_spectrometer_graph;
use bifrost_core::constants::{MILLI_ELECTRON_VOLT, NEUTRON_MASS, PLANCK};
use bifrost_core::{
    in_same_unit, zip3_with, zip_with, DataArray, Result, Unit, Variable,
};
use log::debug;
use nalgebra::{UnitQuaternion, Vector3};
use std::f64::consts::PI;

/// Energy transfer `ΔE = Ei − Ef`, in the unit of `Ei`.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn energy_transfer(incident_energy: &Variable, final_energy: &Variable) -> Result<Variable> {
    incident_energy.try_sub(final_energy)
}

/// Wavelength `h t / (mₙ L)` of neutrons covering `length` in `tof`, in Å.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn wavelength_from_tof(tof: &Variable, length: &Variable) -> Result<Variable> {
    let t = tof.to_unit(&Unit::SECOND)?;
    let l = length.to_unit(&Unit::METER)?;
    zip_with(&t, &l, Unit::ANGSTROM, |t: &f64, l: &f64| {
        PLANCK * t / (NEUTRON_MASS * l) * 1e10
    })
}

/// Incident wavelength from the time of flight at the sample and `L1`.
///
/// # Errors
/// See [`wavelength_from_tof`].
pub fn incident_wavelength_from_tof(sample_tof: &Variable, l1: &Variable) -> Result<Variable> {
    wavelength_from_tof(sample_tof, l1)
}

/// Neutron energy `h² / (2 mₙ λ²)`, in meV.
///
/// # Errors
/// Returns an error for a unit that is not a length.
pub fn incident_energy_from_wavelength(incident_wavelength: &Variable) -> Result<Variable> {
    let factor = PLANCK * PLANCK / (2.0 * NEUTRON_MASS) / MILLI_ELECTRON_VOLT;
    incident_wavelength
        .to_unit(&Unit::METER)?
        .map(Unit::MILLI_ELECTRON_VOLT, |l: &f64| factor / (l * l))
}

/// Wavevector `2π/λ` along `beam`, in 1/Å.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn incident_wavevector_from_wavelength(
    incident_wavelength: &Variable,
    incident_beam: &Variable,
) -> Result<Variable> {
    let lambda = incident_wavelength.to_unit(&Unit::ANGSTROM)?;
    zip_with(
        &lambda,
        incident_beam,
        Unit::INVERSE_ANGSTROM,
        |l: &f64, b: &Vector3<f64>| b.normalize() * (2.0 * PI / l),
    )
}

/// Momentum transfer `Q = ki − kf` in the lab frame.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn lab_momentum_transfer_from_wavevectors(
    incident_wavevector: &Variable,
    final_wavevector: &Variable,
) -> Result<Variable> {
    in_same_unit(incident_wavevector, final_wavevector)?.try_sub(final_wavevector)
}

/// Momentum transfer in the lab frame from the incident energy.
///
/// `ki = (2π/h) b̂ √(2 mₙ Ei)`. Dimensions of `final_wavevector` come first
/// in the result, followed by those of `incident_energy`.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn lab_momentum_transfer_from_incident_energy(
    incident_energy: &Variable,
    incident_beam: &Variable,
    final_wavevector: &Variable,
) -> Result<Variable> {
    let kf = final_wavevector.to_unit(&Unit::INVERSE_ANGSTROM)?;
    let ei = incident_energy.to_unit(&Unit::JOULE)?;
    zip3_with(
        &kf,
        &ei,
        incident_beam,
        Unit::INVERSE_ANGSTROM,
        |kf: &Vector3<f64>, e: &f64, b: &Vector3<f64>| {
            let ki = 2.0 * PI / PLANCK * (2.0 * NEUTRON_MASS * e).sqrt() * 1e-10;
            b.normalize() * ki - kf
        },
    )
}

/// Rotate lab-frame momentum transfer into the sample-table frame.
///
/// The rotation is by `−a3` about the vertical axis `−g/|g|`. At `a3 = 0`
/// both frames coincide.
///
/// # Errors
/// Returns an error for non-angle `a3`, wrong element types or shapes.
pub fn rotate_to_sample_table_momentum_transfer(
    a3: &Variable,
    lab_momentum_transfer: &Variable,
    gravity: &Variable,
) -> Result<Variable> {
    let a3 = a3.to_unit(&Unit::RADIAN)?;
    zip3_with(
        lab_momentum_transfer,
        &a3,
        gravity,
        lab_momentum_transfer.unit(),
        |q: &Vector3<f64>, a3: &f64, g: &Vector3<f64>| {
            let vertical = -g / g.norm();
            UnitQuaternion::from_scaled_axis(vertical * -a3) * q
        },
    )
}

/// Orthonormal lab axes: z along the beam, y against gravity, x completing
/// the right-handed system.
///
/// # Errors
/// Returns an error for wrong element types or shapes.
pub fn beam_aligned_unit_vectors(incident_beam: &Variable, gravity: &Variable) -> Result<[Variable; 3]> {
    let z = incident_beam.normalized()?;
    let y = gravity.map(Unit::DIMENSIONLESS, |g: &Vector3<f64>| -g.normalize())?;
    let x = zip_with(&y, &z, Unit::DIMENSIONLESS, |y: &Vector3<f64>, z: &Vector3<f64>| {
        y.cross(z)
    })?;
    Ok([x, y, z])
}

/// Component of vectors along a unit axis.
///
/// # Errors
/// Returns an error for wrong element types or shapes.
pub fn component_along(vectors: &Variable, axis: &Variable) -> Result<Variable> {
    vectors.dot(axis)
}

/// Graph of incident, energy and momentum transfer coordinates at the sample.
#[must_use]
pub fn inelastic_coordinate_transformation_graph_at_sample(gravity: Vector3<f64>) -> CoordTransformGraph {
    let axis = |index: usize| {
        Node::unary("sample_table_momentum_transfer", move |q| q.component(index))
    };
    CoordTransformGraph::new()
        .with(
            "energy_transfer",
            Node::binary(["incident_energy", "final_energy"], energy_transfer),
        )
        .with(
            "incident_energy",
            Node::unary("incident_wavelength", incident_energy_from_wavelength),
        )
        .with(
            "incident_wavelength",
            Node::binary(["sample_tof", "L1"], incident_wavelength_from_tof),
        )
        .with(
            "incident_wavevector",
            Node::binary(
                ["incident_wavelength", "incident_beam"],
                incident_wavevector_from_wavelength,
            ),
        )
        .with(
            "gravity",
            Node::Constant(Variable::vector(gravity, Unit::METER_PER_SECOND_SQUARED)),
        )
        .with(
            "lab_momentum_transfer",
            Node::binary(
                ["incident_wavevector", "final_wavevector"],
                lab_momentum_transfer_from_wavevectors,
            ),
        )
        .with(
            "sample_table_momentum_transfer",
            Node::ternary(
                ["a3", "lab_momentum_transfer", "gravity"],
                rotate_to_sample_table_momentum_transfer,
            ),
        )
        .with("Qx", axis(0))
        .with("Qy", axis(1))
        .with("Qz", axis(2))
}

/// Attach incident energy and wavelength, keeping what binning needs.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn add_incident_energy(data: &DataArray, graph: &CoordTransformGraph) -> Result<DataArray> {
    let out = graph.transform(
        data,
        &[
            "incident_energy",
            "incident_wavelength",
            "a3",
            "a4",
            "final_energy",
            "final_wavevector",
        ],
        TransformOptions::targets_only(),
    )?;
    debug!("Added incident energy to {} events", out.event_count());
    Ok(out)
}

/// Attach energy transfer and sample-table momentum transfer.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn add_inelastic_coordinates(data: &DataArray, graph: &CoordTransformGraph) -> Result<DataArray> {
    let out = graph.transform(
        data,
        &["energy_transfer", "sample_table_momentum_transfer", "a3", "a4"],
        TransformOptions::targets_only(),
    )?;
    debug!("Added inelastic coordinates to {} events", out.event_count());
    Ok(out)
}

/// Attach per-pixel spectrometer coordinates from the merged primary and
/// secondary graphs.
///
/// Adds `final_energy`, `final_wavevector`, `incident_beam`, `L1` and
/// `secondary_flight_time`; inputs are kept.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn add_spectrometer_coords(
    data: &DataArray,
    primary_graph: &CoordTransformGraph,
    secondary_graph: &CoordTransformGraph,
) -> Result<DataArray> {
    let graph = primary_graph.clone().merge(secondary_graph);
    graph.transform(
        data,
        &[
            "final_energy",
            "final_wavevector",
            "incident_beam",
            "L1",
            "secondary_flight_time",
        ],
        TransformOptions::default()
            .keep_intermediate(false)
            .keep_aliases(false),
    )
}

/// Graph from monitor time of flight to wavelength.
#[must_use]
pub fn monitor_coordinate_transformation_graph(source_position: &Variable) -> CoordTransformGraph {
    CoordTransformGraph::new()
        .with("source_position", Node::Constant(source_position.clone()))
        .with(
            "Ltotal",
            Node::binary(["position", "source_position"], |position, source| {
                position.try_sub(source)?.norm()
            }),
        )
        .with("wavelength", Node::binary(["tof", "Ltotal"], wavelength_from_tof))
        .with("incident_wavelength", Node::alias("wavelength"))
}

/// Attach `incident_wavelength` to a monitor with a `tof` coordinate.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn add_monitor_wavelength_coord(monitor: &DataArray, graph: &CoordTransformGraph) -> Result<DataArray> {
    graph.transform(
        monitor,
        &["incident_wavelength"],
        TransformOptions::default()
            .keep_intermediate(false)
            .keep_aliases(false),
    )
}

/// Elastic momentum transfer `Q = (2π/λ) (b̂ᵢ − b̂ₛ)` in 1/Å.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn elastic_momentum_transfer(
    wavelength: &Variable,
    incident_beam: &Variable,
    scattered_beam: &Variable,
) -> Result<Variable> {
    let lambda = wavelength.to_unit(&Unit::ANGSTROM)?;
    zip3_with(
        &lambda,
        incident_beam,
        scattered_beam,
        Unit::INVERSE_ANGSTROM,
        |l: &f64, incident: &Vector3<f64>, scattered: &Vector3<f64>| {
            (incident.normalize() - scattered.normalize()) * (2.0 * PI / l)
        },
    )
}

/// Graph from time of flight over the full path to sample-table Q.
///
/// Extends the primary beamline graph by the straight scattered path
/// `position − sample_position`. Needs `source_position`, `sample_position`,
/// `position`, `tof` and `a3`.
#[must_use]
pub fn single_crystal_coordinate_transformation_graph(gravity: Vector3<f64>) -> CoordTransformGraph {
    primary_spectrometer_graph()
        .with(
            "scattered_beam",
            Node::binary(["position", "sample_position"], |position, sample| {
                position.try_sub(sample)
            }),
        )
        .with("L2", Node::unary("scattered_beam", Variable::norm))
        .with("Ltotal", Node::binary(["L1", "L2"], |l1, l2| l1.try_add(l2)))
        .with("wavelength", Node::binary(["tof", "Ltotal"], wavelength_from_tof))
        .with(
            "Q_vec",
            Node::ternary(
                ["wavelength", "incident_beam", "scattered_beam"],
                elastic_momentum_transfer,
            ),
        )
        .with("lab_momentum_transfer", Node::alias("Q_vec"))
        .with(
            "gravity",
            Node::Constant(Variable::vector(gravity, Unit::METER_PER_SECOND_SQUARED)),
        )
        .with(
            "sample_table_momentum_transfer",
            Node::ternary(
                ["a3", "lab_momentum_transfer", "gravity"],
                rotate_to_sample_table_momentum_transfer,
            ),
        )
}

/// Attach the total flight path `Ltotal`, keeping the inputs.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn add_total_path_length(data: &DataArray, graph: &CoordTransformGraph) -> Result<DataArray> {
    graph.transform(
        data,
        &["Ltotal"],
        TransformOptions::default()
            .keep_intermediate(false)
            .keep_aliases(false),
    )
}

/// Replace time of flight by sample-table momentum transfer, keeping `a3`.
///
/// # Errors
/// Returns planning or evaluation errors.
pub fn convert_tof_to_q(data: &DataArray, graph: &CoordTransformGraph) -> Result<DataArray> {
    let out = graph.transform(
        data,
        &["a3", "sample_table_momentum_transfer"],
        TransformOptions::targets_only(),
    )?;
    debug!("Converted {} events from tof to Q", out.event_count());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rotation_identity_at_zero_a3() {
        let q = Variable::vectors_1d(
            "event",
            vec![Vector3::new(1.0, 2.0, 3.0), Vector3::new(-0.5, 0.0, 0.25)],
            Unit::INVERSE_ANGSTROM,
        );
        let gravity = Variable::vector(Vector3::new(0.0, -9.81, 0.0), Unit::METER_PER_SECOND_SQUARED);
        let rotated =
            rotate_to_sample_table_momentum_transfer(&Variable::scalar(0.0, Unit::DEGREE), &q, &gravity)
                .unwrap();
        for (a, b) in rotated
            .to_vec::<Vector3<f64>>()
            .unwrap()
            .iter()
            .zip(q.to_vec::<Vector3<f64>>().unwrap())
        {
            assert_relative_eq!((a - b).norm(), 0.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_rotation_by_quarter_turn() {
        // Coordinates rotate by -90° about +y, which sends z to -x.
        let q = Variable::vector(Vector3::new(0.0, 0.0, 1.0), Unit::INVERSE_ANGSTROM);
        let gravity = Variable::vector(Vector3::new(0.0, -9.81, 0.0), Unit::METER_PER_SECOND_SQUARED);
        let rotated =
            rotate_to_sample_table_momentum_transfer(&Variable::scalar(90.0, Unit::DEGREE), &q, &gravity)
                .unwrap()
                .value::<Vector3<f64>>()
                .unwrap();
        assert_relative_eq!(rotated.x, -1.0, epsilon = 1e-12);
        assert_relative_eq!(rotated.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_wavelength_and_energy() {
        // 1000 m/s over 10 m.
        let lambda = incident_wavelength_from_tof(
            &Variable::scalar(10.0, Unit::MILLISECOND),
            &Variable::scalar(10.0, Unit::METER),
        )
        .unwrap();
        assert_relative_eq!(lambda.value::<f64>().unwrap(), 3.956_034, max_relative = 1e-6);
        let energy = incident_energy_from_wavelength(&lambda).unwrap();
        // ½ mₙ v² for v = 1000 m/s.
        let expected = 0.5 * NEUTRON_MASS * 1e6 / MILLI_ELECTRON_VOLT;
        assert_relative_eq!(energy.value::<f64>().unwrap(), expected, max_relative = 1e-9);
    }

    #[test]
    fn test_momentum_transfer_paths_agree() {
        let beam = Variable::vector(Vector3::new(0.0, 0.0, 162.0), Unit::METER);
        let lambda = Variable::scalar(4.0, Unit::ANGSTROM);
        let kf = Variable::vector(Vector3::new(0.3, 0.0, 1.1), Unit::INVERSE_ANGSTROM);
        let ki = incident_wavevector_from_wavelength(&lambda, &beam).unwrap();
        let from_ki = lab_momentum_transfer_from_wavevectors(&ki, &kf).unwrap();
        let ei = incident_energy_from_wavelength(&lambda).unwrap();
        let from_ei = lab_momentum_transfer_from_incident_energy(&ei, &beam, &kf).unwrap();
        let a = from_ki.value::<Vector3<f64>>().unwrap();
        let b = from_ei.value::<Vector3<f64>>().unwrap();
        assert_relative_eq!((a - b).norm(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(a.z, 2.0 * PI / 4.0 - 1.1, max_relative = 1e-12);
    }

    #[test]
    fn test_energy_transfer_converts_units() {
        let ei = Variable::scalar(5.0, Unit::MILLI_ELECTRON_VOLT);
        let ef = Variable::scalar(2.0 * MILLI_ELECTRON_VOLT, Unit::JOULE);
        let de = energy_transfer(&ei, &ef).unwrap();
        assert_eq!(de.unit(), Unit::MILLI_ELECTRON_VOLT);
        assert_relative_eq!(de.value::<f64>().unwrap(), 3.0, max_relative = 1e-12);
    }

    /// One pixel at 90° in the horizontal plane, one event per a3 setting.
    fn bragg_monitor_events() -> DataArray {
        let mut events = bifrost_core::EventTable::unit_weights(vec![0, 1]);
        let tof = 4.0 * 163.0 / 3.956_034_0 * 1e6;
        events
            .insert_coord(
                "tof",
                Variable::floats_1d(bifrost_core::EVENT_DIM, vec![tof, tof], Unit::NANOSECOND),
            )
            .unwrap();
        let mut da = DataArray::binned(&["a3"], &[2], events, Unit::COUNTS).unwrap();
        da.insert_coord("a3", Variable::floats_1d("a3", vec![0.0, 90.0], Unit::DEGREE))
            .unwrap();
        da.insert_coord("position", Variable::vector(Vector3::new(1.0, 0.0, 162.0), Unit::METER))
            .unwrap();
        da
    }

    fn bragg_monitor_graph() -> CoordTransformGraph {
        single_crystal_coordinate_transformation_graph(Vector3::new(0.0, -9.81, 0.0))
            .with("source_position", Node::Constant(Variable::vector(Vector3::zeros(), Unit::METER)))
            .with(
                "sample_position",
                Node::Constant(Variable::vector(Vector3::new(0.0, 0.0, 162.0), Unit::METER)),
            )
    }

    #[test]
    fn test_elastic_q_in_sample_table_frame() {
        let graph = bragg_monitor_graph();
        let with_ltotal = add_total_path_length(&bragg_monitor_events(), &graph).unwrap();
        let ltotal = with_ltotal.coord("Ltotal").unwrap().value::<f64>().unwrap();
        assert_relative_eq!(ltotal, 163.0, max_relative = 1e-12);

        let out = convert_tof_to_q(&with_ltotal, &graph).unwrap();
        assert!(out.has_coord("a3"));
        assert!(!out.events().unwrap().coords.contains_key("tof"));
        let q = out
            .event_coord("sample_table_momentum_transfer")
            .unwrap()
            .to_vec::<Vector3<f64>>()
            .unwrap();
        // 4 Å, scattered along +x: Q = k (ẑ − x̂).
        let k = 2.0 * PI / 4.0;
        assert_relative_eq!(q[0], Vector3::new(-k, 0.0, k), max_relative = 1e-6);
        // At a3 = 90° the sample table turns z into -x and x into z.
        assert_relative_eq!(q[1], Vector3::new(-k, 0.0, -k), max_relative = 1e-6);
        assert_relative_eq!(q[0].norm(), q[1].norm(), max_relative = 1e-12);
    }

    #[test]
    fn test_beam_aligned_axes() {
        let [x, y, z] = beam_aligned_unit_vectors(
            &Variable::vector(Vector3::new(0.0, 0.0, 2.0), Unit::METER),
            &Variable::vector(Vector3::new(0.0, -9.81, 0.0), Unit::METER_PER_SECOND_SQUARED),
        )
        .unwrap();
        assert_eq!(x.value::<Vector3<f64>>().unwrap(), Vector3::x());
        assert_eq!(y.value::<Vector3<f64>>().unwrap(), Vector3::y());
        assert_eq!(z.value::<Vector3<f64>>().unwrap(), Vector3::z());
        let q = Variable::vector(Vector3::new(1.0, 2.0, 3.0), Unit::INVERSE_ANGSTROM);
        assert_relative_eq!(component_along(&q, &y).unwrap().value::<f64>().unwrap(), 2.0);
    }
}
