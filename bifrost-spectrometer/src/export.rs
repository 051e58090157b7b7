//! Pixel data for SQW files.
//!
//! Events are histogrammed by detector, instrument setting and incident
//! energy. Every histogram cell is one observation with momentum and energy
//! transfer computed at the bin centre. The observations are ordered by the
//! image bins `(u1, u2, u3, u4) = (Qx, Qy, Qz, ΔE)` with `u4` varying
//! slowest, and flattened into `f32` rows.

#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use crate::conversion::{
    energy_transfer, lab_momentum_transfer_from_incident_energy,
    rotate_to_sample_table_momentum_transfer,
};
use crate::histogram::{bin_index, resolve_edges, BinSpec};
use bifrost_core::{DataArray, Error, Result, Unit, Variable};
use log::{info, warn};
use nalgebra::Vector3;
use ndarray::{Array4, ArrayD};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of columns of a pixel row.
pub const PIXEL_COLUMNS: usize = 9;

const OBSERVATION_DIM: &str = "observation";

/// Number of image bins along `u1..u4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SqwBinSizes {
    pub u1: usize,
    pub u2: usize,
    pub u3: usize,
    pub u4: usize,
}

impl Default for SqwBinSizes {
    fn default() -> Self {
        Self {
            u1: 50,
            u2: 50,
            u3: 50,
            u4: 50,
        }
    }
}

impl SqwBinSizes {
    fn as_array(self) -> [usize; 4] {
        [self.u1, self.u2, self.u3, self.u4]
    }
}

/// SQW pixel rows `[u1, u2, u3, u4, irun, idet, ien, signal, error²]`.
///
/// `u1..u3` are in 1/Å and `u4` in meV. `irun`, `idet` and `ien` are
/// one-based.
#[derive(Debug, Clone, PartialEq)]
pub struct SqwPixelBuffer {
    pub rows: Vec<[f32; PIXEL_COLUMNS]>,
    /// Observations per image bin, shaped `(u1, u2, u3, u4)`.
    pub counts: Array4<usize>,
    /// Image bin edges along `u1..u4`.
    pub edges: [Vec<f64>; 4],
    /// Image bin `(u1, u2, u3, u4)` of every row, in row order.
    pub image_index: Vec<[usize; 4]>,
}

impl SqwPixelBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Build SQW pixel data from normalized events.
///
/// `events` must be binned with dimensions `(*logical, a3, a4)`, carry the
/// event coordinate `incident_energy` and the coordinates `final_energy`,
/// `final_wavevector`, `incident_beam`, `detector_number`, `a3` and `a4`.
///
/// # Errors
/// Returns [`Error::Unsupported`] if `a4` is not constant and errors for
/// missing coordinates or empty energy ranges.
pub fn sqw_pixel_buffer(
    events: &DataArray,
    energy_bins: &BinSpec,
    bin_sizes: SqwBinSizes,
    gravity: Vector3<f64>,
) -> Result<SqwPixelBuffer> {
    if !events.coord("a4")?.is_uniform() {
        return Err(Error::Unsupported(
            "a4 must be constant for all events".to_string(),
        ));
    }
    let (n3, n4) = match (events.size_of("a3"), events.size_of("a4")) {
        (Some(n3), Some(n4)) => (n3, n4),
        _ => {
            return Err(Error::ShapeMismatch(format!(
                "events must be grouped by a3 and a4, got {:?}",
                events.dims()
            )))
        }
    };
    let table = events.require_events()?;
    let n_bins = events.n_bins();

    let ei = events
        .event_coord("incident_energy")?
        .to_unit(&Unit::MILLI_ELECTRON_VOLT)?
        .to_vec::<f64>()?;
    let keep = vec![true; ei.len()];
    let ei_coord = Variable::floats_1d("incident_energy", ei.clone(), Unit::MILLI_ELECTRON_VOLT);
    let ei_edges = resolve_edges("incident_energy", energy_bins, &ei_coord, &ei, &keep)?;
    let n_energy = ei_edges.len() - 1;

    let mut signal = vec![0.0; n_bins * n_energy];
    let mut error2 = vec![0.0; n_bins * n_energy];
    for (i, (&bin, &e)) in table.bin.iter().zip(&ei).enumerate() {
        if let Some(j) = bin_index(&ei_edges, e) {
            signal[bin * n_energy + j] += table.weights[i];
            error2[bin * n_energy + j] += table.variances.as_ref().map_or(0.0, |v| v[i]);
        }
    }

    // One observation per (bin, energy) cell.
    let n_obs = n_bins * n_energy;
    let cell_bin: Vec<usize> = (0..n_obs).map(|k| k / n_energy).collect();
    let centers: Vec<f64> = (0..n_obs)
        .map(|k| {
            let j = k % n_energy;
            0.5 * (ei_edges[j] + ei_edges[j + 1])
        })
        .collect();
    let gather = |name: &str| {
        events
            .coord(name)?
            .gather(events.dims(), events.shape(), &cell_bin, OBSERVATION_DIM)
    };
    let incident_energy = Variable::floats_1d(OBSERVATION_DIM, centers, Unit::MILLI_ELECTRON_VOLT);
    let q_lab = lab_momentum_transfer_from_incident_energy(
        &incident_energy,
        &gather("incident_beam")?,
        &gather("final_wavevector")?,
    )?;
    let gravity = Variable::vector(gravity, Unit::METER_PER_SECOND_SQUARED);
    let q = rotate_to_sample_table_momentum_transfer(&gather("a3")?, &q_lab, &gravity)?
        .to_unit(&Unit::INVERSE_ANGSTROM)?
        .to_vec::<Vector3<f64>>()?;
    let delta_e = energy_transfer(&incident_energy, &gather("final_energy")?)?
        .to_unit(&Unit::MILLI_ELECTRON_VOLT)?
        .to_vec::<f64>()?;
    let detector_number = gather("detector_number")?.to_float()?.to_vec::<f64>()?;

    let u: Vec<[f64; 4]> = q
        .iter()
        .zip(&delta_e)
        .map(|(q, e)| [q.x, q.y, q.z, *e])
        .collect();
    let finite: Vec<bool> = u.iter().map(|u| u.iter().all(|x| x.is_finite())).collect();
    let n_dropped = finite.iter().filter(|f| !**f).count();
    if n_dropped > 0 {
        warn!("Dropping {n_dropped} observations with non-finite coordinates");
    }
    let sizes = bin_sizes.as_array();
    let mut edges: [Vec<f64>; 4] = Default::default();
    for (axis, n) in sizes.iter().enumerate() {
        let column: Vec<f64> = u.iter().map(|u| u[axis]).collect();
        let name = format!("u{}", axis + 1);
        let coord = Variable::floats_1d(&name, column.clone(), Unit::DIMENSIONLESS);
        edges[axis] = resolve_edges(&name, &BinSpec::Count(*n), &coord, &column, &finite)?;
    }

    let mut counts = Array4::<usize>::zeros((sizes[0], sizes[1], sizes[2], sizes[3]));
    let mut ordered: Vec<([usize; 4], usize)> = Vec::with_capacity(n_obs);
    let mut outside = 0;
    for (k, u) in u.iter().enumerate() {
        if !finite[k] {
            continue;
        }
        let mut index = [0; 4];
        let inside = (0..4).all(|axis| match image_bin(&edges[axis], u[axis]) {
            Some(i) => {
                index[axis] = i;
                true
            }
            None => false,
        });
        if !inside {
            outside += 1;
            continue;
        }
        counts[index] += 1;
        ordered.push(([index[3], index[2], index[1], index[0]], k));
    }
    if outside > 0 {
        warn!("Dropping {outside} observations outside the image range");
    }
    ordered.sort_by_key(|(key, _)| *key);
    let image_index: Vec<[usize; 4]> = ordered
        .iter()
        .map(|([i4, i3, i2, i1], _)| [*i1, *i2, *i3, *i4])
        .collect();

    let rows: Vec<[f32; PIXEL_COLUMNS]> = ordered
        .iter()
        .map(|&(_, k)| {
            let bin = cell_bin[k];
            let setting = bin % (n3 * n4);
            let (i3, i4) = (setting / n4, setting % n4);
            let irun = i3 + i4 * n3 + 1;
            let ien = k % n_energy + 1;
            [
                u[k][0] as f32,
                u[k][1] as f32,
                u[k][2] as f32,
                u[k][3] as f32,
                irun as f32,
                (detector_number[k] + 1.0) as f32,
                ien as f32,
                signal[k] as f32,
                error2[k] as f32,
            ]
        })
        .collect();
    info!(
        "Prepared {} SQW pixels from {} events in {} runs",
        rows.len(),
        table.len(),
        n3 * n4
    );
    Ok(SqwPixelBuffer {
        rows,
        counts,
        edges,
        image_index,
    })
}

/// Image bin of `x`; the top edge belongs to the last bin.
fn image_bin(edges: &[f64], x: f64) -> Option<usize> {
    match bin_index(edges, x) {
        Some(i) => Some(i),
        None if edges.last() == Some(&x) => Some(edges.len() - 2),
        None => None,
    }
}

/// Mean signal per image bin, NaN for empty bins.
#[must_use]
pub fn image_mean(buffer: &SqwPixelBuffer) -> ArrayD<f64> {
    let mut sum = ArrayD::<f64>::zeros(buffer.counts.shape());
    for (row, index) in buffer.rows.iter().zip(&buffer.image_index) {
        sum[index.as_slice()] += f64::from(row[7]);
    }
    ndarray::Zip::from(&mut sum)
        .and(buffer.counts.view().into_dyn())
        .for_each(|s, &n| *s = if n == 0 { f64::NAN } else { *s / n as f64 });
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use bifrost_core::{EventTable, EVENT_DIM};

    /// Two detectors, two a3 settings, one a4.
    fn normalized_events() -> DataArray {
        let bins = vec![0, 0, 1, 2, 3, 3, 3];
        let ei = vec![5.0, 5.5, 6.0, 5.1, 6.9, 6.8, 5.2];
        let mut table = EventTable::unit_weights(bins);
        table
            .insert_coord("incident_energy", Variable::floats_1d(EVENT_DIM, ei, Unit::MILLI_ELECTRON_VOLT))
            .unwrap();
        let mut da = DataArray::binned(&["detector", "a3", "a4"], &[2, 2, 1], table, Unit::COUNTS).unwrap();
        da.insert_coord("detector_number", Variable::ints_1d("detector", vec![10, 11], Unit::DIMENSIONLESS))
            .unwrap();
        da.insert_coord("final_energy", Variable::floats_1d("detector", vec![2.7, 3.2], Unit::MILLI_ELECTRON_VOLT))
            .unwrap();
        da.insert_coord(
            "final_wavevector",
            Variable::vectors_1d(
                "detector",
                vec![Vector3::new(1.1, 0.0, 0.2), Vector3::new(-1.2, 0.0, 0.3)],
                Unit::INVERSE_ANGSTROM,
            ),
        )
        .unwrap();
        da.insert_coord("incident_beam", Variable::vector(Vector3::new(0.0, 0.0, 160.0), Unit::METER))
            .unwrap();
        da.insert_coord("a3", Variable::floats_1d("a3", vec![0.0, 10.0], Unit::DEGREE))
            .unwrap();
        da.insert_coord("a4", Variable::floats_1d("a4", vec![30.0], Unit::DEGREE))
            .unwrap();
        da
    }

    fn energy_bins() -> BinSpec {
        BinSpec::linspace("incident_energy", 5.0, 7.0, 2, Unit::MILLI_ELECTRON_VOLT)
    }

    #[test]
    fn test_rows_cover_every_cell_and_conserve_signal() {
        let buffer = sqw_pixel_buffer(
            &normalized_events(),
            &energy_bins(),
            SqwBinSizes { u1: 3, u2: 2, u3: 3, u4: 4 },
            Vector3::new(0.0, -9.81, 0.0),
        )
        .unwrap();
        // 2 detectors x 2 settings x 2 energies.
        assert_eq!(buffer.len(), 8);
        let signal: f32 = buffer.rows.iter().map(|r| r[7]).sum();
        assert_relative_eq!(signal, 7.0);
        let error2: f32 = buffer.rows.iter().map(|r| r[8]).sum();
        assert_relative_eq!(error2, 7.0);
        assert_eq!(buffer.counts.sum(), 8);
    }

    #[test]
    fn test_indices_are_one_based() {
        let buffer = sqw_pixel_buffer(
            &normalized_events(),
            &energy_bins(),
            SqwBinSizes::default(),
            Vector3::new(0.0, -9.81, 0.0),
        )
        .unwrap();
        let mut runs: Vec<f32> = buffer.rows.iter().map(|r| r[4]).collect();
        runs.sort_by(f32::total_cmp);
        runs.dedup();
        assert_eq!(runs, vec![1.0, 2.0]);
        assert!(buffer.rows.iter().all(|r| r[5] == 11.0 || r[5] == 12.0));
        assert!(buffer.rows.iter().all(|r| r[6] == 1.0 || r[6] == 2.0));
        // Energy transfer is Ei - Ef at the bin centre.
        let first_detector = buffer
            .rows
            .iter()
            .find(|r| r[5] == 11.0 && r[6] == 1.0)
            .unwrap();
        assert_relative_eq!(first_detector[3], 5.5 - 2.7, max_relative = 1e-6);
    }

    #[test]
    fn test_rows_are_ordered_by_energy_transfer_bin() {
        let buffer = sqw_pixel_buffer(
            &normalized_events(),
            &energy_bins(),
            SqwBinSizes { u1: 1, u2: 1, u3: 1, u4: 4 },
            Vector3::new(0.0, -9.81, 0.0),
        )
        .unwrap();
        assert_eq!(buffer.image_index.len(), buffer.len());
        let bins: Vec<usize> = buffer.image_index.iter().map(|i| i[3]).collect();
        assert!(bins.windows(2).all(|w| w[0] <= w[1]));
        // The lowest energy transfer sits on the first edge and stays in bin 0.
        assert_eq!(bins[0], 0);
        let mean = image_mean(&buffer);
        assert_eq!(mean.shape(), [1, 1, 1, 4]);
    }

    #[test]
    fn test_image_mean_agrees_with_counts() {
        let buffer = sqw_pixel_buffer(
            &normalized_events(),
            &energy_bins(),
            SqwBinSizes { u1: 1, u2: 1, u3: 1, u4: 4 },
            Vector3::new(0.0, -9.81, 0.0),
        )
        .unwrap();
        let mean = image_mean(&buffer);
        for bin in 0..4 {
            let rows: Vec<f64> = buffer
                .rows
                .iter()
                .zip(&buffer.image_index)
                .filter(|(_, index)| index[3] == bin)
                .map(|(row, _)| f64::from(row[7]))
                .collect();
            assert_eq!(rows.len(), buffer.counts[[0, 0, 0, bin]]);
            if rows.is_empty() {
                assert!(mean[[0, 0, 0, bin]].is_nan());
            } else {
                let expected = rows.iter().sum::<f64>() / rows.len() as f64;
                assert_relative_eq!(mean[[0, 0, 0, bin]], expected);
            }
        }
        assert_eq!(buffer.counts.sum(), buffer.len());
    }

    #[test]
    fn test_image_bin_edges() {
        let edges = [2.3, 2.4, 2.5];
        assert_eq!(image_bin(&edges, 2.3), Some(0));
        assert_eq!(image_bin(&edges, 2.5), Some(1));
        assert_eq!(image_bin(&edges, 2.299_999), None);
        assert_eq!(image_bin(&edges, 2.6), None);
    }

    #[test]
    fn test_moving_detector_vessel_is_unsupported() {
        let mut moving = DataArray::binned(
            &["detector", "a3", "a4"],
            &[1, 1, 2],
            EventTable::unit_weights(vec![0, 1]),
            Unit::COUNTS,
        )
        .unwrap();
        moving
            .insert_coord("a4", Variable::floats_1d("a4", vec![30.0, 40.0], Unit::DEGREE))
            .unwrap();
        assert!(matches!(
            sqw_pixel_buffer(&moving, &energy_bins(), SqwBinSizes::default(), Vector3::y()),
            Err(Error::Unsupported(_))
        ));
    }
}
