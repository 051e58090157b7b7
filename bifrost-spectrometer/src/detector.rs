//! Detector topology and triplet assembly.
//!
//! BIFROST detector numbers are 1-based and ordered `(arc, tube, channel,
//! pixel)`. Each triplet holds the three tubes behind one analyzer, i.e. a
//! single `(arc, channel)` pair.

use crate::conversion::add_spectrometer_coords;
use crate::graph::CoordTransformGraph;
use bifrost_core::{DataArray, Error, Result, Unit, Variable};
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Dimension along which irregular triplet sets are concatenated.
pub const TRIPLET_DIM: &str = "triplet";

/// Stride layout of detector numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct DetectorLayout {
    pub pixels_per_tube: i64,
    pub tubes_per_channel: i64,
    pub channels_per_arc: i64,
}

impl Default for DetectorLayout {
    fn default() -> Self {
        Self {
            pixels_per_tube: 100,
            tubes_per_channel: 3,
            channels_per_arc: 9,
        }
    }
}

impl DetectorLayout {
    /// Number of pixels in one arc.
    #[must_use]
    pub fn pixels_per_arc(&self) -> i64 {
        self.pixels_per_tube * self.tubes_per_channel * self.channels_per_arc
    }

    /// Arc and channel of a detector number.
    #[must_use]
    pub fn arc_and_channel(&self, detector_number: i64) -> (i64, i64) {
        let idx = detector_number - 1;
        let arc = idx / self.pixels_per_arc();
        let remainder = idx % self.pixels_per_arc();
        let channel = (remainder % (self.pixels_per_tube * self.channels_per_arc)) / self.pixels_per_tube;
        (arc, channel)
    }

    /// Tube within the triplet and pixel within the tube.
    #[must_use]
    pub fn tube_and_pixel(&self, detector_number: i64) -> (i64, i64) {
        let idx = detector_number - 1;
        let remainder = idx % self.pixels_per_arc();
        let tube = remainder / (self.pixels_per_tube * self.channels_per_arc);
        (tube, idx % self.pixels_per_tube)
    }

    /// Detector number of a pixel.
    #[must_use]
    pub fn detector_number(&self, arc: i64, tube: i64, channel: i64, pixel: i64) -> i64 {
        arc * self.pixels_per_arc()
            + tube * self.pixels_per_tube * self.channels_per_arc
            + channel * self.pixels_per_tube
            + pixel
            + 1
    }
}

/// Arc and channel index of a triplet from its detector numbers.
///
/// The first pixel (`tube` 0, `length` 0) decides.
///
/// # Errors
/// Returns an error for non-integer or empty detector numbers.
pub fn arc_and_channel_from_detector_number(
    detector_number: &Variable,
    layout: &DetectorLayout,
) -> Result<(Variable, Variable)> {
    let first = detector_number
        .ints()?
        .iter()
        .next()
        .copied()
        .ok_or_else(|| Error::ShapeMismatch("triplet without detector numbers".to_string()))?;
    let (arc, channel) = layout.arc_and_channel(first);
    Ok((Variable::index(arc), Variable::index(channel)))
}

/// Validated association of detector triplets with analyzers.
///
/// Component names start with an instrument index followed by `_`; the
/// analyzer of a detector has an index two below the detector's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalyzerMap {
    entries: BTreeMap<String, String>,
}

fn component_index(name: &str) -> Option<i64> {
    name.split('_').next()?.parse().ok()
}

impl AnalyzerMap {
    /// Match every detector with exactly one analyzer.
    ///
    /// # Errors
    /// Returns [`Error::AnalyzerNotFound`] or [`Error::AmbiguousAnalyzer`].
    pub fn build<A: AsRef<str>, D: AsRef<str>>(analyzers: &[A], detectors: &[D]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for detector in detectors {
            let detector = detector.as_ref();
            let Some(index) = component_index(detector) else {
                return Err(Error::AnalyzerNotFound {
                    detector: detector.to_string(),
                });
            };
            let candidates: Vec<String> = analyzers
                .iter()
                .map(AsRef::as_ref)
                .filter(|a| component_index(a) == Some(index - 2))
                .map(ToString::to_string)
                .collect();
            match candidates.as_slice() {
                [] => {
                    return Err(Error::AnalyzerNotFound {
                        detector: detector.to_string(),
                    })
                }
                [analyzer] => {
                    entries.insert(detector.to_string(), analyzer.clone());
                }
                _ => {
                    return Err(Error::AmbiguousAnalyzer {
                        detector: detector.to_string(),
                        candidates,
                    })
                }
            }
        }
        debug!("Matched {} detectors with analyzers", entries.len());
        Ok(Self { entries })
    }

    /// Analyzer name for a detector.
    ///
    /// # Errors
    /// Returns [`Error::AnalyzerNotFound`] for unknown detectors.
    pub fn analyzer_for(&self, detector: &str) -> Result<&str> {
        self.entries
            .get(detector)
            .map(String::as_str)
            .ok_or_else(|| Error::AnalyzerNotFound {
                detector: detector.to_string(),
            })
    }

    /// `(detector, analyzer)` pairs ordered by detector name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(d, a)| (d.as_str(), a.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Prepare a loaded triplet for reduction.
///
/// File dims `dim_0`/`dim_1` become `tube`/`length`, scalar `arc` and
/// `channel` coordinates are attached and the spectrometer coordinates are
/// computed from the two graphs.
///
/// # Errors
/// Returns an error if detector numbers or graph inputs are missing.
pub fn calibrated_detector(
    detector: DataArray,
    layout: &DetectorLayout,
    primary_graph: &CoordTransformGraph,
    secondary_graph: &CoordTransformGraph,
) -> Result<DataArray> {
    let da = label_triplet(detector, layout)?;
    add_spectrometer_coords(&da, primary_graph, secondary_graph)
}

/// Rename file dims to `(tube, length)` and attach scalar `arc` and
/// `channel` coordinates.
///
/// # Errors
/// Returns an error if `detector_number` is missing or not integral.
pub fn label_triplet(detector: DataArray, layout: &DetectorLayout) -> Result<DataArray> {
    let mut da = detector.rename_dim("dim_0", "tube").rename_dim("dim_1", "length");
    let (arc, channel) = arc_and_channel_from_detector_number(da.coord("detector_number")?, layout)?;
    da.insert_coord("arc", arc)?;
    da.insert_coord("channel", channel)?;
    Ok(da)
}

fn scalar_index(triplet: &DataArray, name: &str) -> Result<i64> {
    triplet
        .coord(name)?
        .value::<i64>()
        .map_err(|_| Error::type_mismatch(name, "a scalar integer index"))
}

/// Merge triplets into `(arc, channel, ...)` if they tile a complete grid.
///
/// Triplets are sorted by `(arc, channel)`. Irregular sets are returned
/// stacked along [`TRIPLET_DIM`] with per-triplet `arc` and `channel`.
///
/// # Errors
/// Returns [`Error::NoTriplets`] for empty input, or an error if the triplets
/// lack `arc`/`channel` or have different layouts.
pub fn merge_triplets(triplets: &[DataArray]) -> Result<DataArray> {
    if triplets.is_empty() {
        return Err(Error::NoTriplets);
    }
    let mut keyed = triplets
        .iter()
        .map(|t| Ok(((scalar_index(t, "arc")?, scalar_index(t, "channel")?), t)))
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by_key(|(pair, _)| *pair);

    let arcs: BTreeSet<i64> = keyed.iter().map(|((a, _), _)| *a).collect();
    let channels: BTreeSet<i64> = keyed.iter().map(|((_, c), _)| *c).collect();
    let expected: Vec<(i64, i64)> = arcs
        .iter()
        .flat_map(|&a| channels.iter().map(move |&c| (a, c)))
        .collect();
    let actual: Vec<(i64, i64)> = keyed.iter().map(|(pair, _)| *pair).collect();

    let sorted: Vec<DataArray> = keyed.into_iter().map(|(_, t)| t.clone()).collect();
    let stacked = DataArray::stack(&sorted, TRIPLET_DIM)?;
    if actual == expected {
        info!(
            "Merged {} triplets into {} arcs x {} channels",
            sorted.len(),
            arcs.len(),
            channels.len()
        );
        stacked.fold(TRIPLET_DIM, &[("arc", arcs.len()), ("channel", channels.len())])
    } else {
        warn!(
            "{} triplets do not form a complete (arc, channel) grid, keeping them along '{TRIPLET_DIM}'",
            sorted.len()
        );
        Ok(stacked)
    }
}

/// Per-pixel summary of several triplets along `pixel`, sorted by
/// detector number.
///
/// Carries `detector_number` and `position` coordinates; the data is the
/// summed weight per pixel.
///
/// # Errors
/// Returns an error if a triplet lacks `detector_number` or `position`.
pub fn combine_detectors(triplets: &[DataArray]) -> Result<DataArray> {
    let mut pixels: Vec<(i64, Vector3<f64>, f64)> = Vec::new();
    let mut unit = Unit::COUNTS;
    for triplet in triplets {
        let numbers = triplet
            .coord("detector_number")?
            .broadcast(triplet.dims(), triplet.shape())?;
        let positions = triplet
            .coord("position")?
            .to_unit(&Unit::METER)?
            .broadcast(triplet.dims(), triplet.shape())?;
        let weights: Vec<f64> = match triplet.events() {
            Some(events) => events.weights_per_bin(triplet.n_bins()),
            None => triplet.dense_values()?.0.iter().copied().collect(),
        };
        unit = triplet.unit();
        pixels.extend(
            numbers
                .ints()?
                .iter()
                .zip(positions.vectors()?.iter())
                .zip(weights)
                .map(|((&n, &p), w)| (n, p, w)),
        );
    }
    pixels.sort_by_key(|(n, _, _)| *n);
    let data = Variable::floats_1d("pixel", pixels.iter().map(|p| p.2).collect(), unit);
    let mut combined = DataArray::dense(&data, None)?;
    combined.insert_coord(
        "detector_number",
        Variable::ints_1d("pixel", pixels.iter().map(|p| p.0).collect(), Unit::DIMENSIONLESS),
    )?;
    combined.insert_coord(
        "position",
        Variable::vectors_1d("pixel", pixels.iter().map(|p| p.1).collect(), Unit::METER),
    )?;
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bifrost_core::EventTable;

    fn triplet(arc: i64, channel: i64, n_events: usize) -> DataArray {
        let bins = (0..n_events).map(|i| i % 4).collect();
        let mut da = DataArray::binned(
            &["tube", "length"],
            &[2, 2],
            EventTable::unit_weights(bins),
            Unit::COUNTS,
        )
        .unwrap();
        da.insert_coord("arc", Variable::index(arc)).unwrap();
        da.insert_coord("channel", Variable::index(channel)).unwrap();
        da
    }

    #[test]
    fn test_layout_decode() {
        let layout = DetectorLayout::default();
        assert_eq!(layout.pixels_per_arc(), 2700);
        assert_eq!(layout.arc_and_channel(1), (0, 0));
        assert_eq!(layout.arc_and_channel(101), (0, 1));
        assert_eq!(layout.arc_and_channel(901), (0, 0));
        assert_eq!(layout.arc_and_channel(2701), (1, 0));
        assert_eq!(layout.tube_and_pixel(901), (1, 0));
    }

    #[test]
    fn test_layout_round_trips_every_pixel_of_two_arcs() {
        let layout = DetectorLayout::default();
        for n in 1..=2 * layout.pixels_per_arc() {
            let (arc, channel) = layout.arc_and_channel(n);
            let (tube, pixel) = layout.tube_and_pixel(n);
            assert!(tube < layout.tubes_per_channel);
            assert!(channel < layout.channels_per_arc);
            assert_eq!(layout.detector_number(arc, tube, channel, pixel), n);
        }
    }

    #[test]
    fn test_arc_and_channel_from_first_pixel() {
        let numbers =
            Variable::from_shape_vec(&["tube", "length"], &[2, 1], vec![5501_i64, 6401], Unit::DIMENSIONLESS)
                .unwrap();
        let (arc, channel) = arc_and_channel_from_detector_number(&numbers, &DetectorLayout::default()).unwrap();
        assert_eq!(arc.value::<i64>().unwrap(), 2);
        assert_eq!(channel.value::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_analyzer_map() {
        let analyzers = ["043_analyzer", "044_analyzer", "046_analyzer"];
        let detectors = ["045_triplet", "048_triplet"];
        let map = AnalyzerMap::build(&analyzers, &detectors).unwrap();
        assert_eq!(map.analyzer_for("045_triplet").unwrap(), "043_analyzer");
        assert_eq!(map.analyzer_for("048_triplet").unwrap(), "046_analyzer");
        assert_eq!(map.len(), 2);

        let err = AnalyzerMap::build(&analyzers, &["050_triplet"]).unwrap_err();
        assert!(matches!(err, Error::AnalyzerNotFound { detector } if detector == "050_triplet"));

        let err = AnalyzerMap::build(&["043_a", "043_b"], &["045_triplet"]).unwrap_err();
        assert!(matches!(err, Error::AmbiguousAnalyzer { candidates, .. } if candidates.len() == 2));
    }

    #[test]
    fn test_merge_requires_triplets() {
        assert!(matches!(merge_triplets(&[]), Err(Error::NoTriplets)));
    }

    #[test]
    fn test_merge_regular_grid_in_any_order() {
        let triplets = vec![triplet(1, 1, 3), triplet(0, 0, 5), triplet(1, 0, 2), triplet(0, 1, 4)];
        let merged = merge_triplets(&triplets).unwrap();
        assert_eq!(merged.dims(), ["arc", "channel", "tube", "length"]);
        assert_eq!(merged.shape(), [2, 2, 2, 2]);
        assert_eq!(merged.event_count(), 14);
        let one_one = merged.slice("arc", 1).unwrap().slice("channel", 1).unwrap();
        assert_eq!(one_one.event_count(), 3);
    }

    #[test]
    fn test_merge_irregular_falls_back_to_triplet_dim() {
        let triplets = vec![triplet(0, 0, 5), triplet(0, 1, 4), triplet(1, 0, 2)];
        let merged = merge_triplets(&triplets).unwrap();
        assert_eq!(merged.dims(), [TRIPLET_DIM, "tube", "length"]);
        assert_eq!(merged.event_count(), 11);
        assert_eq!(merged.coord("arc").unwrap().to_vec::<i64>().unwrap(), vec![0, 0, 1]);
        assert_eq!(merged.coord("channel").unwrap().to_vec::<i64>().unwrap(), vec![0, 1, 0]);
    }

    #[test]
    fn test_combine_detectors_sorts_pixels() {
        let mut second = triplet(0, 1, 4);
        second
            .insert_coord(
                "detector_number",
                Variable::from_shape_vec(&["tube", "length"], &[2, 2], vec![101_i64, 102, 1001, 1002], Unit::DIMENSIONLESS)
                    .unwrap(),
            )
            .unwrap();
        second
            .insert_coord("position", Variable::vector(Vector3::new(1.0, 0.0, 0.0), Unit::METER))
            .unwrap();
        let mut first = triplet(0, 0, 8);
        first
            .insert_coord(
                "detector_number",
                Variable::from_shape_vec(&["tube", "length"], &[2, 2], vec![1_i64, 2, 901, 902], Unit::DIMENSIONLESS)
                    .unwrap(),
            )
            .unwrap();
        first
            .insert_coord("position", Variable::vector(Vector3::zeros(), Unit::METER))
            .unwrap();
        let combined = combine_detectors(&[second, first]).unwrap();
        assert_eq!(
            combined.coord("detector_number").unwrap().to_vec::<i64>().unwrap(),
            vec![1, 2, 101, 102, 901, 902, 1001, 1002]
        );
        assert_eq!(combined.total(), 12.0);
    }
}
