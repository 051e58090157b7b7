//! JSON reduction configuration.
//!
//! Every section and field has a BIFROST default, so a configuration file
//! only needs to name what differs:
//!
//! ```json
//! {
//!   "time_of_flight": { "lookup_table": "lut.h5" },
//!   "normalization": { "uncertainty_mode": "upper_bound" },
//!   "output": { "incident_energy_bins": 200 }
//! }
//! ```

use crate::{Error, Result};
use bifrost_core::Unit;
use bifrost_spectrometer::{
    BifrostWorkflow, BinSpec, DetectorLayout, LookupTableBuilder, Source, SqwBinSizes,
    TimeOfFlightLookupTable, UncertaintyBroadcastMode,
};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn positive(x: f64) -> bool {
    x.is_finite() && x > 0.0
}

/// Pulsed source timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub frequency_hz: f64,
    pub pulse_duration_s: f64,
    pub delay_s: f64,
    /// Smallest and largest simulated neutron speed.
    pub velocity_range_m_per_s: (f64, f64),
}

impl Default for SourceConfig {
    fn default() -> Self {
        let source = Source::default();
        Self {
            frequency_hz: source.frequency,
            pulse_duration_s: source.pulse_duration,
            delay_s: source.delay,
            velocity_range_m_per_s: source.velocities,
        }
    }
}

impl SourceConfig {
    #[must_use]
    pub fn source(&self) -> Source {
        Source {
            frequency: self.frequency_hz,
            pulse_duration: self.pulse_duration_s,
            delay: self.delay_s,
            velocities: self.velocity_range_m_per_s,
        }
    }
}

/// Time-of-flight lookup and frame unwrapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeOfFlightConfig {
    /// HDF5 file holding a precomputed lookup table.
    pub lookup_table: Option<PathBuf>,
    /// Distance range covered by a table built on the fly, in m.
    pub distance_range_m: (f64, f64),
    pub pulse_stride: usize,
    pub pulse_stride_offset: Option<usize>,
    /// Event times are full simulated arrival times.
    pub simulated: bool,
}

impl Default for TimeOfFlightConfig {
    fn default() -> Self {
        Self {
            lookup_table: None,
            distance_range_m: (160.0, 166.0),
            pulse_stride: 1,
            pulse_stride_offset: None,
            simulated: false,
        }
    }
}

/// Monitor and proton-charge normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub monitor: String,
    pub uncertainty_mode: UncertaintyBroadcastMode,
    /// Accumulated proton charge in µAh; files without one use this value.
    pub proton_charge_uah: Option<f64>,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            monitor: "110_frame_3".to_string(),
            uncertainty_mode: UncertaintyBroadcastMode::Drop,
            proton_charge_uah: None,
        }
    }
}

/// Instrument geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    /// Gravity vector in m/s².
    pub gravity: [f64; 3],
    pub detector_layout: DetectorLayout,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, -9.81, 0.0],
            detector_layout: DetectorLayout::default(),
        }
    }
}

/// Binning of the reduced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub incident_energy_bins: usize,
    /// Incident-energy range in meV; derived from the data when absent.
    pub incident_energy_range_mev: Option<(f64, f64)>,
    pub sqw_bins: SqwBinSizes,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            incident_energy_bins: 100,
            incident_energy_range_mev: None,
            sqw_bins: SqwBinSizes::default(),
        }
    }
}

/// Complete reduction configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    pub source: SourceConfig,
    pub time_of_flight: TimeOfFlightConfig,
    pub normalization: NormalizationConfig,
    pub geometry: GeometryConfig,
    pub output: OutputConfig,
}

impl ReductionConfig {
    /// ESS/BIFROST defaults.
    #[must_use]
    pub fn bifrost_defaults() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// holds invalid values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error for invalid JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`Error::CoreError`] wrapping an invalid-configuration error.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::CoreError(bifrost_core::Error::InvalidConfig(msg)));
        if !positive(self.source.frequency_hz) {
            return invalid(format!("source frequency must be positive, got {}", self.source.frequency_hz));
        }
        let (v_lo, v_hi) = self.source.velocity_range_m_per_s;
        if !(positive(v_lo) && positive(v_hi - v_lo)) {
            return invalid(format!("invalid velocity range ({v_lo}, {v_hi})"));
        }
        if self.time_of_flight.pulse_stride == 0 {
            return invalid("pulse stride must be at least 1".to_string());
        }
        if let Some(offset) = self.time_of_flight.pulse_stride_offset {
            if offset >= self.time_of_flight.pulse_stride {
                return invalid(format!(
                    "pulse stride offset {offset} must be below the stride {}",
                    self.time_of_flight.pulse_stride
                ));
            }
        }
        if self.output.incident_energy_bins == 0 {
            return invalid("number of incident energy bins must be positive".to_string());
        }
        if let Some((lo, hi)) = self.output.incident_energy_range_mev {
            if !positive(hi - lo) {
                return invalid(format!("invalid incident energy range ({lo}, {hi})"));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn with_lookup_table<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.time_of_flight.lookup_table = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_pulse_stride(mut self, stride: usize, offset: Option<usize>) -> Self {
        self.time_of_flight.pulse_stride = stride;
        self.time_of_flight.pulse_stride_offset = offset;
        self
    }

    #[must_use]
    pub fn with_simulated_input(mut self, simulated: bool) -> Self {
        self.time_of_flight.simulated = simulated;
        self
    }

    #[must_use]
    pub fn with_monitor<S: Into<String>>(mut self, monitor: S) -> Self {
        self.normalization.monitor = monitor.into();
        self
    }

    #[must_use]
    pub fn with_uncertainty_mode(mut self, mode: UncertaintyBroadcastMode) -> Self {
        self.normalization.uncertainty_mode = mode;
        self
    }

    #[must_use]
    pub fn with_proton_charge(mut self, charge_uah: f64) -> Self {
        self.normalization.proton_charge_uah = Some(charge_uah);
        self
    }

    #[must_use]
    pub fn with_gravity(mut self, gravity: [f64; 3]) -> Self {
        self.geometry.gravity = gravity;
        self
    }

    #[must_use]
    pub fn with_incident_energy_bins(mut self, bins: usize, range_mev: Option<(f64, f64)>) -> Self {
        self.output.incident_energy_bins = bins;
        self.output.incident_energy_range_mev = range_mev;
        self
    }

    #[must_use]
    pub fn gravity(&self) -> Vector3<f64> {
        Vector3::from(self.geometry.gravity)
    }

    /// Incident-energy binning for SQW output.
    #[must_use]
    pub fn incident_energy_bins(&self) -> BinSpec {
        match self.output.incident_energy_range_mev {
            Some((lo, hi)) => BinSpec::linspace(
                "incident_energy",
                lo,
                hi,
                self.output.incident_energy_bins,
                Unit::MILLI_ELECTRON_VOLT,
            ),
            None => BinSpec::Count(self.output.incident_energy_bins),
        }
    }

    /// Builder for a lookup table matching the source and pulse stride.
    #[must_use]
    pub fn lookup_table_builder(&self) -> LookupTableBuilder {
        LookupTableBuilder::new(&self.source.source(), self.time_of_flight.distance_range_m)
            .with_pulse_stride(self.time_of_flight.pulse_stride)
    }

    /// Workflow configured from this file and a lookup table.
    #[must_use]
    pub fn workflow(&self, lookup_table: TimeOfFlightLookupTable) -> BifrostWorkflow {
        BifrostWorkflow::new(lookup_table)
            .with_source(self.source.source())
            .with_gravity(self.gravity())
            .with_layout(self.geometry.detector_layout)
            .with_pulse_stride_offset(self.time_of_flight.pulse_stride_offset)
            .with_simulated_input(self.time_of_flight.simulated)
            .with_uncertainty_mode(self.normalization.uncertainty_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = ReductionConfig::bifrost_defaults();
        assert_eq!(config.normalization.monitor, "110_frame_3");
        assert_eq!(config.source.frequency_hz, 14.0);
        assert_eq!(config.geometry.detector_layout.pixels_per_tube, 100);
        assert_eq!(config.time_of_flight.pulse_stride, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "normalization": {{ "uncertainty_mode": "upper_bound", "proton_charge_uah": 2.5 }},
                "output": {{ "incident_energy_bins": 20, "incident_energy_range_mev": [2.0, 12.0] }}
            }}"#
        )
        .unwrap();
        let config = ReductionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.normalization.uncertainty_mode, UncertaintyBroadcastMode::UpperBound);
        assert_eq!(config.normalization.proton_charge_uah, Some(2.5));
        assert_eq!(config.normalization.monitor, "110_frame_3");
        match config.incident_energy_bins() {
            BinSpec::Edges(edges) => assert_eq!(edges.len(), 21),
            BinSpec::Count(_) => panic!("expected explicit edges"),
        }
    }

    #[test]
    fn test_json_round_trip() {
        let config = ReductionConfig::bifrost_defaults()
            .with_lookup_table("lut.h5")
            .with_pulse_stride(2, Some(1))
            .with_gravity([0.0, 0.0, -9.81]);
        let parsed = ReductionConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(ReductionConfig::from_json(r#"{"time_of_flight": {"pulse_stride": 0}}"#).is_err());
        assert!(ReductionConfig::from_json(
            r#"{"time_of_flight": {"pulse_stride": 2, "pulse_stride_offset": 2}}"#
        )
        .is_err());
        assert!(ReductionConfig::from_json(r#"{"source": {"frequency_hz": -1.0}}"#).is_err());
        assert!(matches!(
            ReductionConfig::from_json("{ not json"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            ReductionConfig::from_file("/nonexistent/config.json"),
            Err(Error::Io(_))
        ));
    }
}
