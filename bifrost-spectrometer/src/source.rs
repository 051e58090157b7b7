//! Neutron source description.

use bifrost_core::{Unit, Variable};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Timing of a pulsed neutron source.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Source {
    /// Repetition rate in Hz.
    pub frequency: f64,
    /// Pulse duration in s.
    pub pulse_duration: f64,
    /// Emission delay in s.
    pub delay: f64,
    /// Smallest and largest neutron speed considered, in m/s.
    pub velocities: (f64, f64),
}

/// The European Spallation Source: 14 Hz, 3 ms pulses.
///
/// The speed range covers roughly 53 µeV to 530 meV.
pub const ESS_SOURCE: Source = Source {
    frequency: 14.0,
    pulse_duration: 0.003,
    delay: 0.0,
    velocities: (100.0, 1e4),
};

impl Default for Source {
    fn default() -> Self {
        ESS_SOURCE
    }
}

impl Source {
    /// Time between pulses in ns.
    #[must_use]
    pub fn period(&self) -> Variable {
        Variable::scalar(1e9 / self.frequency, Unit::NANOSECOND)
    }

    /// Time between pulses in s.
    #[must_use]
    pub fn period_seconds(&self) -> f64 {
        1.0 / self.frequency
    }

    /// Pulse duration as a variable.
    #[must_use]
    pub fn duration(&self) -> Variable {
        Variable::scalar(self.pulse_duration, Unit::SECOND)
    }

    /// Fastest neutron speed in m/s.
    #[must_use]
    pub fn max_velocity(&self) -> f64 {
        self.velocities.1
    }
}
