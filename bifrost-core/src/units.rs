//! Runtime physical units.
//!
//! A [`Unit`] is a scale factor relative to SI (with degrees, counts and
//! radians treated as base dimensions) plus integer exponents of the base
//! dimensions. Units are carried alongside every [`crate::Variable`] and are
//! checked whenever values of different origin are combined.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::{Div, Mul};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const LENGTH: usize = 0;
const TIME: usize = 1;
const MASS: usize = 2;
const CURRENT: usize = 3;
const ANGLE: usize = 4;
const COUNTS: usize = 5;
const N_BASE: usize = 6;

const BASE_SYMBOLS: [&str; N_BASE] = ["m", "s", "kg", "A", "rad", "counts"];

/// A physical unit: SI scale factor and base-dimension exponents.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Unit {
    scale: f64,
    exponents: [i8; N_BASE],
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.exponents == other.exponents && same_scale(self.scale, other.scale)
    }
}

fn same_scale(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs())
}

const fn base(index: usize, scale: f64) -> Unit {
    let mut exponents = [0; N_BASE];
    exponents[index] = 1;
    Unit { scale, exponents }
}

const fn compose(scale: f64, exponents: [i8; N_BASE]) -> Unit {
    Unit { scale, exponents }
}

const CHARGE: [i8; N_BASE] = {
    let mut exponents = [0; N_BASE];
    exponents[TIME] = 1;
    exponents[CURRENT] = 1;
    exponents
};

impl Unit {
    pub const DIMENSIONLESS: Unit = compose(1.0, [0; N_BASE]);
    pub const METER: Unit = base(LENGTH, 1.0);
    pub const MILLIMETER: Unit = base(LENGTH, 1e-3);
    pub const CENTIMETER: Unit = base(LENGTH, 1e-2);
    pub const ANGSTROM: Unit = base(LENGTH, 1e-10);
    pub const SECOND: Unit = base(TIME, 1.0);
    pub const MILLISECOND: Unit = base(TIME, 1e-3);
    pub const MICROSECOND: Unit = base(TIME, 1e-6);
    pub const NANOSECOND: Unit = base(TIME, 1e-9);
    pub const KILOGRAM: Unit = base(MASS, 1.0);
    pub const RADIAN: Unit = base(ANGLE, 1.0);
    pub const DEGREE: Unit = base(ANGLE, std::f64::consts::PI / 180.0);
    pub const COUNTS: Unit = base(COUNTS, 1.0);
    pub const HERTZ: Unit = compose(1.0, [0, -1, 0, 0, 0, 0]);
    pub const JOULE: Unit = compose(1.0, [2, -2, 1, 0, 0, 0]);
    pub const MILLI_ELECTRON_VOLT: Unit = compose(1.602_176_634e-22, [2, -2, 1, 0, 0, 0]);
    pub const INVERSE_ANGSTROM: Unit = compose(1e10, [-1, 0, 0, 0, 0, 0]);
    pub const INVERSE_METER: Unit = compose(1.0, [-1, 0, 0, 0, 0, 0]);
    pub const METER_PER_SECOND: Unit = compose(1.0, [1, -1, 0, 0, 0, 0]);
    pub const SECOND_PER_METER: Unit = compose(1.0, [-1, 1, 0, 0, 0, 0]);
    pub const METER_PER_SECOND_SQUARED: Unit = compose(1.0, [1, -2, 0, 0, 0, 0]);
    pub const AMPERE: Unit = base(CURRENT, 1.0);
    pub const COULOMB: Unit = compose(1.0, CHARGE);
    pub const MICRO_AMPERE_HOUR: Unit = compose(3.6e-3, CHARGE);

    /// Parse a unit string as written in NeXus files and configuration.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for unknown unit strings.
    pub fn parse(text: &str) -> Result<Self> {
        let unit = match text.trim() {
            "" | "dimensionless" | "1" | "None" => Self::DIMENSIONLESS,
            "m" | "meter" | "metre" => Self::METER,
            "mm" | "millimeter" => Self::MILLIMETER,
            "cm" | "centimeter" => Self::CENTIMETER,
            "Å" | "angstrom" | "Angstrom" | "AA" => Self::ANGSTROM,
            "s" | "sec" | "second" => Self::SECOND,
            "ms" | "msec" | "millisecond" => Self::MILLISECOND,
            "us" | "µs" | "microsecond" => Self::MICROSECOND,
            "ns" | "nanosecond" => Self::NANOSECOND,
            "kg" => Self::KILOGRAM,
            "rad" | "radian" | "radians" => Self::RADIAN,
            "deg" | "degree" | "degrees" => Self::DEGREE,
            "counts" | "count" => Self::COUNTS,
            "Hz" => Self::HERTZ,
            "J" => Self::JOULE,
            "meV" => Self::MILLI_ELECTRON_VOLT,
            "1/Å" | "1/angstrom" | "1/Angstrom" => Self::INVERSE_ANGSTROM,
            "1/m" => Self::INVERSE_METER,
            "m/s" => Self::METER_PER_SECOND,
            "s/m" => Self::SECOND_PER_METER,
            "m/s^2" | "m/s**2" => Self::METER_PER_SECOND_SQUARED,
            "A" => Self::AMPERE,
            "C" => Self::COULOMB,
            "uAh" | "µAh" | "uA*hour" => Self::MICRO_AMPERE_HOUR,
            other => return Err(Error::Unsupported(format!("unknown unit '{other}'"))),
        };
        Ok(unit)
    }

    /// Scale factor relative to the SI base combination.
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// True if this unit has no physical dimension (any scale).
    #[must_use]
    pub fn is_dimensionless(&self) -> bool {
        self.exponents == [0; N_BASE]
    }

    /// True if both units measure the same physical dimension.
    #[must_use]
    pub fn same_dimension(&self, other: &Unit) -> bool {
        self.exponents == other.exponents
    }

    /// Factor `f` such that `value_in_self * f == value_in_target`.
    ///
    /// # Errors
    /// Returns [`Error::IncompatibleUnits`] if the dimensions differ.
    pub fn conversion_factor(&self, target: &Unit) -> Result<f64> {
        if !self.same_dimension(target) {
            return Err(Error::IncompatibleUnits {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        Ok(self.scale / target.scale)
    }

    /// Raise to an integer power.
    #[must_use]
    pub fn powi(&self, power: i8) -> Unit {
        let mut exponents = self.exponents;
        for e in &mut exponents {
            *e *= power;
        }
        Unit {
            scale: self.scale.powi(i32::from(power)),
            exponents,
        }
    }

    /// Square root, only defined for even exponents.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] if an exponent is odd.
    pub fn sqrt(&self) -> Result<Unit> {
        if self.exponents.iter().any(|e| e % 2 != 0) {
            return Err(Error::Unsupported(format!("square root of unit '{self}'")));
        }
        let mut exponents = self.exponents;
        for e in &mut exponents {
            *e /= 2;
        }
        Ok(Unit {
            scale: self.scale.sqrt(),
            exponents,
        })
    }

    fn known_name(&self) -> Option<&'static str> {
        const NAMED: [(Unit, &str); 23] = [
            (Unit::DIMENSIONLESS, "dimensionless"),
            (Unit::METER, "m"),
            (Unit::MILLIMETER, "mm"),
            (Unit::CENTIMETER, "cm"),
            (Unit::ANGSTROM, "Å"),
            (Unit::SECOND, "s"),
            (Unit::MILLISECOND, "ms"),
            (Unit::MICROSECOND, "µs"),
            (Unit::NANOSECOND, "ns"),
            (Unit::KILOGRAM, "kg"),
            (Unit::RADIAN, "rad"),
            (Unit::DEGREE, "deg"),
            (Unit::COUNTS, "counts"),
            (Unit::HERTZ, "Hz"),
            (Unit::JOULE, "J"),
            (Unit::MILLI_ELECTRON_VOLT, "meV"),
            (Unit::INVERSE_ANGSTROM, "1/Å"),
            (Unit::INVERSE_METER, "1/m"),
            (Unit::METER_PER_SECOND, "m/s"),
            (Unit::SECOND_PER_METER, "s/m"),
            (Unit::AMPERE, "A"),
            (Unit::COULOMB, "C"),
            (Unit::MICRO_AMPERE_HOUR, "µAh"),
        ];
        NAMED
            .iter()
            .find(|(unit, _)| unit == self)
            .map(|(_, name)| *name)
    }
}

impl Default for Unit {
    fn default() -> Self {
        Self::DIMENSIONLESS
    }
}

impl Mul for Unit {
    type Output = Unit;

    fn mul(self, rhs: Unit) -> Unit {
        let mut exponents = self.exponents;
        for (e, r) in exponents.iter_mut().zip(rhs.exponents) {
            *e += r;
        }
        Unit {
            scale: self.scale * rhs.scale,
            exponents,
        }
    }
}

impl Div for Unit {
    type Output = Unit;

    fn div(self, rhs: Unit) -> Unit {
        self * rhs.powi(-1)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.known_name() {
            return f.write_str(name);
        }
        let mut parts = Vec::new();
        if !same_scale(self.scale, 1.0) {
            parts.push(format!("{:e}", self.scale));
        }
        for (symbol, exponent) in BASE_SYMBOLS.iter().zip(self.exponents) {
            match exponent {
                0 => {}
                1 => parts.push((*symbol).to_string()),
                e => parts.push(format!("{symbol}^{e}")),
            }
        }
        f.write_str(&parts.join(" "))
    }
}
