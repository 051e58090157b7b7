//! Physical constants in SI units (CODATA 2018).

/// Planck constant h in J·s.
pub const PLANCK: f64 = 6.626_070_15e-34;

/// Reduced Planck constant ħ in J·s.
pub const HBAR: f64 = PLANCK / (2.0 * std::f64::consts::PI);

/// Neutron mass in kg.
pub const NEUTRON_MASS: f64 = 1.674_927_498_04e-27;

/// One milli-electronvolt in J.
pub const MILLI_ELECTRON_VOLT: f64 = 1.602_176_634e-22;

/// One ångström in m.
pub const ANGSTROM: f64 = 1e-10;

/// Standard gravitational acceleration in m/s².
pub const STANDARD_GRAVITY: f64 = 9.806_65;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hbar_matches_planck() {
        assert_relative_eq!(HBAR * 2.0 * std::f64::consts::PI, PLANCK, max_relative = 1e-15);
        assert_relative_eq!(HBAR, 1.054_571_817e-34, max_relative = 1e-9);
    }
}
