//! Error types for bifrost-core.

use thiserror::Error;

/// Result type alias for bifrost operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for BIFROST data reduction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A required instrument component is not present.
    #[error("missing {kind} component: {name}")]
    MissingComponent { kind: String, name: String },

    /// `merge_triplets` was called without any input.
    #[error("at least one detector triplet is required")]
    NoTriplets,

    /// No analyzer matches the naming convention for a detector.
    #[error("no analyzer found for detector '{detector}'")]
    AnalyzerNotFound { detector: String },

    /// More than one analyzer matches the naming convention for a detector.
    #[error("detector '{detector}' matches several analyzers: {candidates:?}")]
    AmbiguousAnalyzer {
        detector: String,
        candidates: Vec<String>,
    },

    /// A coordinate needed by a computation is not available.
    #[error("missing coordinate '{0}'")]
    MissingCoordinate(String),

    /// A coordinate transformation graph depends on itself.
    #[error("coordinate transformation graph has a cycle through '{0}'")]
    CyclicGraph(String),

    /// Sizes of a named dimension disagree between operands.
    #[error("dimension '{dim}' has size {found}, expected {expected}")]
    DimensionMismatch {
        dim: String,
        expected: usize,
        found: usize,
    },

    /// Operands have incompatible dimension layouts.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Units cannot be converted into each other.
    #[error("cannot convert unit '{from}' to '{to}'")]
    IncompatibleUnits { from: String, to: String },

    /// A variable holds a different element type than required.
    #[error("variable '{name}' must hold {expected}")]
    TypeMismatch { name: String, expected: String },

    /// A histogram range could not be derived because there is no data.
    #[error("empty data range along '{dim}'")]
    EmptyRange { dim: String },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// Uncertainties cannot be broadcast in the requested mode.
    #[error("cannot broadcast uncertainties: {0}")]
    UncertaintyBroadcast(String),

    /// Requested operation is not supported for this input.
    #[error("not supported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Convenience constructor for [`Error::MissingComponent`].
    pub fn missing_component(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingComponent {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Convenience constructor for [`Error::TypeMismatch`].
    pub fn type_mismatch(name: impl Into<String>, expected: impl Into<String>) -> Self {
        Self::TypeMismatch {
            name: name.into(),
            expected: expected.into(),
        }
    }
}
