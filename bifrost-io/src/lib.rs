//! bifrost-io: configuration and file input for BIFROST reduction.
//!
//! The JSON [`ReductionConfig`] is always available. NeXus loading and
//! lookup-table persistence need the `hdf5` feature.

mod error;
pub mod config;
#[cfg(feature = "hdf5")]
pub mod hdf5;
#[cfg(feature = "hdf5")]
pub mod nexus;

pub use config::{
    GeometryConfig, NormalizationConfig, OutputConfig, ReductionConfig, SourceConfig,
    TimeOfFlightConfig,
};
pub use error::{Error, Result};
#[cfg(feature = "hdf5")]
pub use crate::hdf5::{read_lookup_table, write_lookup_table};
#[cfg(feature = "hdf5")]
pub use crate::nexus::{ComponentInfo, NexusFile};
