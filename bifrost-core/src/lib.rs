//! bifrost-core: Labeled arrays and units for BIFROST data reduction.
//!
//! This crate provides the data substrate the reduction works on: physical
//! units, named-dimension variables, event tables and data arrays with
//! explicitly tagged point and bin-edge coordinates.
//!

pub mod constants;
pub mod data_array;
pub mod error;
pub mod events;
pub mod units;
pub mod variable;

pub use data_array::{Content, Coord, CoordKind, DataArray};
pub use error::{Error, Result};
pub use events::{EventTable, EVENT_DIM};
pub use units::Unit;
pub use variable::{
    broadcast_shape, in_same_unit, range_normalized, zip3_with, zip4_with, zip_with, DType,
    Element, Values, Variable,
};
