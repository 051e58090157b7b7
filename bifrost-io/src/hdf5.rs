//! HDF5 persistence of time-of-flight lookup tables, plus the small dataset
//! and attribute helpers shared with the NeXus loader.

use crate::{Error, Result};
use bifrost_spectrometer::TimeOfFlightLookupTable;
use hdf5::types::{H5Type, VarLenAscii, VarLenUnicode};
use hdf5::{Dataset, File, Group, Location};
use log::info;
use ndarray::{Array2, ArrayView1};
use std::path::Path;
use std::str::FromStr;

const LOOKUP_TABLE_GROUP: &str = "lookup_table";

/// Writes a lookup table to a new HDF5 file.
///
/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_lookup_table<P: AsRef<Path>>(path: P, table: &TimeOfFlightLookupTable) -> Result<()> {
    let file = File::create(path.as_ref())?;
    set_attr_str(&file, "bifrost_format_version", "0.1")?;

    let group = file.create_group(LOOKUP_TABLE_GROUP)?;
    set_attr_str(&group, "NX_class", "NXdata")?;
    set_attr_str(&group, "signal", "time_of_flight")?;
    set_attr_f64(&group, "pulse_period", table.pulse_period)?;
    set_attr_f64(&group, "distance_resolution", table.distance_resolution)?;
    set_attr_f64(&group, "time_resolution", table.time_resolution)?;
    group
        .new_attr::<u64>()
        .create("pulse_stride")?
        .write_scalar(&(table.pulse_stride as u64))?;

    let distance = group
        .new_dataset::<f64>()
        .shape((table.distance.len(),))
        .create("distance")?;
    distance.write(ArrayView1::from(table.distance.as_slice()))?;
    set_attr_str(&distance, "units", "m")?;

    let time = group.new_dataset::<f64>().shape((table.time.len(),)).create("time")?;
    time.write(ArrayView1::from(table.time.as_slice()))?;
    set_attr_str(&time, "units", "s")?;

    let tof = group
        .new_dataset::<f64>()
        .shape(table.tof.dim())
        .create("time_of_flight")?;
    tof.write(table.tof.view())?;
    set_attr_str(&tof, "units", "s")?;

    info!(
        "Wrote {}x{} lookup table to {}",
        table.distance.len(),
        table.time.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Reads a lookup table written by [`write_lookup_table`].
///
/// # Errors
/// Returns an error if the file is missing entries or shapes are inconsistent.
pub fn read_lookup_table<P: AsRef<Path>>(path: P) -> Result<TimeOfFlightLookupTable> {
    let file = File::open(path.as_ref())?;
    let group = file
        .group(LOOKUP_TABLE_GROUP)
        .map_err(|_| Error::MissingEntry(format!("/{LOOKUP_TABLE_GROUP}")))?;

    let distance = read_dataset_vec::<f64>(&group, "distance")?;
    let time = read_dataset_vec::<f64>(&group, "time")?;
    let tof_ds = group.dataset("time_of_flight")?;
    let shape = tof_ds.shape();
    if shape != [distance.len(), time.len()] {
        return Err(Error::InvalidFormat(format!(
            "time_of_flight has shape {shape:?}, expected [{}, {}]",
            distance.len(),
            time.len()
        )));
    }
    let tof = Array2::from_shape_vec((shape[0], shape[1]), tof_ds.read_raw::<f64>()?)
        .map_err(|e| Error::InvalidFormat(e.to_string()))?;

    let required = |name: &str| -> Result<f64> {
        read_attr_opt::<f64>(&group, name)?
            .ok_or_else(|| Error::MissingEntry(format!("/{LOOKUP_TABLE_GROUP}@{name}")))
    };
    let pulse_stride = read_attr_opt::<u64>(&group, "pulse_stride")?
        .ok_or_else(|| Error::MissingEntry(format!("/{LOOKUP_TABLE_GROUP}@pulse_stride")))?;

    Ok(TimeOfFlightLookupTable {
        distance,
        time,
        tof,
        pulse_period: required("pulse_period")?,
        pulse_stride: usize::try_from(pulse_stride)
            .map_err(|_| Error::InvalidFormat(format!("pulse_stride {pulse_stride} out of range")))?,
        distance_resolution: required("distance_resolution")?,
        time_resolution: required("time_resolution")?,
    })
}

pub(crate) fn read_dataset_vec<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    let dataset = group
        .dataset(name)
        .map_err(|_| Error::MissingEntry(format!("{}/{name}", group.name())))?;
    Ok(dataset.read_raw::<T>()?)
}

pub(crate) fn read_dataset_vec_opt<T: H5Type>(group: &Group, name: &str) -> Result<Option<Vec<T>>> {
    match group.dataset(name) {
        Ok(dataset) => Ok(Some(dataset.read_raw::<T>()?)),
        Err(_) => Ok(None),
    }
}

pub(crate) fn read_attr_opt<T: H5Type + Clone>(location: &Location, name: &str) -> Result<Option<T>> {
    match location.attr(name) {
        Ok(attr) => Ok(Some(attr.read_scalar::<T>()?)),
        Err(_) => Ok(None),
    }
}

/// String attribute stored as UTF-8 or ASCII.
pub(crate) fn read_attr_opt_string(location: &Location, name: &str) -> Result<Option<String>> {
    let Ok(attr) = location.attr(name) else {
        return Ok(None);
    };
    if let Ok(value) = attr.read_scalar::<VarLenUnicode>() {
        return Ok(Some(value.to_string()));
    }
    let value: VarLenAscii = attr.read_scalar()?;
    Ok(Some(value.to_string()))
}

/// Scalar string dataset, as used for `depends_on`.
pub(crate) fn read_string_dataset(dataset: &Dataset) -> Result<String> {
    if let Ok(value) = dataset.read_scalar::<VarLenUnicode>() {
        return Ok(value.to_string());
    }
    let value: VarLenAscii = dataset.read_scalar()?;
    Ok(value.to_string())
}

pub(crate) fn set_attr_str(location: &Location, name: &str, value: &str) -> Result<()> {
    let value = to_var_len_unicode(value)?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn set_attr_f64(location: &Location, name: &str, value: f64) -> Result<()> {
    location.new_attr::<f64>().create(name)?.write_scalar(&value)?;
    Ok(())
}

pub(crate) fn to_var_len_unicode(value: &str) -> Result<VarLenUnicode> {
    VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))
}
