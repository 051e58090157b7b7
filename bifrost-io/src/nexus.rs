//! Loading BIFROST runs from NeXus files.
//!
//! Components are found by their `NX_class` attribute below
//! `/entry/instrument`. Positions follow the `depends_on` chain of
//! `NXtransformations` entries; each entry is a translation or rotation along
//! its `vector` attribute, optionally preceded by an `offset`.

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use crate::config::ReductionConfig;
use crate::hdf5::{
    read_attr_opt_string, read_dataset_vec, read_dataset_vec_opt, read_string_dataset,
};
use crate::{Error, Result};
use bifrost_core::{DataArray, EventTable, Unit, Variable, EVENT_DIM};
use bifrost_spectrometer::primary::Chopper;
use bifrost_spectrometer::{
    hist_events, Analyzer, AnalyzerMap, BinSpec, InstrumentAngle, RunInput, Source, TripletInput,
};
use hdf5::{Dataset, File, Group, Location};
use log::{debug, info, warn};
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const ENTRY: &str = "/entry";
const INSTRUMENT: &str = "/entry/instrument";
/// Depth at which a `depends_on` chain is considered cyclic.
const MAX_CHAIN_LENGTH: usize = 64;
const ANGLE_ALIASES: [(&str, &str); 2] = [("a3", "sample_angle"), ("a4", "instrument_angle")];
/// Number of frame-time bins for monitors recorded in event mode.
pub const MONITOR_EVENT_BINS: usize = 500;

/// A group with an `NX_class` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentInfo {
    pub name: String,
    pub nx_class: String,
    pub path: String,
}

/// An open NeXus file.
pub struct NexusFile {
    file: File,
    path: PathBuf,
}

fn nx_class(location: &Location) -> Result<Option<String>> {
    read_attr_opt_string(location, "NX_class")
}

fn units_of(location: &Location, default: Unit) -> Result<Unit> {
    match read_attr_opt_string(location, "units")? {
        Some(text) if !text.trim().is_empty() => Ok(Unit::parse(text.trim())?),
        _ => Ok(default),
    }
}

fn scale_to(location: &Location, default: Unit, target: &Unit) -> Result<f64> {
    Ok(units_of(location, default)?.conversion_factor(target)?)
}

/// Absolute path of `target` as seen from the group at `base`.
fn join_path(base: &str, target: &str) -> String {
    let mut parts: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        base.split('/').filter(|p| !p.is_empty()).collect()
    };
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_path(path: &str) -> &str {
    path.rfind('/').map_or("/", |i| if i == 0 { "/" } else { &path[..i] })
}

fn vector_attr(location: &Location, name: &str) -> Result<Option<Vector3<f64>>> {
    let Ok(attr) = location.attr(name) else {
        return Ok(None);
    };
    match attr.read_raw::<f64>()?.as_slice() {
        [x, y, z] => Ok(Some(Vector3::new(*x, *y, *z))),
        other => Err(Error::InvalidFormat(format!(
            "attribute '{name}' of {} must have three components, found {}",
            location.name(),
            other.len()
        ))),
    }
}

/// First value of a dataset, or of the `value` field of an `NXlog`.
fn first_value(file: &File, path: &str) -> Result<(f64, Unit)> {
    let dataset = if let Ok(ds) = file.dataset(path) {
        ds
    } else {
        file.dataset(&format!("{path}/value"))
            .map_err(|_| Error::MissingEntry(path.to_string()))?
    };
    let values = dataset.read_raw::<f64>()?;
    if values.len() > 1 {
        debug!("{path} holds {} values; using the first", values.len());
    }
    let value = values
        .first()
        .copied()
        .ok_or_else(|| Error::InvalidFormat(format!("{path} is empty")))?;
    Ok((value, units_of(&dataset, Unit::DIMENSIONLESS)?))
}

impl NexusFile {
    /// Opens a NeXus file for reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or has no `/entry`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        if file.group(ENTRY).is_err() {
            return Err(Error::MissingEntry(ENTRY.to_string()));
        }
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn group(&self, path: &str) -> Result<Group> {
        self.file
            .group(path)
            .map_err(|_| Error::MissingEntry(path.to_string()))
    }

    fn component(&self, name: &str) -> Result<Group> {
        self.group(&format!("{INSTRUMENT}/{name}"))
    }

    fn classed_children(&self, parent: &str) -> Result<Vec<ComponentInfo>> {
        let Ok(group) = self.file.group(parent) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for name in group.member_names()? {
            let Ok(child) = group.group(&name) else {
                continue;
            };
            if let Some(nx_class) = nx_class(&child)? {
                out.push(ComponentInfo {
                    path: format!("{parent}/{name}"),
                    name,
                    nx_class,
                });
            }
        }
        Ok(out)
    }

    /// Names of instrument components of one class, sorted.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn components(&self, class: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .classed_children(INSTRUMENT)?
            .into_iter()
            .filter(|c| c.nx_class == class)
            .map(|c| c.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// All classed groups directly below `/entry` and `/entry/instrument`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn summary(&self) -> Result<Vec<ComponentInfo>> {
        let mut all = self.classed_children(ENTRY)?;
        all.extend(self.classed_children(INSTRUMENT)?);
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }

    /// One `NXtransformations` entry and the path of the next in the chain.
    fn transformation(&self, path: &str) -> Result<(Isometry3<f64>, Option<String>)> {
        let location: Location = if let Ok(ds) = self.file.dataset(path) {
            let location: &Location = &ds;
            location.clone()
        } else if let Ok(group) = self.file.group(path) {
            let location: &Location = &group;
            location.clone()
        } else {
            return Err(Error::MissingEntry(path.to_string()));
        };

        let kind = read_attr_opt_string(&location, "transformation_type")?
            .ok_or_else(|| Error::MissingEntry(format!("{path}@transformation_type")))?;
        let vector = vector_attr(&location, "vector")?
            .ok_or_else(|| Error::MissingEntry(format!("{path}@vector")))?;
        let (value, unit) = first_value(&self.file, path)?;

        let motion = match kind.as_str() {
            "translation" => {
                let unit = if unit.is_dimensionless() { Unit::METER } else { unit };
                let meters = value * unit.conversion_factor(&Unit::METER)?;
                Isometry3::from_parts(
                    Translation3::from(vector.normalize() * meters),
                    UnitQuaternion::identity(),
                )
            }
            "rotation" => {
                let radians = value * default_angle(unit).conversion_factor(&Unit::RADIAN)?;
                let axis = nalgebra::Unit::new_normalize(vector);
                Isometry3::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_axis_angle(&axis, radians),
                )
            }
            other => {
                return Err(Error::InvalidFormat(format!(
                    "{path} has unknown transformation_type '{other}'"
                )))
            }
        };

        let offset = match vector_attr(&location, "offset")? {
            Some(offset) => {
                let scale = match read_attr_opt_string(&location, "offset_units")? {
                    Some(text) => Unit::parse(text.trim())?.conversion_factor(&Unit::METER)?,
                    None => 1.0,
                };
                Translation3::from(offset * scale)
            }
            None => Translation3::identity(),
        };

        let next = read_attr_opt_string(&location, "depends_on")?
            .filter(|d| d != ".")
            .map(|d| join_path(parent_path(path), &d));
        Ok((Isometry3::from_parts(offset, UnitQuaternion::identity()) * motion, next))
    }

    /// Transformation of a component from its local frame to the lab frame.
    ///
    /// Components without `depends_on` sit at the origin.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] for broken chain links and
    /// [`Error::InvalidFormat`] for cyclic chains or malformed entries.
    pub fn transform(&self, group_path: &str) -> Result<Isometry3<f64>> {
        let group = self.group(group_path)?;
        let Ok(depends_on) = group.dataset("depends_on") else {
            debug!("{group_path} has no depends_on; placing it at the origin");
            return Ok(Isometry3::identity());
        };
        let mut next = Some(read_string_dataset(&depends_on)?)
            .filter(|d| d != ".")
            .map(|d| join_path(group_path, &d));

        let mut total = Isometry3::identity();
        let mut steps = 0;
        while let Some(path) = next {
            steps += 1;
            if steps > MAX_CHAIN_LENGTH {
                return Err(Error::InvalidFormat(format!(
                    "depends_on chain of {group_path} does not terminate"
                )));
            }
            let (step, after) = self.transformation(&path)?;
            total = step * total;
            next = after;
        }
        Ok(total)
    }

    fn position(&self, group_path: &str) -> Result<Vector3<f64>> {
        Ok(self.transform(group_path)?.translation.vector)
    }

    fn first_of_class(&self, classes: &[&str]) -> Result<String> {
        let found = self
            .summary()?
            .into_iter()
            .find(|c| classes.contains(&c.nx_class.as_str()))
            .ok_or_else(|| Error::MissingEntry(format!("{INSTRUMENT}/<{}>", classes.join("|"))))?;
        Ok(found.path)
    }

    /// Position of the `NXsource` (or `NXmoderator`) in m.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] if the file has no source.
    pub fn source_position(&self) -> Result<Vector3<f64>> {
        self.position(&self.first_of_class(&["NXsource", "NXmoderator"])?)
    }

    /// Position of the `NXsample` in m.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] if the file has no sample.
    pub fn sample_position(&self) -> Result<Vector3<f64>> {
        self.position(&self.first_of_class(&["NXsample"])?)
    }

    /// Pixel positions in m, shaped like `detector_number`.
    fn pixel_positions(&self, detector_path: &str, group: &Group, n: usize) -> Result<Vec<Vector3<f64>>> {
        let transform = self.transform(detector_path)?;
        let mut offsets = Vec::with_capacity(3);
        for name in ["x_pixel_offset", "y_pixel_offset", "z_pixel_offset"] {
            let values = match group.dataset(name) {
                Ok(ds) => {
                    let scale = scale_to(&ds, Unit::METER, &Unit::METER)?;
                    ds.read_raw::<f64>()?.into_iter().map(|v| v * scale).collect()
                }
                Err(_) => vec![0.0; n],
            };
            if values.len() != n {
                return Err(Error::InvalidFormat(format!(
                    "{detector_path}/{name} has {} values for {n} pixels",
                    values.len()
                )));
            }
            offsets.push(values);
        }
        Ok((0..n)
            .map(|i| (transform * Point3::new(offsets[0][i], offsets[1][i], offsets[2][i])).coords)
            .collect())
    }

    fn event_group(&self, detector_path: &str, group: &Group) -> Result<Group> {
        for name in group.member_names()? {
            if let Ok(child) = group.group(&name) {
                if nx_class(&child)?.as_deref() == Some("NXevent_data") {
                    return Ok(child);
                }
            }
        }
        Err(Error::MissingEntry(format!("{detector_path}/<NXevent_data>")))
    }

    /// Events of an `NXevent_data` group, binned by `bin_of` event id.
    fn load_events(&self, events: &Group, bin_of: impl Fn(i64) -> Option<usize>) -> Result<EventTable> {
        let ids = read_dataset_vec::<i64>(events, "event_id")?;
        let eto_ds = events
            .dataset("event_time_offset")
            .map_err(|_| Error::MissingEntry(format!("{}/event_time_offset", events.name())))?;
        let eto_unit = units_of(&eto_ds, Unit::NANOSECOND)?;
        let eto = eto_ds.read_raw::<f64>()?;
        let etz_ds = events
            .dataset("event_time_zero")
            .map_err(|_| Error::MissingEntry(format!("{}/event_time_zero", events.name())))?;
        let etz = if units_of(&etz_ds, Unit::NANOSECOND)? == Unit::NANOSECOND {
            etz_ds.read_raw::<i64>()?
        } else {
            let scale = scale_to(&etz_ds, Unit::NANOSECOND, &Unit::NANOSECOND)?;
            etz_ds
                .read_raw::<f64>()?
                .into_iter()
                .map(|t| (t * scale).round() as i64)
                .collect()
        };
        let index = read_dataset_vec::<i64>(events, "event_index")?;
        if ids.len() != eto.len() || index.len() != etz.len() {
            return Err(Error::InvalidFormat(format!(
                "{}: {} event ids for {} offsets, {} pulse indices for {} pulse times",
                events.name(),
                ids.len(),
                eto.len(),
                index.len(),
                etz.len()
            )));
        }

        let mut pulse_of_event = vec![0usize; ids.len()];
        for (pulse, window) in index.iter().enumerate() {
            let start = usize::try_from(*window).unwrap_or(0).min(ids.len());
            let stop = index
                .get(pulse + 1)
                .map_or(ids.len(), |&next| usize::try_from(next).unwrap_or(0).min(ids.len()));
            for slot in pulse_of_event.iter_mut().take(stop).skip(start) {
                *slot = pulse;
            }
        }

        let mut bins = Vec::with_capacity(ids.len());
        let mut offsets = Vec::with_capacity(ids.len());
        let mut pulse_times = Vec::with_capacity(ids.len());
        let mut unknown = 0usize;
        for (i, &id) in ids.iter().enumerate() {
            let Some(bin) = bin_of(id) else {
                unknown += 1;
                continue;
            };
            bins.push(bin);
            offsets.push(eto[i]);
            pulse_times.push(etz.get(pulse_of_event[i]).copied().unwrap_or_default());
        }
        if unknown > 0 {
            warn!("{}: dropped {unknown} events with unknown event_id", events.name());
        }

        let mut table = EventTable::unit_weights(bins);
        table.insert_coord("event_time_offset", Variable::floats_1d(EVENT_DIM, offsets, eto_unit))?;
        table.insert_coord("event_time_zero", Variable::ints_1d(EVENT_DIM, pulse_times, Unit::NANOSECOND))?;
        Ok(table)
    }

    /// Events of one detector triplet, binned by pixel over `dim_0`, `dim_1`
    /// with `detector_number` and `position` coordinates.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] for missing groups or datasets.
    pub fn load_triplet(&self, name: &str) -> Result<DataArray> {
        let path = format!("{INSTRUMENT}/{name}");
        let group = self.component(name)?;
        let number_ds = group
            .dataset("detector_number")
            .map_err(|_| Error::MissingEntry(format!("{path}/detector_number")))?;
        let shape = number_ds.shape();
        let numbers = number_ds.read_raw::<i64>()?;
        let dims: Vec<String> = (0..shape.len()).map(|i| format!("dim_{i}")).collect();
        let dims: Vec<&str> = dims.iter().map(String::as_str).collect();

        let pixel_of: HashMap<i64, usize> = numbers.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let events = self.event_group(&path, &group)?;
        let table = self.load_events(&events, |id| pixel_of.get(&id).copied())?;
        let positions = self.pixel_positions(&path, &group, numbers.len())?;

        let n_events = table.len();
        let mut data = DataArray::binned(&dims, &shape, table, Unit::COUNTS)?;
        data.insert_coord(
            "detector_number",
            Variable::from_shape_vec(&dims, &shape, numbers, Unit::DIMENSIONLESS)?,
        )?;
        data.insert_coord("position", Variable::from_shape_vec(&dims, &shape, positions, Unit::METER)?)?;
        debug!("Loaded {n_events} events for {name} with shape {shape:?}");
        Ok(data)
    }

    /// Crystal analyzer from an `NXcrystal` with `d_spacing`.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] for missing groups or datasets.
    pub fn load_analyzer(&self, name: &str) -> Result<Analyzer> {
        let path = format!("{INSTRUMENT}/{name}");
        let group = self.component(name)?;
        let dspacing_ds = group
            .dataset("d_spacing")
            .map_err(|_| Error::MissingEntry(format!("{path}/d_spacing")))?;
        let dspacing = dspacing_ds
            .read_raw::<f64>()?
            .first()
            .copied()
            .ok_or_else(|| Error::InvalidFormat(format!("{path}/d_spacing is empty")))?;
        let unit = units_of(&dspacing_ds, Unit::ANGSTROM)?;
        let transform = self.transform(&path)?;
        Ok(Analyzer::new(dspacing, unit, transform.translation.vector, transform))
    }

    /// Monitor histogram over frame time `t` with bin edges and `position`.
    ///
    /// Monitors without a `data` histogram are read in event mode and
    /// histogrammed over one pulse period of `source`.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] for missing groups or datasets.
    pub fn load_monitor(&self, name: &str, source: &Source) -> Result<DataArray> {
        let path = format!("{INSTRUMENT}/{name}");
        let group = self.component(name)?;
        let mut monitor = if let Ok(data) = group.dataset("data") {
            self.histogram_monitor(&path, &group, &data)?
        } else {
            self.event_mode_monitor(&path, &group, source)?
        };
        monitor.insert_coord("position", Variable::vector(self.position(&path)?, Unit::METER))?;
        info!("Loaded monitor {name} with {} time bins", monitor.shape()[0]);
        Ok(monitor)
    }

    fn histogram_monitor(&self, path: &str, group: &Group, data: &Dataset) -> Result<DataArray> {
        let counts = data.read_raw::<f64>()?;
        let n = counts.len();
        let axis = ["time_of_flight", "time", "t"]
            .into_iter()
            .find_map(|name| group.dataset(name).ok())
            .ok_or_else(|| Error::MissingEntry(format!("{path}/time_of_flight")))?;
        let unit = units_of(&axis, Unit::MICROSECOND)?;
        let axis_values = axis.read_raw::<f64>()?;
        let edges = if axis_values.len() == n + 1 {
            axis_values
        } else if axis_values.len() == n && n > 1 {
            edges_from_centers(&axis_values)
        } else {
            return Err(Error::InvalidFormat(format!(
                "{path}: {} time values for {n} counts",
                axis_values.len()
            )));
        };

        let variances = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&[n]), counts.clone())
            .map_err(|e| Error::InvalidFormat(e.to_string()))?;
        let mut monitor = DataArray::dense(&Variable::floats_1d("t", counts, Unit::COUNTS), Some(variances))?;
        monitor.insert_edges("t", "t", Variable::floats_1d("t", edges, unit))?;
        Ok(monitor)
    }

    fn event_mode_monitor(&self, path: &str, group: &Group, source: &Source) -> Result<DataArray> {
        let events = self.event_group(path, group)?;
        let table = self.load_events(&events, |_| Some(0))?;
        let binned = DataArray::binned(&["pixel"], &[1], table, Unit::COUNTS)?;
        let period_ns = source.period_seconds() * 1e9;
        let spec = BinSpec::linspace("t", 0.0, period_ns, MONITOR_EVENT_BINS, Unit::NANOSECOND);
        let mut monitor = hist_events(&binned, &[("event_time_offset", spec)])?.rename_dim("event_time_offset", "t");
        if let Some(edges) = monitor.remove_coord("event_time_offset") {
            monitor.insert_edges("t", "t", edges.var)?;
        }
        Ok(monitor)
    }

    fn find_log(&self, name: &str) -> Option<String> {
        let alias = ANGLE_ALIASES
            .iter()
            .find(|(short, _)| *short == name)
            .map(|(_, long)| *long);
        std::iter::once(name)
            .chain(alias)
            .flat_map(|name| {
                ["/entry/parameters", INSTRUMENT, "/entry/sample", ENTRY]
                    .into_iter()
                    .map(move |parent| format!("{parent}/{name}"))
            })
            .find(|path| self.file.group(path).is_ok() || self.file.dataset(path).is_ok())
    }

    /// Instrument angle `a3` or `a4`, fixed or logged over time. The long
    /// names `sample_angle` and `instrument_angle` are accepted as well.
    ///
    /// Log times are taken as epoch times in the same clock as
    /// `event_time_zero`.
    ///
    /// # Errors
    /// Returns [`Error::MissingEntry`] if no log or value of that name exists.
    pub fn load_angle(&self, name: &str) -> Result<InstrumentAngle> {
        let path = self
            .find_log(name)
            .ok_or_else(|| Error::MissingEntry(format!("{ENTRY}/parameters/{name}")))?;
        let Ok(log) = self.file.group(&path) else {
            let (value, unit) = first_value(&self.file, &path)?;
            return Ok(InstrumentAngle::Fixed(Variable::scalar(value, default_angle(unit))));
        };
        let value_ds = log
            .dataset("value")
            .map_err(|_| Error::MissingEntry(format!("{path}/value")))?;
        let unit = default_angle(units_of(&value_ds, Unit::DEGREE)?);
        let values = value_ds.read_raw::<f64>()?;
        let Some(&first) = values.first() else {
            return Err(Error::InvalidFormat(format!("{path}/value is empty")));
        };
        match read_dataset_vec_opt::<f64>(&log, "time")? {
            Some(time) if values.len() > 1 => {
                let time_unit = units_of(&log.dataset("time")?, Unit::SECOND)?;
                debug!("{name} logged with {} entries", values.len());
                Ok(InstrumentAngle::Logged {
                    time: Variable::floats_1d("time", time, time_unit),
                    value: Variable::floats_1d("time", values, unit),
                })
            }
            _ => Ok(InstrumentAngle::Fixed(Variable::scalar(first, unit))),
        }
    }

    /// Disk choppers with position and opening delay.
    ///
    /// # Errors
    /// Returns an error if a chopper's geometry cannot be resolved.
    pub fn load_choppers(&self) -> Result<Vec<Chopper>> {
        self.components("NXdisk_chopper")?
            .into_iter()
            .map(|name| {
                let path = format!("{INSTRUMENT}/{name}");
                let delay = match first_value(&self.file, &format!("{path}/delay")) {
                    Ok((value, unit)) => {
                        let unit = if unit.is_dimensionless() { Unit::SECOND } else { unit };
                        value * unit.conversion_factor(&Unit::SECOND)?
                    }
                    Err(Error::MissingEntry(_)) => {
                        debug!("{path} has no delay");
                        0.0
                    }
                    Err(e) => return Err(e),
                };
                Ok(Chopper {
                    position: self.position(&path)?,
                    name,
                    delay,
                })
            })
            .collect()
    }

    /// Accumulated proton charge, if recorded.
    ///
    /// # Errors
    /// Returns an error if the value exists but cannot be read.
    pub fn load_proton_charge(&self) -> Result<Option<Variable>> {
        let path = format!("{ENTRY}/proton_charge");
        if self.file.dataset(&path).is_err() && self.file.group(&path).is_err() {
            return Ok(None);
        }
        let (value, unit) = first_value(&self.file, &path)?;
        let unit = if unit.is_dimensionless() { Unit::MICRO_AMPERE_HOUR } else { unit };
        Ok(Some(Variable::scalar(value, unit)))
    }

    /// Everything the reduction needs from this file.
    ///
    /// Triplets are the `NXdetector` components paired with analyzers; at
    /// most `max_triplets` of them are loaded, in name order.
    ///
    /// # Errors
    /// Returns an error for missing components or unmatched analyzers.
    pub fn load_run(&self, config: &ReductionConfig, max_triplets: Option<usize>) -> Result<RunInput> {
        let detectors = self.components("NXdetector")?;
        let analyzers = self.components("NXcrystal")?;
        let mut detectors: Vec<String> = detectors.into_iter().filter(|d| d.contains("triplet")).collect();
        if let Some(max) = max_triplets {
            detectors.truncate(max);
        }
        if detectors.is_empty() {
            return Err(bifrost_core::Error::NoTriplets.into());
        }
        let pairs = AnalyzerMap::build(&analyzers, &detectors)?;

        let triplets = pairs
            .iter()
            .map(|(detector, analyzer)| {
                Ok(TripletInput {
                    name: detector.to_string(),
                    events: self.load_triplet(detector)?,
                    analyzer: self.load_analyzer(analyzer)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let proton_charge = match (config.normalization.proton_charge_uah, self.load_proton_charge()?) {
            (Some(uah), _) => Variable::scalar(uah, Unit::MICRO_AMPERE_HOUR),
            (None, Some(charge)) => charge,
            (None, None) => {
                warn!("No proton charge in {} or the configuration; using 1 µAh", self.path.display());
                Variable::scalar(1.0, Unit::MICRO_AMPERE_HOUR)
            }
        };

        let source = config.source.source();
        let run = RunInput {
            monitor: self.load_monitor(&config.normalization.monitor, &source)?,
            source_position: self.source_position()?,
            sample_position: self.sample_position()?,
            a3: self.load_angle("a3")?,
            a4: self.load_angle("a4")?,
            proton_charge,
            triplets,
        };
        info!(
            "Loaded {} triplets from {}",
            run.triplets.len(),
            self.path.display()
        );
        Ok(run)
    }
}

fn default_angle(unit: Unit) -> Unit {
    if unit.is_dimensionless() {
        Unit::DEGREE
    } else {
        unit
    }
}

fn edges_from_centers(centers: &[f64]) -> Vec<f64> {
    let n = centers.len();
    let mut edges = Vec::with_capacity(n + 1);
    edges.push(centers[0] - 0.5 * (centers[1] - centers[0]));
    edges.extend(centers.windows(2).map(|w| 0.5 * (w[0] + w[1])));
    edges.push(centers[n - 1] + 0.5 * (centers[n - 1] - centers[n - 2]));
    edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdf5::set_attr_str;
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};
    use tempfile::NamedTempFile;

    fn string_dataset(group: &Group, name: &str, value: &str) {
        group
            .new_dataset::<hdf5::types::VarLenUnicode>()
            .create(name)
            .unwrap()
            .write_scalar(&crate::hdf5::to_var_len_unicode(value).unwrap())
            .unwrap();
    }

    fn translation(group: &Group, name: &str, value: f64, vector: [f64; 3], units: &str, depends_on: &str) {
        let ds = group.new_dataset::<f64>().create(name).unwrap();
        ds.write_scalar(&value).unwrap();
        set_attr_str(&ds, "transformation_type", "translation").unwrap();
        set_attr_str(&ds, "units", units).unwrap();
        set_attr_str(&ds, "depends_on", depends_on).unwrap();
        ds.new_attr::<f64>()
            .shape(3)
            .create("vector")
            .unwrap()
            .write(&arr1(&vector))
            .unwrap();
    }

    fn classed(parent: &Group, name: &str, class: &str) -> Group {
        let group = parent.create_group(name).unwrap();
        set_attr_str(&group, "NX_class", class).unwrap();
        group
    }

    fn write_file() -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        let file = File::create(tmp.path()).unwrap();
        let entry = classed(&file, "entry", "NXentry");
        let instrument = classed(&entry, "instrument", "NXinstrument");

        let source = classed(&instrument, "source", "NXsource");
        let t = classed(&source, "transformations", "NXtransformations");
        translation(&t, "z", -162.0, [0.0, 0.0, 1.0], "m", ".");
        string_dataset(&source, "depends_on", "transformations/z");

        let sample = classed(&instrument, "sample", "NXsample");
        string_dataset(&sample, "depends_on", ".");

        // Detector: 20 cm along x in cm, stacked on a 1 m translation along z.
        let detector = classed(&instrument, "047_triplet", "NXdetector");
        detector
            .new_dataset::<i64>()
            .shape((2, 2))
            .create("detector_number")
            .unwrap()
            .write(&arr2(&[[1_i64, 2], [3, 4]]))
            .unwrap();
        let t = classed(&detector, "transformations", "NXtransformations");
        translation(&t, "x", 20.0, [1.0, 0.0, 0.0], "cm", "z");
        translation(&t, "z", 1.0, [0.0, 0.0, 1.0], "m", ".");
        string_dataset(&detector, "depends_on", "transformations/x");
        detector
            .new_dataset::<f64>()
            .shape(4)
            .create("y_pixel_offset")
            .unwrap()
            .write(&arr1(&[0.0, 0.01, 0.02, 0.03]))
            .unwrap();
        let events = classed(&detector, "events", "NXevent_data");
        events
            .new_dataset::<i64>()
            .shape(4)
            .create("event_id")
            .unwrap()
            .write(&arr1(&[1_i64, 4, 4, 99]))
            .unwrap();
        let eto = events.new_dataset::<f64>().shape(4).create("event_time_offset").unwrap();
        eto.write(&arr1(&[10.0, 20.0, 30.0, 40.0])).unwrap();
        set_attr_str(&eto, "units", "ns").unwrap();
        events
            .new_dataset::<i64>()
            .shape(2)
            .create("event_time_zero")
            .unwrap()
            .write(&arr1(&[1000_i64, 2000]))
            .unwrap();
        events
            .new_dataset::<i64>()
            .shape(2)
            .create("event_index")
            .unwrap()
            .write(&arr1(&[0_i64, 2]))
            .unwrap();

        let crystal = classed(&instrument, "045_analyzer", "NXcrystal");
        let d = crystal.new_dataset::<f64>().create("d_spacing").unwrap();
        d.write_scalar(&3.355).unwrap();
        set_attr_str(&d, "units", "angstrom").unwrap();

        let monitor = classed(&instrument, "110_frame_3", "NXmonitor");
        monitor
            .new_dataset::<f64>()
            .shape(3)
            .create("data")
            .unwrap()
            .write(&arr1(&[4.0, 5.0, 6.0]))
            .unwrap();
        let tof = monitor.new_dataset::<f64>().shape(4).create("time_of_flight").unwrap();
        tof.write(&arr1(&[0.0, 1.0, 2.0, 3.0])).unwrap();
        set_attr_str(&tof, "units", "ms").unwrap();

        let parameters = classed(&entry, "parameters", "NXcollection");
        let a3 = classed(&parameters, "a3", "NXlog");
        a3.new_dataset::<f64>()
            .shape(2)
            .create("value")
            .unwrap()
            .write(&arr1(&[0.0, 2.0]))
            .unwrap();
        let time = a3.new_dataset::<f64>().shape(2).create("time").unwrap();
        time.write(&arr1(&[500.0, 1500.0])).unwrap();
        set_attr_str(&time, "units", "ns").unwrap();
        let a4 = parameters.new_dataset::<f64>().create("instrument_angle").unwrap();
        a4.write_scalar(&-30.0).unwrap();
        set_attr_str(&a4, "units", "deg").unwrap();
        tmp
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/entry/det", "transformations/x"), "/entry/det/transformations/x");
        assert_eq!(join_path("/entry/det/transformations", "../t/y"), "/entry/det/t/y");
        assert_eq!(join_path("/entry/det", "/abs/path"), "/abs/path");
    }

    #[test]
    fn test_components_by_class() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        assert_eq!(nexus.components("NXdetector").unwrap(), ["047_triplet"]);
        assert_eq!(nexus.components("NXcrystal").unwrap(), ["045_analyzer"]);
        let summary = nexus.summary().unwrap();
        assert!(summary.iter().any(|c| c.path == "/entry/instrument/110_frame_3" && c.nx_class == "NXmonitor"));
    }

    #[test]
    fn test_depends_on_chain_positions() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        assert_relative_eq!(nexus.source_position().unwrap(), Vector3::new(0.0, 0.0, -162.0));
        assert_relative_eq!(nexus.sample_position().unwrap(), Vector3::zeros());
        let transform = nexus.transform("/entry/instrument/047_triplet").unwrap();
        assert_relative_eq!(transform.translation.vector, Vector3::new(0.2, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_load_triplet_bins_events_by_pixel() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        let triplet = nexus.load_triplet("047_triplet").unwrap();
        assert_eq!(triplet.dims(), ["dim_0", "dim_1"]);
        // The event with id 99 has no pixel.
        assert_eq!(triplet.event_count(), 3);
        let events = triplet.events().unwrap();
        assert_eq!(events.bin, vec![0, 3, 3]);
        let etz = events.coord("event_time_zero").unwrap().to_vec::<i64>().unwrap();
        assert_eq!(etz, vec![1000, 1000, 2000]);
        let positions = triplet.coord("position").unwrap().to_vec::<Vector3<f64>>().unwrap();
        assert_relative_eq!(positions[3], Vector3::new(0.2, 0.03, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_load_analyzer_and_monitor() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        let analyzer = nexus.load_analyzer("045_analyzer").unwrap();
        assert_relative_eq!(
            analyzer.dspacing.to_unit(&Unit::ANGSTROM).unwrap().value::<f64>().unwrap(),
            3.355
        );
        let monitor = nexus.load_monitor("110_frame_3", &bifrost_spectrometer::ESS_SOURCE).unwrap();
        assert_eq!(monitor.dims(), ["t"]);
        assert!(monitor.coord_entry("t").unwrap().is_edges());
        assert_eq!(monitor.coord("t").unwrap().unit(), Unit::MILLISECOND);
        assert_relative_eq!(monitor.total(), 15.0);
    }

    #[test]
    fn test_load_angles() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        let a3 = nexus.load_angle("a3").unwrap();
        assert!(matches!(a3, InstrumentAngle::Logged { .. }));
        let a4 = nexus.load_angle("a4").unwrap();
        assert!(matches!(a4, InstrumentAngle::Fixed(ref v) if v.value::<f64>().unwrap() == -30.0));
        assert!(matches!(nexus.load_angle("a5"), Err(Error::MissingEntry(_))));
    }

    #[test]
    fn test_load_run_pairs_triplets_with_analyzers() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        let config = ReductionConfig::bifrost_defaults().with_proton_charge(2.0);
        let run = nexus.load_run(&config, None).unwrap();
        assert_eq!(run.triplets.len(), 1);
        assert_eq!(run.triplets[0].name, "047_triplet");
        assert_relative_eq!(run.proton_charge.value::<f64>().unwrap(), 2.0);
        assert_relative_eq!(run.source_position.z, -162.0);
    }

    #[test]
    fn test_missing_component_names_the_path() {
        let tmp = write_file();
        let nexus = NexusFile::open(tmp.path()).unwrap();
        let err = nexus.load_triplet("048_triplet").unwrap_err();
        assert!(matches!(err, Error::MissingEntry(path) if path == "/entry/instrument/048_triplet"));
    }
}
