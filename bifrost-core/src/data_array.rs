//! Labeled data arrays.
//!
//! A [`DataArray`] couples bulk data (dense values or binned events) with
//! named coordinates and masks. Every coordinate carries an explicit
//! [`CoordKind`] tag: point-wise coordinates have one value per element,
//! bin-edge coordinates have one more value than the data along their dim.

use crate::error::{Error, Result};
use crate::events::{EventTable, EVENT_DIM};
use crate::units::Unit;
use crate::variable::{DType, Variable};
use log::{debug, warn};
use ndarray::{ArrayD, Axis, IxDyn};
use std::collections::BTreeMap;

/// Whether a coordinate holds point values or bin edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordKind {
    /// One value per data element.
    Point,
    /// One more value than data elements along `dim`.
    BinEdges { dim: String },
}

/// A coordinate together with its kind tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Coord {
    pub kind: CoordKind,
    pub var: Variable,
}

impl Coord {
    /// A point-wise coordinate.
    #[must_use]
    pub fn point(var: Variable) -> Self {
        Self {
            kind: CoordKind::Point,
            var,
        }
    }

    /// A bin-edge coordinate along `dim`.
    #[must_use]
    pub fn edges(dim: &str, var: Variable) -> Self {
        Self {
            kind: CoordKind::BinEdges {
                dim: dim.to_string(),
            },
            var,
        }
    }

    /// True for bin-edge coordinates.
    #[must_use]
    pub fn is_edges(&self) -> bool {
        matches!(self.kind, CoordKind::BinEdges { .. })
    }
}

/// Bulk content of a [`DataArray`].
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Dense values with optional variances, shaped like the array.
    Dense {
        values: ArrayD<f64>,
        variances: Option<ArrayD<f64>>,
    },
    /// Events grouped into the bins of the array.
    Binned(EventTable),
}

/// Data with named dimensions, coordinates and masks.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    dims: Vec<String>,
    shape: Vec<usize>,
    unit: Unit,
    content: Content,
    coords: BTreeMap<String, Coord>,
    masks: BTreeMap<String, Variable>,
}

impl DataArray {
    /// Dense data array from a float variable and optional variances.
    ///
    /// # Errors
    /// Returns an error if `data` is not float or variances have the wrong shape.
    pub fn dense(data: &Variable, variances: Option<ArrayD<f64>>) -> Result<Self> {
        let values = data.floats()?.as_standard_layout().into_owned();
        if let Some(v) = &variances {
            if v.shape() != values.shape() {
                return Err(Error::ShapeMismatch(format!(
                    "variances of shape {:?} for values of shape {:?}",
                    v.shape(),
                    values.shape()
                )));
            }
        }
        Ok(Self {
            dims: data.dims().to_vec(),
            shape: data.shape().to_vec(),
            unit: data.unit(),
            content: Content::Dense { values, variances },
            coords: BTreeMap::new(),
            masks: BTreeMap::new(),
        })
    }

    /// Binned data array with the given bin layout.
    ///
    /// # Errors
    /// Returns an error if an event refers to a bin outside the layout.
    pub fn binned(dims: &[&str], shape: &[usize], events: EventTable, unit: Unit) -> Result<Self> {
        if dims.len() != shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "dims {dims:?} do not match shape {shape:?}"
            )));
        }
        let n_bins: usize = shape.iter().product();
        if let Some(&bad) = events.bin.iter().find(|&&b| b >= n_bins) {
            return Err(Error::ShapeMismatch(format!(
                "event bin {bad} out of range for {n_bins} bins"
            )));
        }
        Ok(Self {
            dims: dims.iter().map(ToString::to_string).collect(),
            shape: shape.to_vec(),
            unit,
            content: Content::Binned(events),
            coords: BTreeMap::new(),
            masks: BTreeMap::new(),
        })
    }

    /// Dimension labels.
    #[must_use]
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Shape, ordered like [`DataArray::dims`].
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Size of a dimension, if present.
    #[must_use]
    pub fn size_of(&self, dim: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.shape[i])
    }

    /// Number of bins (or dense elements).
    #[must_use]
    pub fn n_bins(&self) -> usize {
        self.shape.iter().product()
    }

    /// Unit of values or event weights.
    #[must_use]
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Bulk content.
    #[must_use]
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Events, if this array is binned.
    #[must_use]
    pub fn events(&self) -> Option<&EventTable> {
        match &self.content {
            Content::Binned(events) => Some(events),
            Content::Dense { .. } => None,
        }
    }

    /// Mutable events, if this array is binned.
    pub fn events_mut(&mut self) -> Option<&mut EventTable> {
        match &mut self.content {
            Content::Binned(events) => Some(events),
            Content::Dense { .. } => None,
        }
    }

    /// Events of a binned array.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for dense arrays.
    pub fn require_events(&self) -> Result<&EventTable> {
        self.events()
            .ok_or_else(|| Error::Unsupported("operation requires event data".to_string()))
    }

    /// Dense values and variances.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for binned arrays.
    pub fn dense_values(&self) -> Result<(&ArrayD<f64>, Option<&ArrayD<f64>>)> {
        match &self.content {
            Content::Dense { values, variances } => Ok((values, variances.as_ref())),
            Content::Binned(_) => Err(Error::Unsupported(
                "operation requires dense data".to_string(),
            )),
        }
    }

    /// Dense values as a variable.
    ///
    /// # Errors
    /// Returns [`Error::Unsupported`] for binned arrays.
    pub fn data(&self) -> Result<Variable> {
        let (values, _) = self.dense_values()?;
        let dims: Vec<&str> = self.dims.iter().map(String::as_str).collect();
        Variable::from_array(&dims, values.clone(), self.unit)
    }

    /// Replace the content and unit, keeping coordinates and masks.
    ///
    /// # Errors
    /// Returns an error if the new content does not fit the layout.
    pub fn with_content(mut self, content: Content, unit: Unit) -> Result<Self> {
        match &content {
            Content::Dense { values, .. } if values.shape() != self.shape.as_slice() => {
                return Err(Error::ShapeMismatch(format!(
                    "values of shape {:?} for array of shape {:?}",
                    values.shape(),
                    self.shape
                )));
            }
            Content::Binned(events) if events.bin.iter().any(|&b| b >= self.n_bins()) => {
                return Err(Error::ShapeMismatch("event bin out of range".to_string()));
            }
            _ => {}
        }
        self.content = content;
        self.unit = unit;
        Ok(self)
    }

    /// Coordinates.
    #[must_use]
    pub fn coords(&self) -> &BTreeMap<String, Coord> {
        &self.coords
    }

    /// Coordinate entry by name, including its kind.
    #[must_use]
    pub fn coord_entry(&self, name: &str) -> Option<&Coord> {
        self.coords.get(name)
    }

    /// Coordinate values by name.
    ///
    /// # Errors
    /// Returns [`Error::MissingCoordinate`] if there is no such coordinate.
    pub fn coord(&self, name: &str) -> Result<&Variable> {
        self.coords
            .get(name)
            .map(|c| &c.var)
            .ok_or_else(|| Error::MissingCoordinate(name.to_string()))
    }

    /// True if `name` is a coordinate of the array or of its events.
    #[must_use]
    pub fn has_coord(&self, name: &str) -> bool {
        self.coords.contains_key(name)
            || self.events().is_some_and(|e| e.coords.contains_key(name))
    }

    /// Insert or replace a point-wise coordinate.
    ///
    /// # Errors
    /// Returns an error if the coordinate has dimensions not in the array or
    /// sizes that disagree.
    pub fn insert_coord(&mut self, name: &str, var: Variable) -> Result<()> {
        self.check_dims(name, &var, None)?;
        self.coords.insert(name.to_string(), Coord::point(var));
        Ok(())
    }

    /// Insert or replace a bin-edge coordinate along `dim`.
    ///
    /// # Errors
    /// Returns an error if the coordinate does not have `size + 1` values along `dim`.
    pub fn insert_edges(&mut self, name: &str, dim: &str, var: Variable) -> Result<()> {
        self.check_dims(name, &var, Some(dim))?;
        self.coords
            .insert(name.to_string(), Coord::edges(dim, var));
        Ok(())
    }

    /// Insert a coordinate entry as-is after validating it.
    ///
    /// # Errors
    /// Returns an error if the coordinate does not fit the array.
    pub fn insert_coord_entry(&mut self, name: &str, coord: Coord) -> Result<()> {
        match coord.kind {
            CoordKind::Point => self.insert_coord(name, coord.var),
            CoordKind::BinEdges { dim } => self.insert_edges(name, &dim, coord.var),
        }
    }

    fn check_dims(&self, name: &str, var: &Variable, edges: Option<&str>) -> Result<()> {
        for (dim, &size) in var.dims().iter().zip(var.shape()) {
            let expected = self.size_of(dim).ok_or_else(|| {
                Error::ShapeMismatch(format!(
                    "coordinate '{name}' has dimension '{dim}' not in {:?}",
                    self.dims
                ))
            })?;
            let expected = if edges == Some(dim.as_str()) {
                expected + 1
            } else {
                expected
            };
            if size != expected {
                return Err(Error::DimensionMismatch {
                    dim: dim.clone(),
                    expected,
                    found: size,
                });
            }
        }
        if let Some(dim) = edges {
            if !var.has_dim(dim) {
                return Err(Error::ShapeMismatch(format!(
                    "bin edges '{name}' lack dimension '{dim}'"
                )));
            }
        }
        Ok(())
    }

    /// Remove a coordinate, returning it.
    pub fn remove_coord(&mut self, name: &str) -> Option<Coord> {
        self.coords.remove(name)
    }

    /// Masks.
    #[must_use]
    pub fn masks(&self) -> &BTreeMap<String, Variable> {
        &self.masks
    }

    /// Insert or replace a boolean mask.
    ///
    /// # Errors
    /// Returns an error if the mask is not boolean or does not fit the array.
    pub fn insert_mask(&mut self, name: &str, mask: Variable) -> Result<()> {
        if mask.dtype() != DType::Bool {
            return Err(Error::type_mismatch(name, "boolean mask values"));
        }
        self.check_dims(name, &mask, None)?;
        self.masks.insert(name.to_string(), mask);
        Ok(())
    }

    /// Union of all masks broadcast to the full shape, row-major.
    ///
    /// # Errors
    /// Returns an error if a mask cannot be broadcast.
    pub fn combined_mask(&self) -> Result<Vec<bool>> {
        let mut combined = vec![false; self.n_bins()];
        for mask in self.masks.values() {
            let full = mask.broadcast(&self.dims, &self.shape)?;
            for (c, &m) in combined.iter_mut().zip(full.bools()?.iter()) {
                *c |= m;
            }
        }
        Ok(combined)
    }

    /// Point-wise coordinate broadcast and gathered to one value per event.
    ///
    /// Event coordinates are returned as-is.
    ///
    /// # Errors
    /// Returns an error for dense arrays, missing or bin-edge coordinates.
    pub fn event_coord(&self, name: &str) -> Result<Variable> {
        let events = self.require_events()?;
        if let Some(var) = events.coords.get(name) {
            return Ok(var.clone());
        }
        let coord = self
            .coords
            .get(name)
            .ok_or_else(|| Error::MissingCoordinate(name.to_string()))?;
        if coord.is_edges() {
            return Err(Error::Unsupported(format!(
                "bin-edge coordinate '{name}' cannot be assigned to events"
            )));
        }
        coord
            .var
            .gather(&self.dims, &self.shape, &events.bin, EVENT_DIM)
    }

    /// Relabel a dimension in data, coordinates and masks.
    #[must_use]
    pub fn rename_dim(mut self, from: &str, to: &str) -> Self {
        for dim in &mut self.dims {
            if dim == from {
                *dim = to.to_string();
            }
        }
        for coord in self.coords.values_mut() {
            coord.var = coord.var.clone().rename_dim(from, to);
            if let CoordKind::BinEdges { dim } = &mut coord.kind {
                if dim == from {
                    *dim = to.to_string();
                }
            }
        }
        for mask in self.masks.values_mut() {
            *mask = mask.clone().rename_dim(from, to);
        }
        self
    }

    /// Row-major multi-index of a flat bin index.
    #[must_use]
    pub fn unravel(&self, mut flat: usize) -> Vec<usize> {
        let mut index = vec![0; self.shape.len()];
        for (i, &size) in self.shape.iter().enumerate().rev() {
            if size > 0 {
                index[i] = flat % size;
                flat /= size;
            }
        }
        index
    }

    /// Sum of values (dense) or event weights (binned).
    #[must_use]
    pub fn total(&self) -> f64 {
        match &self.content {
            Content::Dense { values, .. } => values.sum(),
            Content::Binned(events) => events.total_weight(),
        }
    }

    /// Number of events (binned) or elements (dense).
    #[must_use]
    pub fn event_count(&self) -> usize {
        match &self.content {
            Content::Dense { values, .. } => values.len(),
            Content::Binned(events) => events.len(),
        }
    }

    /// Stack arrays with identical layout along a new leading dimension.
    ///
    /// Coordinates and masks that are equal in all parts are kept once,
    /// others are stacked along `dim`.
    ///
    /// # Errors
    /// Returns an error if layouts, units or coordinate sets differ.
    pub fn stack(parts: &[DataArray], dim: &str) -> Result<DataArray> {
        let first = parts
            .first()
            .ok_or_else(|| Error::ShapeMismatch("nothing to stack".to_string()))?;
        for part in parts {
            if part.dims != first.dims || part.shape != first.shape {
                return Err(Error::ShapeMismatch(format!(
                    "cannot stack dims {:?} {:?} with {:?} {:?}",
                    part.dims, part.shape, first.dims, first.shape
                )));
            }
            if !part.unit.same_dimension(&first.unit) {
                return Err(Error::IncompatibleUnits {
                    from: part.unit.to_string(),
                    to: first.unit.to_string(),
                });
            }
        }
        let mut dims = vec![dim.to_string()];
        dims.extend(first.dims.iter().cloned());
        let mut shape = vec![parts.len()];
        shape.extend(first.shape.iter().copied());

        let content = match &first.content {
            Content::Dense { .. } => {
                let mut values = Vec::with_capacity(parts.len());
                let mut variances = Vec::with_capacity(parts.len());
                for part in parts {
                    let (v, var) = part.dense_values()?;
                    values.push(v.view());
                    variances.push(var.map(ArrayD::view));
                }
                let stacked = ndarray::stack(Axis(0), &values)
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
                let stacked_variances = if variances.iter().all(Option::is_some) {
                    let views: Vec<_> = variances.into_iter().flatten().collect();
                    Some(
                        ndarray::stack(Axis(0), &views)
                            .map_err(|e| Error::ShapeMismatch(e.to_string()))?,
                    )
                } else {
                    None
                };
                Content::Dense {
                    values: stacked,
                    variances: stacked_variances,
                }
            }
            Content::Binned(_) => {
                let inner = first.n_bins();
                let mut events = EventTable::default();
                for (i, part) in parts.iter().enumerate() {
                    let theirs = part.require_events()?;
                    if i == 0 {
                        events = theirs.clone();
                    } else {
                        events.append(theirs, i * inner)?;
                    }
                }
                Content::Binned(events)
            }
        };

        let mut coords = BTreeMap::new();
        for (name, coord) in &first.coords {
            let all: Vec<&Coord> = parts
                .iter()
                .map(|p| {
                    p.coords.get(name).ok_or_else(|| {
                        Error::MissingCoordinate(format!("{name} (required to stack along {dim})"))
                    })
                })
                .collect::<Result<_>>()?;
            if all.iter().all(|c| *c == coord) {
                coords.insert(name.clone(), coord.clone());
            } else {
                let vars: Vec<Variable> = all.iter().map(|c| c.var.clone()).collect();
                let stacked = Variable::stack(&vars, dim)?;
                coords.insert(
                    name.clone(),
                    Coord {
                        kind: coord.kind.clone(),
                        var: stacked,
                    },
                );
            }
        }
        let mut masks = BTreeMap::new();
        for (name, mask) in &first.masks {
            let all: Vec<Variable> = parts
                .iter()
                .filter_map(|p| p.masks.get(name).cloned())
                .collect();
            if all.len() == parts.len() && all.iter().all(|m| m == mask) {
                masks.insert(name.clone(), mask.clone());
            } else if all.len() == parts.len() {
                masks.insert(name.clone(), Variable::stack(&all, dim)?);
            } else {
                warn!(
                    "Dropping mask '{name}': present in {} of {} stacked parts",
                    all.len(),
                    parts.len()
                );
            }
        }

        let shared = coords
            .values()
            .filter(|c: &&Coord| !c.var.has_dim(dim))
            .count();
        debug!(
            "Stacked {} parts along '{dim}' into {shape:?} ({shared} of {} coords shared)",
            parts.len(),
            coords.len()
        );
        Ok(DataArray {
            dims,
            shape,
            unit: first.unit,
            content,
            coords,
            masks,
        })
    }

    /// Split `dim` into new consecutive dimensions.
    ///
    /// Bin indices are unchanged since the split is row-major.
    ///
    /// # Errors
    /// Returns an error if the sizes do not multiply to the size of `dim`.
    pub fn fold(mut self, dim: &str, sizes: &[(&str, usize)]) -> Result<DataArray> {
        let axis = self
            .dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::MissingCoordinate(format!("dimension '{dim}'")))?;
        let product: usize = sizes.iter().map(|(_, n)| n).product();
        if product != self.shape[axis] {
            return Err(Error::DimensionMismatch {
                dim: dim.to_string(),
                expected: product,
                found: self.shape[axis],
            });
        }
        let mut dims = self.dims[..axis].to_vec();
        dims.extend(sizes.iter().map(|(d, _)| (*d).to_string()));
        dims.extend_from_slice(&self.dims[axis + 1..]);
        let mut shape = self.shape[..axis].to_vec();
        shape.extend(sizes.iter().map(|(_, n)| *n));
        shape.extend_from_slice(&self.shape[axis + 1..]);

        if let Content::Dense { values, variances } = &mut self.content {
            *values = reshape(values, &shape)?;
            if let Some(v) = variances {
                *v = reshape(v, &shape)?;
            }
        }
        for (name, coord) in &mut self.coords {
            if coord.var.has_dim(dim) {
                if matches!(&coord.kind, CoordKind::BinEdges { dim: d } if d == dim) {
                    return Err(Error::Unsupported(format!(
                        "cannot fold bin-edge coordinate '{name}'"
                    )));
                }
                coord.var = coord.var.fold(dim, sizes)?;
            }
        }
        for mask in self.masks.values_mut() {
            if mask.has_dim(dim) {
                *mask = mask.fold(dim, sizes)?;
            }
        }
        debug!("Folded '{dim}' into {sizes:?}");
        self.dims = dims;
        self.shape = shape;
        Ok(self)
    }

    /// Merge adjacent dimensions into one.
    ///
    /// Coordinates depending on any merged dimension are broadcast over all
    /// of them before flattening.
    ///
    /// # Errors
    /// Returns an error if the dimensions are not adjacent and in order, or a
    /// bin-edge coordinate depends on them.
    pub fn flatten(mut self, dims: &[&str], to: &str) -> Result<DataArray> {
        let start = self
            .dims
            .iter()
            .position(|d| Some(d.as_str()) == dims.first().copied())
            .ok_or_else(|| Error::MissingCoordinate(format!("dimensions {dims:?}")))?;
        let end = start + dims.len();
        if end > self.dims.len() || self.dims[start..end].iter().zip(dims).any(|(a, b)| a != b) {
            return Err(Error::ShapeMismatch(format!(
                "dimensions {dims:?} are not adjacent in {:?}",
                self.dims
            )));
        }
        let merged: usize = self.shape[start..end].iter().product();
        let mut new_dims = self.dims[..start].to_vec();
        new_dims.push(to.to_string());
        new_dims.extend_from_slice(&self.dims[end..]);
        let mut new_shape = self.shape[..start].to_vec();
        new_shape.push(merged);
        new_shape.extend_from_slice(&self.shape[end..]);

        let group_dims: Vec<String> = self.dims[start..end].to_vec();
        let group_shape: Vec<usize> = self.shape[start..end].to_vec();
        let flatten_var = |name: &str, var: &Variable| -> Result<Variable> {
            if !group_dims.iter().any(|d| var.has_dim(d)) {
                return Ok(var.clone());
            }
            // Broadcast over the whole group, keeping the other dims in place.
            let mut target_dims: Vec<String> = Vec::new();
            let mut target_shape: Vec<usize> = Vec::new();
            for (d, &n) in var.dims().iter().zip(var.shape()) {
                if !group_dims.contains(d) {
                    target_dims.push(d.clone());
                    target_shape.push(n);
                }
            }
            target_dims.extend(group_dims.iter().cloned());
            target_shape.extend(group_shape.iter().copied());
            let full = var.broadcast(&target_dims, &target_shape).map_err(|_| {
                Error::Unsupported(format!("cannot flatten coordinate '{name}'"))
            })?;
            let group: Vec<&str> = group_dims.iter().map(String::as_str).collect();
            full.flatten(&group, to)
        };

        let mut coords = BTreeMap::new();
        for (name, coord) in &self.coords {
            if let CoordKind::BinEdges { dim } = &coord.kind {
                if group_dims.contains(dim) {
                    return Err(Error::Unsupported(format!(
                        "cannot flatten bin-edge coordinate '{name}'"
                    )));
                }
            }
            coords.insert(
                name.clone(),
                Coord {
                    kind: coord.kind.clone(),
                    var: flatten_var(name, &coord.var)?,
                },
            );
        }
        let mut masks = BTreeMap::new();
        for (name, mask) in &self.masks {
            masks.insert(name.clone(), flatten_var(name, mask)?);
        }
        if let Content::Dense { values, variances } = &mut self.content {
            *values = reshape(values, &new_shape)?;
            if let Some(v) = variances {
                *v = reshape(v, &new_shape)?;
            }
        }
        self.dims = new_dims;
        self.shape = new_shape;
        self.coords = coords;
        self.masks = masks;
        Ok(self)
    }

    /// Sum dense data over `dim`, treating masked elements as zero.
    ///
    /// Coordinates and masks depending on `dim` are dropped.
    ///
    /// # Errors
    /// Returns an error for binned arrays or a missing dimension.
    pub fn sum_dim(&self, dim: &str) -> Result<DataArray> {
        let axis = self
            .dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::MissingCoordinate(format!("dimension '{dim}'")))?;
        let (values, variances) = self.dense_values()?;
        let mut masked: Vec<Variable> = Vec::new();
        for mask in self.masks.values() {
            if mask.has_dim(dim) {
                masked.push(mask.broadcast(&self.dims, &self.shape)?);
            }
        }
        let keep = |array: &ArrayD<f64>| -> Result<ArrayD<f64>> {
            let mut array = array.clone();
            for mask in &masked {
                ndarray::Zip::from(&mut array)
                    .and(mask.bools()?)
                    .for_each(|x, &m| {
                        if m {
                            *x = 0.0;
                        }
                    });
            }
            Ok(array.sum_axis(Axis(axis)))
        };
        let summed = keep(values)?;
        let summed_variances = variances.map(&keep).transpose()?;
        let mut dims = self.dims.clone();
        dims.remove(axis);
        let mut shape = self.shape.clone();
        shape.remove(axis);
        let coords = self
            .coords
            .iter()
            .filter(|(_, c)| !c.var.has_dim(dim))
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        let masks = self
            .masks
            .iter()
            .filter(|(_, m)| !m.has_dim(dim))
            .map(|(k, m)| (k.clone(), m.clone()))
            .collect();
        Ok(DataArray {
            dims,
            shape,
            unit: self.unit,
            content: Content::Dense {
                values: summed,
                variances: summed_variances,
            },
            coords,
            masks,
        })
    }

    /// Select index `index` along `dim`, dropping the dimension.
    ///
    /// Bin-edge coordinates along `dim` are dropped.
    ///
    /// # Errors
    /// Returns an error if the dimension is missing or the index out of range.
    pub fn slice(&self, dim: &str, index: usize) -> Result<DataArray> {
        let axis = self
            .dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::MissingCoordinate(format!("dimension '{dim}'")))?;
        if index >= self.shape[axis] {
            return Err(Error::ShapeMismatch(format!(
                "index {index} out of bounds for '{dim}' of size {}",
                self.shape[axis]
            )));
        }
        let mut dims = self.dims.clone();
        dims.remove(axis);
        let mut shape = self.shape.clone();
        shape.remove(axis);
        let content = match &self.content {
            Content::Dense { values, variances } => Content::Dense {
                values: values.index_axis(Axis(axis), index).to_owned(),
                variances: variances
                    .as_ref()
                    .map(|v| v.index_axis(Axis(axis), index).to_owned()),
            },
            Content::Binned(events) => {
                let inner: usize = self.shape[axis + 1..].iter().product();
                let size = self.shape[axis];
                let keep: Vec<bool> = events
                    .bin
                    .iter()
                    .map(|&b| (b / inner) % size == index)
                    .collect();
                let mut kept = events.filter(&keep)?;
                for b in &mut kept.bin {
                    let o = *b / (inner * size);
                    let i = *b % inner;
                    *b = o * inner + i;
                }
                Content::Binned(kept)
            }
        };
        let mut coords = BTreeMap::new();
        for (name, coord) in &self.coords {
            match &coord.kind {
                CoordKind::BinEdges { dim: d } if d == dim => {}
                kind => {
                    let var = if coord.var.has_dim(dim) {
                        coord.var.slice(dim, index)?
                    } else {
                        coord.var.clone()
                    };
                    coords.insert(
                        name.clone(),
                        Coord {
                            kind: kind.clone(),
                            var,
                        },
                    );
                }
            }
        }
        let mut masks = BTreeMap::new();
        for (name, mask) in &self.masks {
            let mask = if mask.has_dim(dim) {
                mask.slice(dim, index)?
            } else {
                mask.clone()
            };
            masks.insert(name.clone(), mask);
        }
        Ok(DataArray {
            dims,
            shape,
            unit: self.unit,
            content,
            coords,
            masks,
        })
    }

    /// All events in a single 0-d bin.
    ///
    /// The point-wise coordinates named in `keep` are gathered onto the
    /// events first. All other dense coordinates and masks are dropped.
    ///
    /// # Errors
    /// Returns an error for dense arrays or coordinates that cannot be gathered.
    pub fn concat_bins(&self, keep: &[&str]) -> Result<DataArray> {
        let events = self.require_events()?;
        let mut flat = events.clone();
        for name in keep {
            if !flat.coords.contains_key(*name) {
                let gathered = self.event_coord(name)?;
                flat.insert_coord(name, gathered)?;
            }
        }
        flat.bin = vec![0; flat.len()];
        debug!(
            "Concatenated {} events from {} bins over {:?}",
            flat.len(),
            self.n_bins(),
            self.dims
        );
        DataArray::binned(&[], &[], flat, self.unit)
    }
}

fn reshape(array: &ArrayD<f64>, shape: &[usize]) -> Result<ArrayD<f64>> {
    let flat: Vec<f64> = array.iter().copied().collect();
    ArrayD::from_shape_vec(IxDyn(shape), flat).map_err(|e| Error::ShapeMismatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn triplet(arc: i64, channel: i64, n_events: usize) -> DataArray {
        let bins = (0..n_events).map(|i| i % 6).collect();
        let mut da =
            DataArray::binned(&["tube", "length"], &[3, 2], EventTable::unit_weights(bins), Unit::COUNTS)
                .unwrap();
        da.insert_coord("arc", Variable::index(arc)).unwrap();
        da.insert_coord("channel", Variable::index(channel)).unwrap();
        da.insert_coord(
            "sample_position",
            Variable::vector(Vector3::zeros(), Unit::METER),
        )
        .unwrap();
        da
    }

    #[test]
    fn test_coordinate_kinds_are_validated() {
        let mut da = DataArray::dense(
            &Variable::floats_1d("tof", vec![1.0, 2.0, 3.0], Unit::COUNTS),
            None,
        )
        .unwrap();
        let edges = Variable::linspace("tof", 0.0, 3.0, 4, Unit::MILLISECOND);
        assert!(da.insert_coord("tof", edges.clone()).is_err());
        da.insert_edges("tof", "tof", edges).unwrap();
        assert!(da.coord_entry("tof").unwrap().is_edges());
        let points = Variable::floats_1d("tof", vec![0.5, 1.5, 2.5], Unit::MILLISECOND);
        assert!(da.insert_edges("mid", "tof", points.clone()).is_err());
        da.insert_coord("mid", points).unwrap();
    }

    #[test]
    fn test_stack_then_fold() {
        let parts = vec![triplet(0, 0, 5), triplet(0, 1, 7), triplet(1, 0, 2), triplet(1, 1, 4)];
        let stacked = DataArray::stack(&parts, "triplet").unwrap();
        assert_eq!(stacked.dims(), ["triplet", "tube", "length"]);
        assert_eq!(stacked.event_count(), 18);
        assert_eq!(stacked.coord("arc").unwrap().to_vec::<i64>().unwrap(), vec![0, 0, 1, 1]);
        // Identical coordinates are not duplicated.
        assert_eq!(stacked.coord("sample_position").unwrap().ndim(), 0);

        let folded = stacked.fold("triplet", &[("arc", 2), ("channel", 2)]).unwrap();
        assert_eq!(folded.dims(), ["arc", "channel", "tube", "length"]);
        assert_eq!(folded.coord("channel").unwrap().dims(), ["arc", "channel"]);
        assert_eq!(folded.total(), 18.0);
        let second = folded.slice("arc", 0).unwrap().slice("channel", 1).unwrap();
        assert_eq!(second.event_count(), 7);
    }

    #[test]
    fn test_stack_drops_masks_missing_in_some_parts() {
        let mut masked = triplet(0, 0, 5);
        let mask = Variable::from_shape_vec(&["tube"], &[3], vec![false, true, false], Unit::DIMENSIONLESS).unwrap();
        masked.insert_mask("dead_tube", mask).unwrap();
        let stacked = DataArray::stack(&[masked.clone(), triplet(0, 1, 7)], "triplet").unwrap();
        assert!(stacked.masks().is_empty());
        let both = DataArray::stack(&[masked.clone(), masked], "triplet").unwrap();
        assert_eq!(both.masks()["dead_tube"].dims(), ["tube"]);
    }

    #[test]
    fn test_event_coord_gathers_dense() {
        let mut da = triplet(2, 3, 6);
        let per_tube = Variable::floats_1d("tube", vec![10.0, 20.0, 30.0], Unit::METER);
        da.insert_coord("L2", per_tube).unwrap();
        let l2 = da.event_coord("L2").unwrap();
        assert_eq!(l2.to_vec::<f64>().unwrap(), vec![10.0, 10.0, 20.0, 20.0, 30.0, 30.0]);
    }

    #[test]
    fn test_sum_dim_respects_masks() {
        let data = Variable::from_shape_vec(&["time", "tof"], &[2, 2], vec![1.0, 2.0, 3.0, 4.0], Unit::COUNTS)
            .unwrap();
        let mut da = DataArray::dense(&data, None).unwrap();
        let mask = Variable::from_shape_vec(&["time"], &[2], vec![false, true], Unit::DIMENSIONLESS).unwrap();
        da.insert_mask("bad_time", mask).unwrap();
        let summed = da.sum_dim("time").unwrap();
        assert_eq!(summed.dims(), ["tof"]);
        assert_eq!(summed.data().unwrap().to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
        assert!(summed.masks().is_empty());
    }

    #[test]
    fn test_flatten_broadcasts_coordinates() {
        let data = Variable::from_shape_vec(&["a3", "a4"], &[2, 3], vec![0.0; 6], Unit::COUNTS).unwrap();
        let mut da = DataArray::dense(&data, None).unwrap();
        da.insert_coord("a3", Variable::floats_1d("a3", vec![0.0, 1.0], Unit::DEGREE))
            .unwrap();
        let flat = da.flatten(&["a3", "a4"], "setting").unwrap();
        assert_eq!(flat.shape(), [6]);
        assert_eq!(
            flat.coord("a3").unwrap().to_vec::<f64>().unwrap(),
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]
        );
    }
}
