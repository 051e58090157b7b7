//! Structure of Arrays (`SoA`) event storage.
//!
//! Events belonging to a binned [`crate::DataArray`] are stored in one flat
//! table. Each event records the row-major index of the bin it belongs to,
//! its weight, and any number of per-event coordinates along the `event`
//! dimension.

use crate::error::{Error, Result};
use crate::units::Unit;
use crate::variable::Variable;
use std::collections::BTreeMap;

/// Dimension label of per-event coordinates.
pub const EVENT_DIM: &str = "event";

/// A table of events in Structure of Arrays format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    /// Row-major index of the owning bin, for every event.
    pub bin: Vec<usize>,
    /// Event weights.
    pub weights: Vec<f64>,
    /// Variances of the event weights.
    pub variances: Option<Vec<f64>>,
    /// Per-event coordinates, each with the single dimension [`EVENT_DIM`].
    pub coords: BTreeMap<String, Variable>,
}

impl EventTable {
    /// Unit-weight events (variance 1) in the given bins.
    #[must_use]
    pub fn unit_weights(bin: Vec<usize>) -> Self {
        let n = bin.len();
        Self {
            bin,
            weights: vec![1.0; n],
            variances: Some(vec![1.0; n]),
            coords: BTreeMap::new(),
        }
    }

    /// Returns the number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bin.len()
    }

    /// Returns true if there are no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bin.is_empty()
    }

    /// Per-event coordinate by name.
    ///
    /// # Errors
    /// Returns [`Error::MissingCoordinate`] if the coordinate does not exist.
    pub fn coord(&self, name: &str) -> Result<&Variable> {
        self.coords
            .get(name)
            .ok_or_else(|| Error::MissingCoordinate(name.to_string()))
    }

    /// Insert or replace a per-event coordinate.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] unless the variable is 1-d along
    /// [`EVENT_DIM`] with one value per event.
    pub fn insert_coord(&mut self, name: &str, var: Variable) -> Result<()> {
        if var.dims() != [EVENT_DIM] || var.len() != self.len() {
            return Err(Error::ShapeMismatch(format!(
                "event coordinate '{name}' has dims {:?} and {} values for {} events",
                var.dims(),
                var.len(),
                self.len()
            )));
        }
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    /// Keep only the events for which `keep` is true.
    ///
    /// # Errors
    /// Returns an error if `keep` has the wrong length.
    pub fn filter(&self, keep: &[bool]) -> Result<EventTable> {
        if keep.len() != self.len() {
            return Err(Error::DimensionMismatch {
                dim: EVENT_DIM.to_string(),
                expected: self.len(),
                found: keep.len(),
            });
        }
        let indices: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        self.take(&indices)
    }

    /// Events at the given positions, in that order.
    ///
    /// # Errors
    /// Returns an error if an index is out of range.
    pub fn take(&self, indices: &[usize]) -> Result<EventTable> {
        let pick = |v: &[f64]| indices.iter().map(|&i| v[i]).collect::<Vec<_>>();
        if indices.iter().any(|&i| i >= self.len()) {
            return Err(Error::ShapeMismatch("event index out of range".to_string()));
        }
        let dims = [EVENT_DIM.to_string()];
        let shape = [self.len()];
        let coords = self
            .coords
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.gather(&dims, &shape, indices, EVENT_DIM)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(EventTable {
            bin: indices.iter().map(|&i| self.bin[i]).collect(),
            weights: pick(&self.weights),
            variances: self.variances.as_deref().map(pick),
            coords,
        })
    }

    /// Append `other`, shifting its bin indices by `bin_offset`.
    ///
    /// # Errors
    /// Returns an error if the coordinate sets differ or units are incompatible.
    pub fn append(&mut self, other: &EventTable, bin_offset: usize) -> Result<()> {
        if self.coords.len() != other.coords.len()
            || self.coords.keys().any(|k| !other.coords.contains_key(k))
        {
            return Err(Error::ShapeMismatch(format!(
                "event coordinates differ: {:?} vs {:?}",
                self.coords.keys().collect::<Vec<_>>(),
                other.coords.keys().collect::<Vec<_>>()
            )));
        }
        for (name, var) in &mut self.coords {
            let theirs = other.coord(name)?;
            *var = Variable::concat(&[var.clone(), theirs.clone()], EVENT_DIM)?;
        }
        match (&mut self.variances, &other.variances) {
            (Some(mine), Some(theirs)) => mine.extend_from_slice(theirs),
            (mine @ Some(_), None) => *mine = None,
            _ => {}
        }
        self.bin.extend(other.bin.iter().map(|b| b + bin_offset));
        self.weights.extend_from_slice(&other.weights);
        Ok(())
    }

    /// Sum of weights per bin, for `n_bins` bins.
    #[must_use]
    pub fn weights_per_bin(&self, n_bins: usize) -> Vec<f64> {
        let mut sums = vec![0.0; n_bins];
        for (&b, &w) in self.bin.iter().zip(&self.weights) {
            if let Some(s) = sums.get_mut(b) {
                *s += w;
            }
        }
        sums
    }

    /// Number of events per bin, for `n_bins` bins.
    #[must_use]
    pub fn events_per_bin(&self, n_bins: usize) -> Vec<usize> {
        let mut counts = vec![0; n_bins];
        for &b in &self.bin {
            if let Some(c) = counts.get_mut(b) {
                *c += 1;
            }
        }
        counts
    }

    /// Sum of all weights.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    /// Weights as a variable along [`EVENT_DIM`].
    #[must_use]
    pub fn weights_variable(&self, unit: Unit) -> Variable {
        Variable::floats_1d(EVENT_DIM, self.weights.clone(), unit)
    }
}
