//! Histogramming of binned events.

use bifrost_core::{in_same_unit, DataArray, Error, Result, Variable};
use log::debug;
use ndarray::{ArrayD, IxDyn};

/// Bin edges along one histogram axis.
#[derive(Debug, Clone, PartialEq)]
pub enum BinSpec {
    /// Explicit, strictly ascending edges.
    Edges(Variable),
    /// This many equal bins spanning the finite data range.
    Count(usize),
}

impl BinSpec {
    /// Equal bins over `[lo, hi]`.
    #[must_use]
    pub fn linspace(dim: &str, lo: f64, hi: f64, bins: usize, unit: bifrost_core::Unit) -> Self {
        Self::Edges(Variable::linspace(dim, lo, hi, bins + 1, unit))
    }
}

fn finite_range(values: &[f64], keep: &[bool]) -> Option<(f64, f64)> {
    values
        .iter()
        .zip(keep)
        .filter(|(v, &k)| k && v.is_finite())
        .fold(None, |acc, (&v, _)| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

pub(crate) fn resolve_edges(name: &str, spec: &BinSpec, coord: &Variable, values: &[f64], keep: &[bool]) -> Result<Vec<f64>> {
    match spec {
        BinSpec::Edges(edges) => {
            let edges = in_same_unit(&edges.to_float()?, coord)?.to_vec::<f64>()?;
            if edges.len() < 2 || edges.windows(2).any(|w| w[1] <= w[0]) {
                return Err(Error::InvalidConfig(format!(
                    "bin edges for '{name}' must be at least two ascending values"
                )));
            }
            Ok(edges)
        }
        BinSpec::Count(0) => Err(Error::InvalidConfig(format!(
            "number of bins for '{name}' must be positive"
        ))),
        BinSpec::Count(n) => {
            let (lo, hi) = finite_range(values, keep).ok_or_else(|| Error::EmptyRange {
                dim: name.to_string(),
            })?;
            let (lo, hi) = if hi > lo {
                // The largest value must fall inside the last bin.
                (lo, hi + (hi - lo) * 1e-9)
            } else {
                (lo - 0.5, hi + 0.5)
            };
            Ok((0..=*n)
                .map(|i| lo + (hi - lo) * i as f64 / *n as f64)
                .collect())
        }
    }
}

/// Bin index of `x` in `[edges[0], edges[last])`.
pub(crate) fn bin_index(edges: &[f64], x: f64) -> Option<usize> {
    let (first, last) = (*edges.first()?, *edges.last()?);
    if !(x >= first && x < last) {
        return None;
    }
    Some(edges.partition_point(|&e| e <= x) - 1)
}

/// Histogram all events of `data` along the named coordinates.
///
/// Coordinates may be event coordinates or point coordinates of the bins.
/// The result is dense with one dimension per axis and bin-edge
/// coordinates. Events in masked bins and events outside the edges do not
/// contribute.
///
/// # Errors
/// Returns [`Error::EmptyRange`] if bin edges must be derived from data
/// without any finite value along an axis, and [`Error::InvalidConfig`]
/// for invalid edges.
#[allow(clippy::cast_precision_loss)]
pub fn hist_events(data: &DataArray, axes: &[(&str, BinSpec)]) -> Result<DataArray> {
    let events = data.require_events()?;
    let mask = data.combined_mask()?;
    let keep: Vec<bool> = events.bin.iter().map(|&b| !mask[b]).collect();

    let mut columns = Vec::with_capacity(axes.len());
    let mut all_edges = Vec::with_capacity(axes.len());
    let mut units = Vec::with_capacity(axes.len());
    for (name, spec) in axes {
        let coord = data.event_coord(name)?.to_float()?;
        let values = coord.to_vec::<f64>()?;
        all_edges.push(resolve_edges(name, spec, &coord, &values, &keep)?);
        units.push(coord.unit());
        columns.push(values);
    }

    let shape: Vec<usize> = all_edges.iter().map(|e| e.len() - 1).collect();
    let size: usize = shape.iter().product();
    let mut values = vec![0.0; size];
    let mut variances = events.variances.as_ref().map(|_| vec![0.0; size]);
    let mut outside = 0usize;
    'events: for i in 0..events.len() {
        if !keep[i] {
            continue;
        }
        let mut flat = 0;
        for (column, edges) in columns.iter().zip(&all_edges) {
            let Some(index) = bin_index(edges, column[i]) else {
                outside += 1;
                continue 'events;
            };
            flat = flat * (edges.len() - 1) + index;
        }
        values[flat] += events.weights[i];
        if let (Some(out), Some(var)) = (variances.as_mut(), events.variances.as_ref()) {
            out[flat] += var[i];
        }
    }
    if outside > 0 {
        debug!("{outside} events outside the histogram edges");
    }

    let dims: Vec<&str> = axes.iter().map(|(name, _)| *name).collect();
    let variances = variances
        .map(|v| ArrayD::from_shape_vec(IxDyn(&shape), v))
        .transpose()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    let mut out = DataArray::dense(
        &Variable::from_shape_vec(&dims, &shape, values, data.unit())?,
        variances,
    )?;
    for ((name, edges), unit) in dims.iter().zip(all_edges).zip(units) {
        out.insert_edges(name, name, Variable::floats_1d(name, edges, unit))?;
    }
    Ok(out)
}
