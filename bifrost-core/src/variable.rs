//! Named-dimension variables.
//!
//! A [`Variable`] is an n-dimensional buffer whose axes are identified by
//! name rather than position, together with a physical [`Unit`]. Binary
//! operations align their operands by dimension name and broadcast missing
//! dimensions, so per-pixel geometry can be combined with scalars or with
//! per-analyzer parameters without manual reshaping.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]

use crate::error::{Error, Result};
use crate::units::Unit;
use nalgebra::{Isometry3, Vector3};
use ndarray::{Array1, ArrayD, Axis, IxDyn, Zip};

/// Element storage of a [`Variable`].
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    /// Floating point values.
    Float(ArrayD<f64>),
    /// Spatial 3-vectors.
    Vector(ArrayD<Vector3<f64>>),
    /// Rigid transformations (rotation followed by translation).
    Transform(ArrayD<Isometry3<f64>>),
    /// Integers, also used for indices and epoch timestamps in ns.
    Int(ArrayD<i64>),
    /// Booleans, used for masks.
    Bool(ArrayD<bool>),
}

/// Element type tag of a [`Variable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Float,
    Vector,
    Transform,
    Int,
    Bool,
}

/// Types that can be stored in a [`Variable`].
pub trait Element: Clone + Send + Sync + 'static {
    /// Element type tag.
    const DTYPE: DType;

    /// Borrow the typed array if `values` holds this element type.
    fn array(values: &Values) -> Option<&ArrayD<Self>>;

    /// Wrap a typed array.
    fn wrap(array: ArrayD<Self>) -> Values;
}

macro_rules! impl_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn array(values: &Values) -> Option<&ArrayD<Self>> {
                match values {
                    Values::$variant(array) => Some(array),
                    _ => None,
                }
            }

            fn wrap(array: ArrayD<Self>) -> Values {
                Values::$variant(array)
            }
        }
    };
}

impl_element!(f64, Float);
impl_element!(Vector3<f64>, Vector);
impl_element!(Isometry3<f64>, Transform);
impl_element!(i64, Int);
impl_element!(bool, Bool);

/// Run `$body` with `$t` bound to the element type of `$dtype`.
macro_rules! with_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::Float => {
                type $t = f64;
                $body
            }
            DType::Vector => {
                type $t = Vector3<f64>;
                $body
            }
            DType::Transform => {
                type $t = Isometry3<f64>;
                $body
            }
            DType::Int => {
                type $t = i64;
                $body
            }
            DType::Bool => {
                type $t = bool;
                $body
            }
        }
    };
}

impl Values {
    /// Element type tag.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Values::Float(_) => DType::Float,
            Values::Vector(_) => DType::Vector,
            Values::Transform(_) => DType::Transform,
            Values::Int(_) => DType::Int,
            Values::Bool(_) => DType::Bool,
        }
    }

    /// Array shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Values::Float(a) => a.shape(),
            Values::Vector(a) => a.shape(),
            Values::Transform(a) => a.shape(),
            Values::Int(a) => a.shape(),
            Values::Bool(a) => a.shape(),
        }
    }
}

/// An n-dimensional array with named dimensions and a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    dims: Vec<String>,
    values: Values,
    unit: Unit,
}

impl Variable {
    /// Create a variable, checking that `dims` matches the array rank.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on rank mismatch or duplicate dims.
    pub fn new(dims: &[&str], values: Values, unit: Unit) -> Result<Self> {
        Self::from_owned_dims(dims.iter().map(ToString::to_string).collect(), values, unit)
    }

    fn from_owned_dims(dims: Vec<String>, values: Values, unit: Unit) -> Result<Self> {
        if dims.len() != values.shape().len() {
            return Err(Error::ShapeMismatch(format!(
                "{} dimension labels {:?} for an array of rank {}",
                dims.len(),
                dims,
                values.shape().len()
            )));
        }
        for (i, dim) in dims.iter().enumerate() {
            if dims[..i].contains(dim) {
                return Err(Error::ShapeMismatch(format!("duplicate dimension '{dim}'")));
            }
        }
        Ok(Self { dims, values, unit })
    }

    /// Create a variable from a typed array.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] on rank mismatch.
    pub fn from_array<T: Element>(dims: &[&str], array: ArrayD<T>, unit: Unit) -> Result<Self> {
        Self::new(dims, T::wrap(array), unit)
    }

    /// Create a variable from a flat row-major buffer.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if the buffer length does not match `shape`.
    pub fn from_shape_vec<T: Element>(
        dims: &[&str],
        shape: &[usize],
        values: Vec<T>,
        unit: Unit,
    ) -> Result<Self> {
        let array = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        Self::from_array(dims, array, unit)
    }

    /// A 0-d float.
    #[must_use]
    pub fn scalar(value: f64, unit: Unit) -> Self {
        Self::zero_dim(Values::Float(ArrayD::from_elem(IxDyn(&[]), value)), unit)
    }

    /// A 0-d vector.
    #[must_use]
    pub fn vector(value: Vector3<f64>, unit: Unit) -> Self {
        Self::zero_dim(Values::Vector(ArrayD::from_elem(IxDyn(&[]), value)), unit)
    }

    /// A 0-d transform.
    #[must_use]
    pub fn transform(value: Isometry3<f64>, unit: Unit) -> Self {
        Self::zero_dim(Values::Transform(ArrayD::from_elem(IxDyn(&[]), value)), unit)
    }

    /// A 0-d integer index.
    #[must_use]
    pub fn index(value: i64) -> Self {
        Self::zero_dim(
            Values::Int(ArrayD::from_elem(IxDyn(&[]), value)),
            Unit::DIMENSIONLESS,
        )
    }

    fn zero_dim(values: Values, unit: Unit) -> Self {
        Self {
            dims: Vec::new(),
            values,
            unit,
        }
    }

    /// A 1-d float array.
    #[must_use]
    pub fn floats_1d(dim: &str, values: Vec<f64>, unit: Unit) -> Self {
        Self::one_dim(dim, Values::Float(Array1::from(values).into_dyn()), unit)
    }

    /// A 1-d vector array.
    #[must_use]
    pub fn vectors_1d(dim: &str, values: Vec<Vector3<f64>>, unit: Unit) -> Self {
        Self::one_dim(dim, Values::Vector(Array1::from(values).into_dyn()), unit)
    }

    /// A 1-d integer array.
    #[must_use]
    pub fn ints_1d(dim: &str, values: Vec<i64>, unit: Unit) -> Self {
        Self::one_dim(dim, Values::Int(Array1::from(values).into_dyn()), unit)
    }

    /// `num` evenly spaced values from `start` to `stop` inclusive.
    #[must_use]
    pub fn linspace(dim: &str, start: f64, stop: f64, num: usize, unit: Unit) -> Self {
        let values = if num < 2 {
            vec![start; num]
        } else {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        };
        Self::floats_1d(dim, values, unit)
    }

    /// `0, 1, .., n - 1` as integers.
    #[must_use]
    pub fn arange(dim: &str, n: usize) -> Self {
        Self::ints_1d(dim, (0..n as i64).collect(), Unit::DIMENSIONLESS)
    }

    fn one_dim(dim: &str, values: Values, unit: Unit) -> Self {
        Self {
            dims: vec![dim.to_string()],
            values,
            unit,
        }
    }

    /// Dimension labels.
    #[must_use]
    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    /// Array shape, ordered like [`Variable::dims`].
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Size of a dimension, if present.
    #[must_use]
    pub fn size_of(&self, dim: &str) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .map(|i| self.shape()[i])
    }

    /// True if the variable has the named dimension.
    #[must_use]
    pub fn has_dim(&self, dim: &str) -> bool {
        self.dims.iter().any(|d| d == dim)
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if the variable has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physical unit.
    #[must_use]
    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Element storage.
    #[must_use]
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Element type tag.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Same data with a different unit label, without converting values.
    #[must_use]
    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    /// Borrow the typed array.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the element type differs.
    pub fn array<T: Element>(&self) -> Result<&ArrayD<T>> {
        T::array(&self.values).ok_or_else(|| self.type_error(T::DTYPE))
    }

    fn type_error(&self, expected: DType) -> Error {
        Error::type_mismatch(
            format!("{:?} with dims {:?}", self.dtype(), self.dims),
            format!("{expected:?} elements"),
        )
    }

    /// Borrow float elements.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-float variables.
    pub fn floats(&self) -> Result<&ArrayD<f64>> {
        self.array::<f64>()
    }

    /// Borrow vector elements.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-vector variables.
    pub fn vectors(&self) -> Result<&ArrayD<Vector3<f64>>> {
        self.array::<Vector3<f64>>()
    }

    /// Borrow transform elements.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-transform variables.
    pub fn transforms(&self) -> Result<&ArrayD<Isometry3<f64>>> {
        self.array::<Isometry3<f64>>()
    }

    /// Borrow integer elements.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-integer variables.
    pub fn ints(&self) -> Result<&ArrayD<i64>> {
        self.array::<i64>()
    }

    /// Borrow boolean elements.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-boolean variables.
    pub fn bools(&self) -> Result<&ArrayD<bool>> {
        self.array::<bool>()
    }

    /// The single element of a variable with exactly one element.
    ///
    /// # Errors
    /// Returns an error if the element type differs or the variable has
    /// more than one element.
    pub fn value<T: Element>(&self) -> Result<T> {
        let array = self.array::<T>()?;
        if array.len() != 1 {
            return Err(Error::ShapeMismatch(format!(
                "expected a single value, got dims {:?} with shape {:?}",
                self.dims,
                self.shape()
            )));
        }
        array
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| Error::ShapeMismatch("empty variable".to_string()))
    }

    /// Elements in logical row-major order.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the element type differs.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.array::<T>()?.iter().cloned().collect())
    }

    /// Convert to another unit of the same dimension.
    ///
    /// Integers are only converted by integral factors.
    ///
    /// # Errors
    /// Returns [`Error::IncompatibleUnits`] for mismatching dimensions.
    pub fn to_unit(&self, unit: &Unit) -> Result<Variable> {
        let factor = self.unit.conversion_factor(unit)?;
        if (factor - 1.0).abs() < f64::EPSILON {
            return Ok(self.clone().with_unit(*unit));
        }
        let values = match &self.values {
            Values::Float(a) => Values::Float(a.mapv(|x| x * factor)),
            Values::Vector(a) => Values::Vector(a.mapv(|v| v * factor)),
            Values::Transform(a) => Values::Transform(a.mapv(|mut t| {
                t.translation.vector *= factor;
                t
            })),
            Values::Int(a) if factor > 1.0 && (factor - factor.round()).abs() < 1e-6 => {
                let factor = factor.round() as i64;
                Values::Int(a.mapv(|x| x * factor))
            }
            Values::Int(_) | Values::Bool(_) => {
                return Err(Error::IncompatibleUnits {
                    from: self.unit.to_string(),
                    to: unit.to_string(),
                })
            }
        };
        Ok(Variable {
            dims: self.dims.clone(),
            values,
            unit: *unit,
        })
    }

    /// Integers as floats.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-numeric variables.
    pub fn to_float(&self) -> Result<Variable> {
        match &self.values {
            Values::Float(_) => Ok(self.clone()),
            Values::Int(a) => Ok(Variable {
                dims: self.dims.clone(),
                values: Values::Float(a.mapv(|x| x as f64)),
                unit: self.unit,
            }),
            _ => Err(self.type_error(DType::Float)),
        }
    }

    /// Relabel a dimension.
    #[must_use]
    pub fn rename_dim(mut self, from: &str, to: &str) -> Self {
        for dim in &mut self.dims {
            if dim == from {
                *dim = to.to_string();
            }
        }
        self
    }

    /// Broadcast to the given dims and shape, transposing as needed.
    ///
    /// # Errors
    /// Returns [`Error::ShapeMismatch`] if a dimension is missing from the
    /// target or sizes disagree.
    pub fn broadcast(&self, dims: &[String], shape: &[usize]) -> Result<Variable> {
        if self.dims == dims && self.shape() == shape {
            return Ok(self.clone());
        }
        let values = with_dtype!(self.dtype(), T => {
            T::wrap(broadcast_array(self.array::<T>()?, &self.dims, dims, shape)?)
        });
        Ok(Variable {
            dims: dims.to_vec(),
            values,
            unit: self.unit,
        })
    }

    /// Apply `f` element-wise.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] if the element type is not `A`.
    pub fn map<A: Element, C: Element>(&self, unit: Unit, f: impl Fn(&A) -> C) -> Result<Variable> {
        let array = self.array::<A>()?;
        Ok(Variable {
            dims: self.dims.clone(),
            values: C::wrap(array.map(f)),
            unit,
        })
    }

    /// Pick elements by flat row-major index after broadcasting to `dims`/`shape`.
    ///
    /// The result has the single dimension `new_dim`.
    ///
    /// # Errors
    /// Returns an error if broadcasting fails or an index is out of range.
    pub fn gather(
        &self,
        dims: &[String],
        shape: &[usize],
        indices: &[usize],
        new_dim: &str,
    ) -> Result<Variable> {
        let full = self.broadcast(dims, shape)?;
        let values = with_dtype!(self.dtype(), T => {
            let flat: Vec<T> = full.array::<T>()?.iter().cloned().collect();
            let picked = indices
                .iter()
                .map(|&i| {
                    flat.get(i).cloned().ok_or_else(|| {
                        Error::ShapeMismatch(format!("index {i} out of range {}", flat.len()))
                    })
                })
                .collect::<Result<Vec<T>>>()?;
            T::wrap(ArrayD::from_shape_vec(IxDyn(&[picked.len()]), picked)
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?)
        });
        Ok(Variable {
            dims: vec![new_dim.to_string()],
            values,
            unit: self.unit,
        })
    }

    /// Select one index along `dim`, dropping the dimension.
    ///
    /// # Errors
    /// Returns an error if the dimension is missing or the index out of range.
    pub fn slice(&self, dim: &str, index: usize) -> Result<Variable> {
        let axis = self.axis_of(dim)?;
        self.check_index(dim, axis, index)?;
        let values = with_dtype!(self.dtype(), T => {
            T::wrap(self.array::<T>()?.index_axis(Axis(axis), index).to_owned())
        });
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Ok(Variable {
            dims,
            values,
            unit: self.unit,
        })
    }

    /// Select `start..end` along `dim`, keeping the dimension.
    ///
    /// # Errors
    /// Returns an error if the dimension is missing or the range invalid.
    pub fn slice_range(&self, dim: &str, start: usize, end: usize) -> Result<Variable> {
        let axis = self.axis_of(dim)?;
        let size = self.shape()[axis];
        if start > end || end > size {
            return Err(Error::ShapeMismatch(format!(
                "range {start}..{end} out of bounds for '{dim}' of size {size}"
            )));
        }
        let values = with_dtype!(self.dtype(), T => {
            let array = self.array::<T>()?;
            T::wrap(array.slice_axis(Axis(axis), ndarray::Slice::from(start..end)).to_owned())
        });
        Ok(Variable {
            dims: self.dims.clone(),
            values,
            unit: self.unit,
        })
    }

    /// Split `dim` into consecutive new dimensions (row-major).
    ///
    /// # Errors
    /// Returns an error if the product of `sizes` differs from the size of `dim`.
    pub fn fold(&self, dim: &str, sizes: &[(&str, usize)]) -> Result<Variable> {
        let axis = self.axis_of(dim)?;
        let size = self.shape()[axis];
        let product: usize = sizes.iter().map(|(_, n)| n).product();
        if product != size {
            return Err(Error::DimensionMismatch {
                dim: dim.to_string(),
                expected: product,
                found: size,
            });
        }
        let mut dims = self.dims[..axis].to_vec();
        dims.extend(sizes.iter().map(|(d, _)| (*d).to_string()));
        dims.extend_from_slice(&self.dims[axis + 1..]);
        let mut shape = self.shape()[..axis].to_vec();
        shape.extend(sizes.iter().map(|(_, n)| *n));
        shape.extend_from_slice(&self.shape()[axis + 1..]);
        self.reshaped(dims, &shape)
    }

    /// Merge adjacent dimensions `dims` (in order) into `to`.
    ///
    /// # Errors
    /// Returns an error if `dims` are not adjacent and in order.
    pub fn flatten(&self, dims: &[&str], to: &str) -> Result<Variable> {
        let Some(first) = dims.first() else {
            return Err(Error::ShapeMismatch("nothing to flatten".to_string()));
        };
        let start = self.axis_of(first)?;
        for (offset, dim) in dims.iter().enumerate() {
            if self.dims.get(start + offset).map(String::as_str) != Some(*dim) {
                return Err(Error::ShapeMismatch(format!(
                    "dimensions {dims:?} are not adjacent in {:?}",
                    self.dims
                )));
            }
        }
        let end = start + dims.len();
        let merged: usize = self.shape()[start..end].iter().product();
        let mut new_dims = self.dims[..start].to_vec();
        new_dims.push(to.to_string());
        new_dims.extend_from_slice(&self.dims[end..]);
        let mut shape = self.shape()[..start].to_vec();
        shape.push(merged);
        shape.extend_from_slice(&self.shape()[end..]);
        self.reshaped(new_dims, &shape)
    }

    fn reshaped(&self, dims: Vec<String>, shape: &[usize]) -> Result<Variable> {
        let values = with_dtype!(self.dtype(), T => {
            let flat: Vec<T> = self.array::<T>()?.iter().cloned().collect();
            T::wrap(ArrayD::from_shape_vec(IxDyn(shape), flat)
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?)
        });
        Self::from_owned_dims(dims, values, self.unit)
    }

    /// Concatenate along an existing dimension.
    ///
    /// # Errors
    /// Returns an error if the parts differ in type, unit or other dimensions.
    pub fn concat(parts: &[Variable], dim: &str) -> Result<Variable> {
        let first = parts
            .first()
            .ok_or_else(|| Error::ShapeMismatch("nothing to concatenate".to_string()))?;
        let axis = first.axis_of(dim)?;
        let converted = parts
            .iter()
            .map(|p| p.to_unit(&first.unit))
            .collect::<Result<Vec<_>>>()?;
        for part in &converted {
            if part.dims != first.dims {
                return Err(Error::ShapeMismatch(format!(
                    "cannot concatenate dims {:?} with {:?}",
                    part.dims, first.dims
                )));
            }
        }
        let values = with_dtype!(first.dtype(), T => {
            let views = converted
                .iter()
                .map(|p| p.array::<T>().map(ArrayD::view))
                .collect::<Result<Vec<_>>>()?;
            T::wrap(ndarray::concatenate(Axis(axis), &views)
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?)
        });
        Ok(Variable {
            dims: first.dims.clone(),
            values,
            unit: first.unit,
        })
    }

    /// Stack along a new leading dimension, broadcasting parts to a common shape.
    ///
    /// # Errors
    /// Returns an error if the parts cannot be broadcast together.
    pub fn stack(parts: &[Variable], dim: &str) -> Result<Variable> {
        let first = parts
            .first()
            .ok_or_else(|| Error::ShapeMismatch("nothing to stack".to_string()))?;
        let refs: Vec<&Variable> = parts.iter().collect();
        let (dims, shape) = broadcast_shape(&refs)?;
        let aligned = parts
            .iter()
            .map(|p| p.to_unit(&first.unit)?.broadcast(&dims, &shape))
            .collect::<Result<Vec<_>>>()?;
        let values = with_dtype!(first.dtype(), T => {
            let views = aligned
                .iter()
                .map(|p| p.array::<T>().map(ArrayD::view))
                .collect::<Result<Vec<_>>>()?;
            T::wrap(ndarray::stack(Axis(0), &views)
                .map_err(|e| Error::ShapeMismatch(e.to_string()))?)
        });
        let mut new_dims = vec![dim.to_string()];
        new_dims.extend(dims);
        Self::from_owned_dims(new_dims, values, first.unit)
    }

    /// Reorder elements along `dim` by `order`.
    ///
    /// # Errors
    /// Returns an error if the dimension is missing.
    pub fn select(&self, dim: &str, order: &[usize]) -> Result<Variable> {
        let axis = self.axis_of(dim)?;
        let values = with_dtype!(self.dtype(), T => {
            T::wrap(self.array::<T>()?.select(Axis(axis), order))
        });
        Ok(Variable {
            dims: self.dims.clone(),
            values,
            unit: self.unit,
        })
    }

    /// Axis index of a named dimension.
    ///
    /// # Errors
    /// Returns [`Error::MissingCoordinate`] if the dimension does not exist.
    pub fn axis_of(&self, dim: &str) -> Result<usize> {
        self.dims
            .iter()
            .position(|d| d == dim)
            .ok_or_else(|| Error::MissingCoordinate(format!("dimension '{dim}'")))
    }

    fn check_index(&self, dim: &str, axis: usize, index: usize) -> Result<()> {
        let size = self.shape()[axis];
        if index >= size {
            return Err(Error::ShapeMismatch(format!(
                "index {index} out of bounds for '{dim}' of size {size}"
            )));
        }
        Ok(())
    }

    // Arithmetic.

    /// Element-wise sum; `rhs` is converted to this unit.
    ///
    /// # Errors
    /// Returns an error for incompatible units, types or shapes.
    pub fn try_add(&self, rhs: &Variable) -> Result<Variable> {
        self.additive(rhs, 1.0)
    }

    /// Element-wise difference; `rhs` is converted to this unit.
    ///
    /// # Errors
    /// Returns an error for incompatible units, types or shapes.
    pub fn try_sub(&self, rhs: &Variable) -> Result<Variable> {
        self.additive(rhs, -1.0)
    }

    fn additive(&self, rhs: &Variable, sign: f64) -> Result<Variable> {
        let rhs = rhs.to_unit(&self.unit)?;
        match (self.dtype(), rhs.dtype()) {
            (DType::Float, DType::Float) => {
                zip_with(self, &rhs, self.unit, |a: &f64, b: &f64| a + sign * b)
            }
            (DType::Vector, DType::Vector) => zip_with(
                self,
                &rhs,
                self.unit,
                |a: &Vector3<f64>, b: &Vector3<f64>| a + b * sign,
            ),
            (DType::Int, DType::Int) => {
                let sign = sign as i64;
                zip_with(self, &rhs, self.unit, |a: &i64, b: &i64| a + sign * b)
            }
            _ => Err(self.binary_type_error("add", &rhs)),
        }
    }

    /// Element-wise product with unit multiplication.
    ///
    /// Supports float×float, vector×float and float×vector.
    ///
    /// # Errors
    /// Returns an error for unsupported types or incompatible shapes.
    pub fn try_mul(&self, rhs: &Variable) -> Result<Variable> {
        let unit = self.unit * rhs.unit;
        match (self.dtype(), rhs.dtype()) {
            (DType::Float, DType::Float) => zip_with(self, rhs, unit, |a: &f64, b: &f64| a * b),
            (DType::Vector, DType::Float) => {
                zip_with(self, rhs, unit, |a: &Vector3<f64>, b: &f64| a * *b)
            }
            (DType::Float, DType::Vector) => {
                zip_with(self, rhs, unit, |a: &f64, b: &Vector3<f64>| b * *a)
            }
            _ => Err(self.binary_type_error("multiply", rhs)),
        }
    }

    /// Element-wise quotient with unit division.
    ///
    /// # Errors
    /// Returns an error for unsupported types or incompatible shapes.
    pub fn try_div(&self, rhs: &Variable) -> Result<Variable> {
        let unit = self.unit / rhs.unit;
        match (self.dtype(), rhs.dtype()) {
            (DType::Float, DType::Float) => zip_with(self, rhs, unit, |a: &f64, b: &f64| a / b),
            (DType::Vector, DType::Float) => {
                zip_with(self, rhs, unit, |a: &Vector3<f64>, b: &f64| a / *b)
            }
            _ => Err(self.binary_type_error("divide", rhs)),
        }
    }

    fn binary_type_error(&self, op: &str, rhs: &Variable) -> Error {
        Error::Unsupported(format!(
            "cannot {op} {:?} and {:?}",
            self.dtype(),
            rhs.dtype()
        ))
    }

    /// Multiply by a dimensionless factor.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-float, non-vector variables.
    pub fn scaled(&self, factor: f64) -> Result<Variable> {
        match &self.values {
            Values::Float(a) => Ok(self.with_values(Values::Float(a.mapv(|x| x * factor)))),
            Values::Vector(a) => Ok(self.with_values(Values::Vector(a.mapv(|v| v * factor)))),
            _ => Err(self.type_error(DType::Float)),
        }
    }

    fn with_values(&self, values: Values) -> Variable {
        Variable {
            dims: self.dims.clone(),
            values,
            unit: self.unit,
        }
    }

    /// Euclidean norm of vectors.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-vector variables.
    pub fn norm(&self) -> Result<Variable> {
        self.map(self.unit, |v: &Vector3<f64>| v.norm())
    }

    /// Vectors divided by their norm (dimensionless).
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-vector variables.
    pub fn normalized(&self) -> Result<Variable> {
        self.map(Unit::DIMENSIONLESS, |v: &Vector3<f64>| v / v.norm())
    }

    /// Dot product of two vector variables.
    ///
    /// # Errors
    /// Returns an error for non-vector operands or incompatible shapes.
    pub fn dot(&self, rhs: &Variable) -> Result<Variable> {
        zip_with(
            self,
            rhs,
            self.unit * rhs.unit,
            |a: &Vector3<f64>, b: &Vector3<f64>| a.dot(b),
        )
    }

    /// Component `index` (0 = x, 1 = y, 2 = z) of vectors.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-vector variables.
    pub fn component(&self, index: usize) -> Result<Variable> {
        self.map(self.unit, |v: &Vector3<f64>| v[index.min(2)])
    }

    /// Element-wise square root.
    ///
    /// # Errors
    /// Returns an error for non-float variables or units without a square root.
    pub fn sqrt(&self) -> Result<Variable> {
        self.map(self.unit.sqrt()?, |x: &f64| x.sqrt())
    }

    /// Round to the nearest integer, returning integers.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-float variables.
    pub fn round_to_int(&self) -> Result<Variable> {
        self.map(self.unit, |x: &f64| x.round() as i64)
    }

    /// Floored modulo by a scalar period, in this variable's unit.
    ///
    /// # Errors
    /// Returns an error for non-float values or incompatible period units.
    pub fn rem_euclid(&self, period: &Variable) -> Result<Variable> {
        let period = period.to_unit(&self.unit)?;
        zip_with(self, &period, self.unit, |x: &f64, p: &f64| x.rem_euclid(*p))
    }

    /// Smallest finite value.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-float variables.
    pub fn nanmin(&self) -> Result<Option<f64>> {
        Ok(self
            .floats()?
            .iter()
            .copied()
            .filter(|x| x.is_finite())
            .reduce(f64::min))
    }

    /// Largest finite value.
    ///
    /// # Errors
    /// Returns [`Error::TypeMismatch`] for non-float variables.
    pub fn nanmax(&self) -> Result<Option<f64>> {
        Ok(self
            .floats()?
            .iter()
            .copied()
            .filter(|x| x.is_finite())
            .reduce(f64::max))
    }

    /// Sum of floats over `dim`.
    ///
    /// # Errors
    /// Returns an error for non-float variables or a missing dimension.
    pub fn sum_dim(&self, dim: &str) -> Result<Variable> {
        let axis = self.axis_of(dim)?;
        let summed = self.floats()?.sum_axis(Axis(axis));
        let mut dims = self.dims.clone();
        dims.remove(axis);
        Ok(Variable {
            dims,
            values: Values::Float(summed),
            unit: self.unit,
        })
    }

    /// Number of non-finite float elements (or components of vectors).
    #[must_use]
    pub fn count_non_finite(&self) -> usize {
        match &self.values {
            Values::Float(a) => a.iter().filter(|x| !x.is_finite()).count(),
            Values::Vector(a) => a
                .iter()
                .filter(|v| v.iter().any(|x| !x.is_finite()))
                .count(),
            _ => 0,
        }
    }

    /// True if all elements are equal to the first one.
    #[must_use]
    pub fn is_uniform(&self) -> bool {
        fn uniform<T: PartialEq>(a: &ArrayD<T>) -> bool {
            let mut iter = a.iter();
            match iter.next() {
                Some(first) => iter.all(|x| x == first),
                None => true,
            }
        }
        match &self.values {
            Values::Float(a) => uniform(a),
            Values::Vector(a) => uniform(a),
            Values::Transform(a) => uniform(a),
            Values::Int(a) => uniform(a),
            Values::Bool(a) => uniform(a),
        }
    }
}

/// Union of the dimensions of `vars` in order of first appearance.
///
/// # Errors
/// Returns [`Error::DimensionMismatch`] if a dimension has different sizes.
pub fn broadcast_shape(vars: &[&Variable]) -> Result<(Vec<String>, Vec<usize>)> {
    let mut dims: Vec<String> = Vec::new();
    let mut shape: Vec<usize> = Vec::new();
    for var in vars {
        for (dim, &size) in var.dims().iter().zip(var.shape()) {
            match dims.iter().position(|d| d == dim) {
                Some(i) if shape[i] != size => {
                    return Err(Error::DimensionMismatch {
                        dim: dim.clone(),
                        expected: shape[i],
                        found: size,
                    })
                }
                Some(_) => {}
                None => {
                    dims.push(dim.clone());
                    shape.push(size);
                }
            }
        }
    }
    Ok((dims, shape))
}

fn broadcast_array<T: Clone>(
    array: &ArrayD<T>,
    from: &[String],
    dims: &[String],
    shape: &[usize],
) -> Result<ArrayD<T>> {
    let positions = from
        .iter()
        .map(|d| {
            dims.iter().position(|t| t == d).ok_or_else(|| {
                Error::ShapeMismatch(format!("cannot broadcast {from:?} to {dims:?}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let mut order: Vec<usize> = (0..from.len()).collect();
    order.sort_by_key(|&i| positions[i]);
    let mut view = array.view().permuted_axes(IxDyn(&order));
    for (i, dim) in dims.iter().enumerate() {
        if !from.contains(dim) {
            view.insert_axis_inplace(Axis(i));
        }
    }
    view.broadcast(IxDyn(shape))
        .map(|b| b.to_owned())
        .ok_or_else(|| Error::ShapeMismatch(format!("cannot broadcast {from:?} to {dims:?} {shape:?}")))
}

/// Combine two variables element-wise after aligning them by dimension name.
///
/// # Errors
/// Returns an error for wrong element types or incompatible shapes.
pub fn zip_with<A: Element, B: Element, C: Element>(
    a: &Variable,
    b: &Variable,
    unit: Unit,
    f: impl Fn(&A, &B) -> C,
) -> Result<Variable> {
    let (dims, shape) = broadcast_shape(&[a, b])?;
    let xa = broadcast_array(a.array::<A>()?, a.dims(), &dims, &shape)?;
    let xb = broadcast_array(b.array::<B>()?, b.dims(), &dims, &shape)?;
    let out = Zip::from(&xa).and(&xb).map_collect(|x, y| f(x, y));
    Ok(Variable {
        dims,
        values: C::wrap(out),
        unit,
    })
}

/// Three-operand version of [`zip_with`].
///
/// # Errors
/// Returns an error for wrong element types or incompatible shapes.
pub fn zip3_with<A: Element, B: Element, C: Element, R: Element>(
    a: &Variable,
    b: &Variable,
    c: &Variable,
    unit: Unit,
    f: impl Fn(&A, &B, &C) -> R,
) -> Result<Variable> {
    let (dims, shape) = broadcast_shape(&[a, b, c])?;
    let xa = broadcast_array(a.array::<A>()?, a.dims(), &dims, &shape)?;
    let xb = broadcast_array(b.array::<B>()?, b.dims(), &dims, &shape)?;
    let xc = broadcast_array(c.array::<C>()?, c.dims(), &dims, &shape)?;
    let out = Zip::from(&xa)
        .and(&xb)
        .and(&xc)
        .map_collect(|x, y, z| f(x, y, z));
    Ok(Variable {
        dims,
        values: R::wrap(out),
        unit,
    })
}

/// Four-operand version of [`zip_with`].
///
/// # Errors
/// Returns an error for wrong element types or incompatible shapes.
pub fn zip4_with<A: Element, B: Element, C: Element, D: Element, R: Element>(
    a: &Variable,
    b: &Variable,
    c: &Variable,
    d: &Variable,
    unit: Unit,
    f: impl Fn(&A, &B, &C, &D) -> R,
) -> Result<Variable> {
    let (dims, shape) = broadcast_shape(&[a, b, c, d])?;
    let xa = broadcast_array(a.array::<A>()?, a.dims(), &dims, &shape)?;
    let xb = broadcast_array(b.array::<B>()?, b.dims(), &dims, &shape)?;
    let xc = broadcast_array(c.array::<C>()?, c.dims(), &dims, &shape)?;
    let xd = broadcast_array(d.array::<D>()?, d.dims(), &dims, &shape)?;
    let out = Zip::from(&xa)
        .and(&xb)
        .and(&xc)
        .and(&xd)
        .map_collect(|w, x, y, z| f(w, x, y, z));
    Ok(Variable {
        dims,
        values: R::wrap(out),
        unit,
    })
}

/// Convert `value` to the unit of `to` unless they already agree.
///
/// # Errors
/// Returns [`Error::IncompatibleUnits`] if the dimensions differ.
pub fn in_same_unit(value: &Variable, to: &Variable) -> Result<Variable> {
    if value.unit() == to.unit() {
        return Ok(value.clone());
    }
    value.to_unit(&to.unit())
}

/// Map `x` from `[lo, hi]` onto `[0, 1]`.
///
/// # Errors
/// Returns an error for incompatible units or shapes.
pub fn range_normalized(x: &Variable, lo: &Variable, hi: &Variable) -> Result<Variable> {
    let lo = in_same_unit(lo, x)?;
    let hi = in_same_unit(hi, x)?;
    zip3_with(
        x,
        &lo,
        &hi,
        Unit::DIMENSIONLESS,
        |x: &f64, lo: &f64, hi: &f64| (x - lo) / (hi - lo),
    )
}
