//! Physical arrays and the element types they carry.
//!
//! A [`PhysArray`] is the value that flows along graph edges: a numeric
//! buffer bundled with a name, units, ordered dimension names and an optional
//! positive direction. The engine computes in `f64` and remembers the
//! originating [`Datatype`] so the writer can cast back under the same-kind
//! rule.
//!
//! [`PhysArray`]: struct.PhysArray.html
//! [`Datatype`]: enum.Datatype.html

use std::collections::BTreeMap;
use std::fmt;

use crate::index::{selection_shape, NormSelector};
use crate::units::Units;

/// Array element types supported by the file convention.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Datatype {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Char,
}

/// Coarse classification used by the same-kind cast rule.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Int,
    Float,
    Char,
}

impl Datatype {
    /// Parses the datatype names used by file headers and specifications.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "byte" | "int8" => Some(Datatype::I8),
            "ubyte" | "uint8" => Some(Datatype::U8),
            "short" | "int16" => Some(Datatype::I16),
            "ushort" | "uint16" => Some(Datatype::U16),
            "int" | "int32" => Some(Datatype::I32),
            "uint" | "uint32" => Some(Datatype::U32),
            "int64" => Some(Datatype::I64),
            "uint64" => Some(Datatype::U64),
            "float" | "real" | "float32" => Some(Datatype::F32),
            "double" | "float64" => Some(Datatype::F64),
            "char" => Some(Datatype::Char),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Datatype::I8 => "byte",
            Datatype::U8 => "ubyte",
            Datatype::I16 => "short",
            Datatype::U16 => "ushort",
            Datatype::I32 => "int",
            Datatype::U32 => "uint",
            Datatype::I64 => "int64",
            Datatype::U64 => "uint64",
            Datatype::F32 => "float",
            Datatype::F64 => "double",
            Datatype::Char => "char",
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            Datatype::F32 | Datatype::F64 => Kind::Float,
            Datatype::Char => Kind::Char,
            _ => Kind::Int,
        }
    }

    /// Whether values of this type may be cast into `target` under the
    /// same-kind rule: casts within a kind and the widening int-to-float cast
    /// are allowed, everything else is not.
    pub fn castable_to(&self, target: Datatype) -> bool {
        match (self.kind(), target.kind()) {
            (from, to) if from == to => true,
            (Kind::Int, Kind::Float) => true,
            _ => false,
        }
    }

    /// Result type of arithmetic between two operands.
    pub fn promote(self, other: Datatype) -> Datatype {
        if self.kind() == Kind::Float || other.kind() == Kind::Float {
            Datatype::F64
        } else {
            Datatype::I64
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An attribute value attached to files and variables.
#[derive(Clone, PartialEq, Debug)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(value) => Some(*value as f64),
            AttrValue::Float(value) => Some(*value),
            AttrValue::Str(_) => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(text) => write!(f, "{}", text),
            AttrValue::Int(value) => write!(f, "{}", value),
            AttrValue::Float(value) => write!(f, "{}", value),
        }
    }
}

/// Attribute mapping with deterministic iteration order.
pub type Attrs = BTreeMap<String, AttrValue>;

/// A typed buffer as stored in a file, before unpacking and upcasting.
#[derive(Clone, PartialEq, Debug)]
pub enum RawArray {
    I8(Vec<i8>),
    U8(Vec<u8>),
    I16(Vec<i16>),
    U16(Vec<u16>),
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Char(Vec<u8>),
}

macro_rules! raw_dispatch {
    ($self:expr, $values:ident => $body:expr) => {
        match $self {
            RawArray::I8($values) => $body,
            RawArray::U8($values) => $body,
            RawArray::I16($values) => $body,
            RawArray::U16($values) => $body,
            RawArray::I32($values) => $body,
            RawArray::U32($values) => $body,
            RawArray::I64($values) => $body,
            RawArray::U64($values) => $body,
            RawArray::F32($values) => $body,
            RawArray::F64($values) => $body,
            RawArray::Char($values) => $body,
        }
    };
}

macro_rules! raw_map {
    ($self:expr, $values:ident => $body:expr) => {
        match $self {
            RawArray::I8($values) => RawArray::I8($body),
            RawArray::U8($values) => RawArray::U8($body),
            RawArray::I16($values) => RawArray::I16($body),
            RawArray::U16($values) => RawArray::U16($body),
            RawArray::I32($values) => RawArray::I32($body),
            RawArray::U32($values) => RawArray::U32($body),
            RawArray::I64($values) => RawArray::I64($body),
            RawArray::U64($values) => RawArray::U64($body),
            RawArray::F32($values) => RawArray::F32($body),
            RawArray::F64($values) => RawArray::F64($body),
            RawArray::Char($values) => RawArray::Char($body),
        }
    };
}

macro_rules! raw_zip_mut {
    ($target:expr, $source:expr, $into:ident, $from:ident => $body:expr) => {
        match ($target, $source) {
            (RawArray::I8($into), RawArray::I8($from)) => {
                $body;
                true
            }
            (RawArray::U8($into), RawArray::U8($from)) => {
                $body;
                true
            }
            (RawArray::I16($into), RawArray::I16($from)) => {
                $body;
                true
            }
            (RawArray::U16($into), RawArray::U16($from)) => {
                $body;
                true
            }
            (RawArray::I32($into), RawArray::I32($from)) => {
                $body;
                true
            }
            (RawArray::U32($into), RawArray::U32($from)) => {
                $body;
                true
            }
            (RawArray::I64($into), RawArray::I64($from)) => {
                $body;
                true
            }
            (RawArray::U64($into), RawArray::U64($from)) => {
                $body;
                true
            }
            (RawArray::F32($into), RawArray::F32($from)) => {
                $body;
                true
            }
            (RawArray::F64($into), RawArray::F64($from)) => {
                $body;
                true
            }
            (RawArray::Char($into), RawArray::Char($from)) => {
                $body;
                true
            }
            _ => false,
        }
    };
}

impl RawArray {
    pub fn datatype(&self) -> Datatype {
        match self {
            RawArray::I8(_) => Datatype::I8,
            RawArray::U8(_) => Datatype::U8,
            RawArray::I16(_) => Datatype::I16,
            RawArray::U16(_) => Datatype::U16,
            RawArray::I32(_) => Datatype::I32,
            RawArray::U32(_) => Datatype::U32,
            RawArray::I64(_) => Datatype::I64,
            RawArray::U64(_) => Datatype::U64,
            RawArray::F32(_) => Datatype::F32,
            RawArray::F64(_) => Datatype::F64,
            RawArray::Char(_) => Datatype::Char,
        }
    }

    pub fn len(&self) -> usize {
        raw_dispatch!(self, values => values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to `f64`. Float32 inputs go through their exact binary
    /// value.
    pub fn to_f64(&self) -> Vec<f64> {
        raw_dispatch!(self, values => values.iter().map(|v| *v as f64).collect())
    }

    /// A buffer of `len` elements initialized to `fill`.
    pub fn filled(datatype: Datatype, len: usize, fill: f64) -> RawArray {
        RawArray::from_f64(datatype, &vec![fill; len])
    }

    /// The elements at the given flat positions, in order.
    pub fn gather(&self, positions: &[usize]) -> RawArray {
        raw_map!(self, values => positions.iter().map(|at| values[*at]).collect())
    }

    /// Writes `source` into the given flat positions. Returns `false` when
    /// the element types differ.
    pub fn scatter(&mut self, positions: &[usize], source: &RawArray) -> bool {
        raw_zip_mut!(self, source, into, from => {
            for (at, value) in positions.iter().zip(from.iter()) {
                into[*at] = *value;
            }
        })
    }

    /// Packs `f64` values into a buffer of the given type. The caller is
    /// responsible for having checked castability.
    pub fn from_f64(datatype: Datatype, values: &[f64]) -> RawArray {
        match datatype {
            Datatype::I8 => RawArray::I8(values.iter().map(|v| *v as i8).collect()),
            Datatype::U8 => RawArray::U8(values.iter().map(|v| *v as u8).collect()),
            Datatype::I16 => RawArray::I16(values.iter().map(|v| *v as i16).collect()),
            Datatype::U16 => RawArray::U16(values.iter().map(|v| *v as u16).collect()),
            Datatype::I32 => RawArray::I32(values.iter().map(|v| *v as i32).collect()),
            Datatype::U32 => RawArray::U32(values.iter().map(|v| *v as u32).collect()),
            Datatype::I64 => RawArray::I64(values.iter().map(|v| *v as i64).collect()),
            Datatype::U64 => RawArray::U64(values.iter().map(|v| *v as u64).collect()),
            Datatype::F32 => RawArray::F32(values.iter().map(|v| *v as f32).collect()),
            Datatype::F64 => RawArray::F64(values.to_vec()),
            Datatype::Char => RawArray::Char(values.iter().map(|v| *v as u8).collect()),
        }
    }
}

/// Vertical orientation of a quantity.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Positive {
    Up,
    Down,
}

impl Positive {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "up" => Some(Positive::Up),
            "down" => Some(Positive::Down),
            _ => None,
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Positive::Up => Positive::Down,
            Positive::Down => Positive::Up,
        }
    }
}

impl fmt::Display for Positive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Positive::Up => write!(f, "up"),
            Positive::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug)]
pub enum ShapeError {
    Mismatch { left: Vec<usize>, right: Vec<usize> },
    BadPermutation { dims: Vec<String> },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::Mismatch { left, right } => {
                write!(f, "shapes {:?} and {:?} do not match", left, right)
            }
            ShapeError::BadPermutation { dims } => {
                write!(f, "dimensions {:?} are not a permutation", dims)
            }
        }
    }
}

/// A numeric array bundled with its metadata.
#[derive(Clone, Debug)]
pub struct PhysArray {
    pub name: String,
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub dims: Vec<String>,
    pub units: Units,
    pub positive: Option<Positive>,
    pub datatype: Datatype,
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for at in (0..shape.len().saturating_sub(1)).rev() {
        strides[at] = strides[at + 1] * shape[at + 1];
    }
    strides
}

impl PhysArray {
    /// A dimensionless scalar.
    pub fn scalar<N: Into<String>>(name: N, value: f64, datatype: Datatype) -> Self {
        PhysArray {
            name: name.into(),
            data: vec![value],
            shape: Vec::new(),
            dims: Vec::new(),
            units: Units::one(),
            positive: None,
            datatype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Applies one normalized selector per dimension, producing the selected
    /// sub-array. Integer selectors reduce their dimension away.
    pub fn slice(&self, selection: &[NormSelector]) -> PhysArray {
        debug_assert_eq!(selection.len(), self.rank());

        let out_shape = selection_shape(selection);
        let out_dims = self
            .dims
            .iter()
            .zip(selection.iter())
            .filter(|(_, sel)| sel.len().is_some())
            .map(|(dim, _)| dim.clone())
            .collect::<Vec<_>>();

        let out_size = out_shape.iter().product::<usize>();
        let mut data = Vec::with_capacity(out_size);
        let src_strides = strides(&self.shape);

        // Odometer over the output index space; an empty output shape still
        // yields the single fully-reduced element.
        let mut counter = vec![0usize; out_shape.len()];
        'odometer: while out_size > 0 {
            let mut flat = 0;
            let mut out_axis = 0;
            for (axis, sel) in selection.iter().enumerate() {
                let at = match sel.len() {
                    Some(_) => {
                        let at = counter[out_axis];
                        out_axis += 1;
                        at
                    }
                    None => 0,
                };
                flat += sel.position(at) * src_strides[axis];
            }
            data.push(self.data[flat]);

            for axis in (0..counter.len()).rev() {
                counter[axis] += 1;
                if counter[axis] < out_shape[axis] {
                    continue 'odometer;
                }
                counter[axis] = 0;
            }
            break;
        }

        PhysArray {
            name: self.name.clone(),
            data,
            shape: out_shape,
            dims: out_dims,
            units: self.units.clone(),
            positive: self.positive,
            datatype: self.datatype,
        }
    }

    /// Reorders the dimensions into `new_dims`, which must be a permutation
    /// of the current ones.
    pub fn transposed(&self, new_dims: &[String]) -> Result<PhysArray, ShapeError> {
        if new_dims.len() != self.dims.len() {
            return Err(ShapeError::BadPermutation {
                dims: new_dims.to_vec(),
            });
        }

        let mut perm = Vec::with_capacity(new_dims.len());
        for dim in new_dims {
            match self.dims.iter().position(|have| have == dim) {
                Some(at) if !perm.contains(&at) => perm.push(at),
                _ => {
                    return Err(ShapeError::BadPermutation {
                        dims: new_dims.to_vec(),
                    })
                }
            }
        }

        let out_shape = perm.iter().map(|at| self.shape[*at]).collect::<Vec<_>>();
        let src_strides = strides(&self.shape);
        let out_size = self.size();
        let mut data = Vec::with_capacity(out_size);

        let mut counter = vec![0usize; out_shape.len()];
        for _ in 0..out_size {
            let flat = counter
                .iter()
                .zip(perm.iter())
                .map(|(at, axis)| at * src_strides[*axis])
                .sum::<usize>();
            data.push(self.data[flat]);

            for axis in (0..counter.len()).rev() {
                counter[axis] += 1;
                if counter[axis] < out_shape[axis] {
                    break;
                }
                counter[axis] = 0;
            }
        }

        Ok(PhysArray {
            name: self.name.clone(),
            data,
            shape: out_shape,
            dims: new_dims.to_vec(),
            units: self.units.clone(),
            positive: self.positive,
            datatype: self.datatype,
        })
    }

    /// Averages over the given dimensions, which must all be present.
    pub fn mean_over(&self, reduce: &[String]) -> Result<PhysArray, ShapeError> {
        for dim in reduce {
            if !self.dims.contains(dim) {
                return Err(ShapeError::BadPermutation {
                    dims: reduce.to_vec(),
                });
            }
        }

        let keep = self
            .dims
            .iter()
            .enumerate()
            .filter(|(_, dim)| !reduce.contains(dim))
            .map(|(axis, _)| axis)
            .collect::<Vec<_>>();
        let out_shape = keep.iter().map(|axis| self.shape[*axis]).collect::<Vec<_>>();
        let out_dims = keep
            .iter()
            .map(|axis| self.dims[*axis].clone())
            .collect::<Vec<_>>();

        let out_size = out_shape.iter().product::<usize>();
        let mut sums = vec![0.0; out_size];
        let mut counts = vec![0usize; out_size];

        let src_strides = strides(&self.shape);
        let out_strides = strides(&out_shape);

        // Walk the source once, accumulating into the projection of each
        // element onto the kept axes.
        let mut counter = vec![0usize; self.shape.len()];
        'odometer: for value in &self.data {
            let out_flat = keep
                .iter()
                .enumerate()
                .map(|(out_axis, axis)| counter[*axis] * out_strides[out_axis])
                .sum::<usize>();
            sums[out_flat] += value;
            counts[out_flat] += 1;

            for axis in (0..counter.len()).rev() {
                counter[axis] += 1;
                if counter[axis] < self.shape[axis] {
                    continue 'odometer;
                }
                counter[axis] = 0;
            }
        }

        let data = sums
            .iter()
            .zip(counts.iter())
            .map(|(sum, count)| sum / (*count).max(1) as f64)
            .collect();

        Ok(PhysArray {
            name: self.name.clone(),
            data,
            shape: out_shape,
            dims: out_dims,
            units: self.units.clone(),
            positive: self.positive,
            datatype: Datatype::F64,
        })
    }

    /// Elementwise combination with scalar broadcasting on either side.
    /// Non-scalar operands must agree in shape; the reconciler has already
    /// aligned dimension orders by the time this runs.
    pub fn zip_with<F>(&self, other: &PhysArray, combine: F) -> Result<(Vec<f64>, Vec<usize>, Vec<String>), ShapeError>
    where
        F: Fn(f64, f64) -> f64,
    {
        if self.is_scalar() {
            let left = self.data[0];
            return Ok((
                other.data.iter().map(|right| combine(left, *right)).collect(),
                other.shape.clone(),
                other.dims.clone(),
            ));
        }

        if other.is_scalar() {
            let right = other.data[0];
            return Ok((
                self.data.iter().map(|left| combine(*left, right)).collect(),
                self.shape.clone(),
                self.dims.clone(),
            ));
        }

        if self.shape != other.shape {
            return Err(ShapeError::Mismatch {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        }

        Ok((
            self.data
                .iter()
                .zip(other.data.iter())
                .map(|(left, right)| combine(*left, *right))
                .collect(),
            self.shape.clone(),
            self.dims.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::NormSelector;

    fn array_2x3() -> PhysArray {
        PhysArray {
            name: String::from("v"),
            data: vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0],
            shape: vec![2, 3],
            dims: vec![String::from("t"), String::from("x")],
            units: Units::one(),
            positive: None,
            datatype: Datatype::F64,
        }
    }

    #[test]
    fn slice_keeps_ranges_and_drops_indices() {
        let array = array_2x3();
        let sliced = array.slice(&[
            NormSelector::Index(1),
            NormSelector::Range {
                start: 0,
                len: 2,
                step: 1,
            },
        ]);
        assert_eq!(sliced.shape, vec![2]);
        assert_eq!(sliced.dims, vec![String::from("x")]);
        assert_eq!(sliced.data, vec![10.0, 11.0]);
    }

    #[test]
    fn slice_with_negative_step() {
        let array = array_2x3();
        let sliced = array.slice(&[
            NormSelector::Range {
                start: 0,
                len: 2,
                step: 1,
            },
            NormSelector::Range {
                start: 2,
                len: 3,
                step: -1,
            },
        ]);
        assert_eq!(sliced.data, vec![2.0, 1.0, 0.0, 12.0, 11.0, 10.0]);
    }

    #[test]
    fn slice_to_scalar() {
        let array = array_2x3();
        let sliced = array.slice(&[NormSelector::Index(0), NormSelector::Index(2)]);
        assert!(sliced.is_scalar());
        assert_eq!(sliced.data, vec![2.0]);
    }

    #[test]
    fn slice_empty_range() {
        let array = array_2x3();
        let sliced = array.slice(&[
            NormSelector::Range {
                start: 0,
                len: 0,
                step: 1,
            },
            NormSelector::full(3),
        ]);
        assert_eq!(sliced.shape, vec![0, 3]);
        assert!(sliced.data.is_empty());
    }

    #[test]
    fn transpose_reverses_order() {
        let array = array_2x3();
        let transposed = array
            .transposed(&[String::from("x"), String::from("t")])
            .unwrap();
        assert_eq!(transposed.shape, vec![3, 2]);
        assert_eq!(transposed.data, vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
    }

    #[test]
    fn transpose_rejects_non_permutation() {
        let array = array_2x3();
        assert!(array
            .transposed(&[String::from("t"), String::from("y")])
            .is_err());
    }

    #[test]
    fn zip_with_broadcasts_scalars() {
        let array = array_2x3();
        let two = PhysArray::scalar("2", 2.0, Datatype::I64);
        let (data, shape, dims) = array.zip_with(&two, |a, b| a * b).unwrap();
        assert_eq!(shape, array.shape);
        assert_eq!(dims, array.dims);
        assert_eq!(data, vec![0.0, 2.0, 4.0, 20.0, 22.0, 24.0]);
    }

    #[test]
    fn zip_with_rejects_shape_mismatch() {
        let array = array_2x3();
        let other = PhysArray {
            shape: vec![3, 2],
            data: vec![0.0; 6],
            ..array_2x3()
        };
        assert!(array.zip_with(&other, |a, b| a + b).is_err());
    }

    #[test]
    fn mean_over_one_axis() {
        let array = array_2x3();
        let reduced = array.mean_over(&[String::from("t")]).unwrap();
        assert_eq!(reduced.dims, vec![String::from("x")]);
        assert_eq!(reduced.data, vec![5.0, 6.0, 7.0]);

        let reduced = array.mean_over(&[String::from("x")]).unwrap();
        assert_eq!(reduced.data, vec![1.0, 11.0]);
    }

    #[test]
    fn mean_over_all_axes() {
        let array = array_2x3();
        let reduced = array
            .mean_over(&[String::from("t"), String::from("x")])
            .unwrap();
        assert!(reduced.is_scalar());
        assert_eq!(reduced.data, vec![6.0]);
    }

    #[test]
    fn mean_over_unknown_axis_fails() {
        let array = array_2x3();
        assert!(array.mean_over(&[String::from("y")]).is_err());
    }

    #[test]
    fn same_kind_casts() {
        assert!(Datatype::I32.castable_to(Datatype::I16));
        assert!(Datatype::I32.castable_to(Datatype::F32));
        assert!(Datatype::F64.castable_to(Datatype::F32));
        assert!(!Datatype::F64.castable_to(Datatype::I64));
        assert!(!Datatype::Char.castable_to(Datatype::I8));
    }
}
