//! Abstract file access consumed by the engine.
//!
//! The engine never touches bytes itself. It reads and writes through the
//! [`Store`] trait: a read handle exposes the header (attributes, dimensions,
//! variables) and indexed reads, a write handle exposes file construction and
//! hyperslab writes. Two backends are provided: an in-memory store used by
//! tests and dry runs, and a native on-disk container.
//!
//! [`Store`]: trait.Store.html

pub mod memory;
pub mod native;

use std::fmt;
use std::io;

use crate::array::{Attrs, Datatype, RawArray};
use crate::index::NormSelector;

/// Declared format variants of output files. The engine records the tag but
/// does not interpret the bit layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Format {
    Classic,
    Offset64,
    Data64,
    V4,
    V4Classic,
}

impl Format {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "compat-3/classic" => Some(Format::Classic),
            "compat-3/64-bit-offset" => Some(Format::Offset64),
            "compat-3/64-bit-data" => Some(Format::Data64),
            "v4" => Some(Format::V4),
            "v4-classic" => Some(Format::V4Classic),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::Classic => "compat-3/classic",
            Format::Offset64 => "compat-3/64-bit-offset",
            Format::Data64 => "compat-3/64-bit-data",
            Format::V4 => "v4",
            Format::V4Classic => "v4-classic",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A dimension as described by a file header.
#[derive(Clone, PartialEq, Debug)]
pub struct DimensionInfo {
    pub name: String,
    pub size: usize,
    pub unlimited: bool,
}

/// A variable as described by a file header.
#[derive(Clone, PartialEq, Debug)]
pub struct VariableInfo {
    pub name: String,
    pub datatype: Datatype,
    pub dimensions: Vec<String>,
    pub attrs: Attrs,
}

#[derive(Debug)]
pub enum IoError {
    NotFound(String),
    AlreadyExists(String),
    Io { file: String, inner: io::Error },
    Corrupt { file: String, reason: String },
    UnknownVariable { file: String, variable: String },
    UnknownDimension { file: String, dimension: String },
    TypeMismatch { variable: String },
    OutOfRange { variable: String },
    Closed(String),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::NotFound(file) => write!(f, "file \"{}\" does not exist", file),
            IoError::AlreadyExists(file) => write!(f, "file \"{}\" already exists", file),
            IoError::Io { file, inner } => write!(f, "{}: {}", file, inner),
            IoError::Corrupt { file, reason } => {
                write!(f, "file \"{}\" is corrupt: {}", file, reason)
            }
            IoError::UnknownVariable { file, variable } => {
                write!(f, "file \"{}\" has no variable \"{}\"", file, variable)
            }
            IoError::UnknownDimension { file, dimension } => {
                write!(f, "file \"{}\" has no dimension \"{}\"", file, dimension)
            }
            IoError::TypeMismatch { variable } => {
                write!(f, "array element type does not match variable \"{}\"", variable)
            }
            IoError::OutOfRange { variable } => {
                write!(f, "write region exceeds the extent of variable \"{}\"", variable)
            }
            IoError::Closed(file) => write!(f, "file \"{}\" is already closed", file),
        }
    }
}

/// Read access to one existing file. Dropping the handle releases the file.
pub trait ReadHandle {
    fn attrs(&self) -> Attrs;
    fn dimensions(&self) -> Vec<DimensionInfo>;
    fn variables(&self) -> Vec<VariableInfo>;

    /// Reads the selected region of a variable, returning the raw buffer and
    /// the variable's attributes.
    fn read(&mut self, variable: &str, selection: &[NormSelector])
        -> Result<(RawArray, Attrs), IoError>;
}

/// Write access to one file under construction.
pub trait WriteHandle {
    fn set_global_attrs(&mut self, attrs: &Attrs) -> Result<(), IoError>;
    fn create_dimension(&mut self, name: &str, size: usize, unlimited: bool)
        -> Result<(), IoError>;
    fn create_variable(
        &mut self,
        name: &str,
        datatype: Datatype,
        dimensions: &[String],
        fill_value: Option<f64>,
    ) -> Result<(), IoError>;
    fn set_attrs(&mut self, variable: &str, attrs: &Attrs) -> Result<(), IoError>;

    /// Writes a contiguous region with the given origin and region shape.
    fn write(
        &mut self,
        variable: &str,
        origin: &[usize],
        shape: &[usize],
        array: &RawArray,
    ) -> Result<(), IoError>;

    fn close(&mut self) -> Result<(), IoError>;
}

/// A collection of files addressed by name.
pub trait Store {
    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>, IoError>;
    fn create_write(&self, name: &str, format: Format) -> Result<Box<dyn WriteHandle>, IoError>;
}

/// Flat positions selected by a per-dimension selection in an array of the
/// given shape, in row-major request order.
pub fn selection_positions(selection: &[NormSelector], shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; shape.len()];
    for at in (0..shape.len().saturating_sub(1)).rev() {
        strides[at] = strides[at + 1] * shape[at + 1];
    }

    let counts = selection
        .iter()
        .map(|sel| sel.len().unwrap_or(1))
        .collect::<Vec<_>>();
    let total = counts.iter().product::<usize>();

    let mut positions = Vec::with_capacity(total);
    let mut counter = vec![0usize; selection.len()];

    'odometer: while total > 0 {
        let flat = selection
            .iter()
            .zip(counter.iter())
            .zip(strides.iter())
            .map(|((sel, at), stride)| sel.position(*at) * stride)
            .sum();
        positions.push(flat);

        for axis in (0..counter.len()).rev() {
            counter[axis] += 1;
            if counter[axis] < counts[axis] {
                continue 'odometer;
            }
            counter[axis] = 0;
        }
        break;
    }

    positions
}

/// Flat positions of a contiguous region given by origin and region shape.
pub fn region_positions(origin: &[usize], region: &[usize], shape: &[usize]) -> Vec<usize> {
    let selection = origin
        .iter()
        .zip(region.iter())
        .map(|(start, len)| NormSelector::Range {
            start: *start,
            len: *len,
            step: 1,
        })
        .collect::<Vec<_>>();
    selection_positions(&selection, shape)
}
