//! Native on-disk container.
//!
//! A self-describing single-file layout for array datasets. It starts with a
//! magic sequence `0x43 0x4e 0x46 0x2f 0x41` (i.e., `CNF/A` in ASCII)
//! followed by the version number in ASCII (currently *1*, i.e., `0x31`).
//!
//! The file is then a sequence of byte tokens followed by the data specific
//! for the item the token represents:
//!
//! * `Format`: `0xf0 ; 1B`. The declared format tag of the dataset.
//! * `Attribute`: `0xf1 ; null-terminated name ; AttrValue`. A global
//!   attribute.
//! * `Dimension`: `0xf2 ; null-terminated name ; 8B size ; 1B unlimited`.
//! * `Variable`: `0xf3 ; null-terminated name ; 1B element type ; 1B n_dims ;
//!   n_dims * null-terminated name ; 4B n_attrs ; n_attrs * (null-terminated
//!   name ; AttrValue) ; 8B n_elems ; n_elems * element`. Elements are stored
//!   in native byte order, row-major.
//! * `AttrValue`: `0x01 ; null-terminated string` or `0x02 ; 8B integer` or
//!   `0x03 ; 8B float`.
//!
//! Writes are buffered in memory and serialized on `close`, so a partially
//! written output never reaches disk with a valid header.

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::memory::FileImage;
use super::{DimensionInfo, Format, IoError, ReadHandle, Store, VariableInfo, WriteHandle};
use crate::array::{AttrValue, Attrs, Datatype, RawArray};
use crate::index::NormSelector;

const MAGIC: &[u8] = b"CNF/A";
const VERSION: u8 = b'1';

const TOKEN_FORMAT: u8 = 0xf0;
const TOKEN_ATTRIBUTE: u8 = 0xf1;
const TOKEN_DIMENSION: u8 = 0xf2;
const TOKEN_VARIABLE: u8 = 0xf3;

const ATTR_STR: u8 = 0x01;
const ATTR_INT: u8 = 0x02;
const ATTR_FLOAT: u8 = 0x03;

fn format_tag(format: Format) -> u8 {
    match format {
        Format::Classic => 0,
        Format::Offset64 => 1,
        Format::Data64 => 2,
        Format::V4 => 3,
        Format::V4Classic => 4,
    }
}

fn format_from_tag(tag: u8) -> Option<Format> {
    match tag {
        0 => Some(Format::Classic),
        1 => Some(Format::Offset64),
        2 => Some(Format::Data64),
        3 => Some(Format::V4),
        4 => Some(Format::V4Classic),
        _ => None,
    }
}

fn datatype_tag(datatype: Datatype) -> u8 {
    match datatype {
        Datatype::I8 => 0x10,
        Datatype::U8 => 0x11,
        Datatype::I16 => 0x12,
        Datatype::U16 => 0x13,
        Datatype::I32 => 0x14,
        Datatype::U32 => 0x15,
        Datatype::I64 => 0x16,
        Datatype::U64 => 0x17,
        Datatype::F32 => 0x18,
        Datatype::F64 => 0x19,
        Datatype::Char => 0x1a,
    }
}

fn datatype_from_tag(tag: u8) -> Option<Datatype> {
    match tag {
        0x10 => Some(Datatype::I8),
        0x11 => Some(Datatype::U8),
        0x12 => Some(Datatype::I16),
        0x13 => Some(Datatype::U16),
        0x14 => Some(Datatype::I32),
        0x15 => Some(Datatype::U32),
        0x16 => Some(Datatype::I64),
        0x17 => Some(Datatype::U64),
        0x18 => Some(Datatype::F32),
        0x19 => Some(Datatype::F64),
        0x1a => Some(Datatype::Char),
        _ => None,
    }
}

#[derive(Debug)]
pub enum ParseError {
    UnexpectedByte {
        pos: usize,
        byte: u8,
        expected: Vec<u8>,
    },
    UnexpectedEof {
        n_bytes: usize,
    },
    ReadError {
        inner: io::Error,
    },
    InvalidFormat,
    UnsupportedVersion {
        version: u8,
    },
    InvalidUtf {
        value: Vec<u8>,
    },
    InvalidData {
        reason: String,
    },
}

impl ParseError {
    fn from_io(err: io::Error, n_bytes: usize) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ParseError::UnexpectedEof { n_bytes },
            _ => ParseError::ReadError { inner: err },
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedByte {
                pos,
                byte,
                expected,
            } => {
                write!(
                    f,
                    "unexpected byte 0x{:x} at position {}, expected one of 0x{:x}",
                    byte, pos, expected[0]
                )?;
                for byte in expected.iter().skip(1) {
                    write!(f, ", 0x{:x}", byte)?;
                }
                Ok(())
            }
            ParseError::UnexpectedEof { n_bytes } => {
                write!(f, "unexpected end of file when reading {} bytes", n_bytes)
            }
            ParseError::ReadError { inner } => write!(f, "{}", inner),
            ParseError::InvalidFormat => write!(f, "invalid format of data file"),
            ParseError::UnsupportedVersion { version } => {
                write!(f, "unsupported version {}", version)
            }
            ParseError::InvalidUtf { value } => write!(
                f,
                "invalid utf-8 encoding ({})",
                value
                    .iter()
                    .map(|byte| format!("0x{:x}", byte))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
            ParseError::InvalidData { reason } => write!(f, "invalid data, reason: {}", reason),
        }
    }
}

type ParseResult<T> = Result<T, ParseError>;

struct Parser<R> {
    source: R,
    byte_pos: usize,
}

macro_rules! read_n {
    ($parser:expr, $n:expr) => {{
        let mut buf = [0u8; $n];
        $parser.read_exact(&mut buf).map(|_| buf)
    }};
}

impl<R: BufRead> Parser<R> {
    fn new(source: R) -> Self {
        Parser {
            source,
            byte_pos: 0,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ParseResult<()> {
        self.source
            .read_exact(buf)
            .map_err(|err| ParseError::from_io(err, buf.len()))?;
        self.byte_pos += buf.len();
        Ok(())
    }

    fn at_eof(&mut self) -> ParseResult<bool> {
        let buffered = self
            .source
            .fill_buf()
            .map_err(|err| ParseError::from_io(err, 1))?;
        Ok(buffered.is_empty())
    }

    fn parse_u8(&mut self) -> ParseResult<u8> {
        Ok(u8::from_ne_bytes(read_n!(self, 1)?))
    }

    fn parse_u32(&mut self) -> ParseResult<u32> {
        Ok(u32::from_ne_bytes(read_n!(self, 4)?))
    }

    fn parse_u64(&mut self) -> ParseResult<u64> {
        Ok(u64::from_ne_bytes(read_n!(self, 8)?))
    }

    fn parse_i64(&mut self) -> ParseResult<i64> {
        Ok(i64::from_ne_bytes(read_n!(self, 8)?))
    }

    fn parse_f64(&mut self) -> ParseResult<f64> {
        Ok(f64::from_ne_bytes(read_n!(self, 8)?))
    }

    fn parse_cstr(&mut self) -> ParseResult<String> {
        let mut buf = Vec::new();
        let n_bytes = self
            .source
            .read_until(0x0, &mut buf)
            .map_err(|err| ParseError::from_io(err, 1))?;
        self.byte_pos += n_bytes;

        if buf.pop() != Some(0x0) {
            return Err(ParseError::UnexpectedEof { n_bytes: 1 });
        }

        String::from_utf8(buf).map_err(|err| ParseError::InvalidUtf {
            value: err.into_bytes(),
        })
    }

    fn parse_header(&mut self) -> ParseResult<()> {
        let buf = read_n!(self, 6).map_err(|_| ParseError::InvalidFormat)?;
        if &buf[0..5] != MAGIC {
            return Err(ParseError::InvalidFormat);
        }
        if buf[5] != VERSION {
            return Err(ParseError::UnsupportedVersion {
                version: buf[5].overflowing_sub(b'0').0,
            });
        }
        Ok(())
    }

    fn parse_attr_value(&mut self) -> ParseResult<AttrValue> {
        match self.parse_u8()? {
            ATTR_STR => Ok(AttrValue::Str(self.parse_cstr()?)),
            ATTR_INT => Ok(AttrValue::Int(self.parse_i64()?)),
            ATTR_FLOAT => Ok(AttrValue::Float(self.parse_f64()?)),
            byte => Err(ParseError::UnexpectedByte {
                pos: self.byte_pos,
                byte,
                expected: vec![ATTR_STR, ATTR_INT, ATTR_FLOAT],
            }),
        }
    }

    fn parse_data(&mut self, datatype: Datatype, n_elems: usize) -> ParseResult<RawArray> {
        macro_rules! parse_elems {
            ($variant:ident, $typ:ty, $width:expr) => {{
                let mut values = Vec::with_capacity(n_elems);
                for _ in 0..n_elems {
                    values.push(<$typ>::from_ne_bytes(read_n!(self, $width)?));
                }
                RawArray::$variant(values)
            }};
        }

        Ok(match datatype {
            Datatype::I8 => parse_elems!(I8, i8, 1),
            Datatype::U8 => parse_elems!(U8, u8, 1),
            Datatype::I16 => parse_elems!(I16, i16, 2),
            Datatype::U16 => parse_elems!(U16, u16, 2),
            Datatype::I32 => parse_elems!(I32, i32, 4),
            Datatype::U32 => parse_elems!(U32, u32, 4),
            Datatype::I64 => parse_elems!(I64, i64, 8),
            Datatype::U64 => parse_elems!(U64, u64, 8),
            Datatype::F32 => parse_elems!(F32, f32, 4),
            Datatype::F64 => parse_elems!(F64, f64, 8),
            Datatype::Char => parse_elems!(Char, u8, 1),
        })
    }

    fn parse_variable(&mut self) -> ParseResult<(VariableInfo, RawArray)> {
        let name = self.parse_cstr()?;

        let dtype_byte = self.parse_u8()?;
        let datatype = datatype_from_tag(dtype_byte).ok_or(ParseError::UnexpectedByte {
            pos: self.byte_pos,
            byte: dtype_byte,
            expected: (0x10..=0x1a).collect(),
        })?;

        let n_dims = self.parse_u8()?;
        let mut dimensions = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dimensions.push(self.parse_cstr()?);
        }

        let n_attrs = self.parse_u32()?;
        let mut attrs = Attrs::new();
        for _ in 0..n_attrs {
            let name = self.parse_cstr()?;
            attrs.insert(name, self.parse_attr_value()?);
        }

        let n_elems = self.parse_u64()? as usize;
        let data = self.parse_data(datatype, n_elems)?;

        Ok((
            VariableInfo {
                name,
                datatype,
                dimensions,
                attrs,
            },
            data,
        ))
    }

    fn parse_image(&mut self) -> ParseResult<FileImage> {
        self.parse_header()?;

        let mut image = FileImage::new(Format::Classic);

        while !self.at_eof()? {
            match self.parse_u8()? {
                TOKEN_FORMAT => {
                    let tag = self.parse_u8()?;
                    image.format = format_from_tag(tag).ok_or(ParseError::InvalidData {
                        reason: format!("unknown format tag {}", tag),
                    })?;
                }
                TOKEN_ATTRIBUTE => {
                    let name = self.parse_cstr()?;
                    let value = self.parse_attr_value()?;
                    image.attrs.insert(name, value);
                }
                TOKEN_DIMENSION => {
                    let name = self.parse_cstr()?;
                    let size = self.parse_u64()? as usize;
                    let unlimited = self.parse_u8()? != 0;
                    image.dimensions.push(DimensionInfo {
                        name,
                        size,
                        unlimited,
                    });
                }
                TOKEN_VARIABLE => {
                    let (info, data) = self.parse_variable()?;
                    let expected = info
                        .dimensions
                        .iter()
                        .map(|dim| {
                            image
                                .dimensions
                                .iter()
                                .find(|have| &have.name == dim)
                                .map(|have| have.size)
                        })
                        .collect::<Option<Vec<_>>>()
                        .ok_or_else(|| ParseError::InvalidData {
                            reason: format!(
                                "variable \"{}\" references an undeclared dimension",
                                info.name
                            ),
                        })?;
                    if expected.iter().product::<usize>() != data.len() {
                        return Err(ParseError::InvalidData {
                            reason: format!(
                                "variable \"{}\" carries {} elements for shape {:?}",
                                info.name,
                                data.len(),
                                expected
                            ),
                        });
                    }
                    image.data.insert(info.name.clone(), data);
                    image.variables.push(info);
                }
                byte => {
                    return Err(ParseError::UnexpectedByte {
                        pos: self.byte_pos,
                        byte,
                        expected: vec![
                            TOKEN_FORMAT,
                            TOKEN_ATTRIBUTE,
                            TOKEN_DIMENSION,
                            TOKEN_VARIABLE,
                        ],
                    })
                }
            }
        }

        Ok(image)
    }
}

fn write_cstr<W: Write>(sink: &mut W, text: &str) -> io::Result<()> {
    sink.write_all(text.as_bytes())?;
    sink.write_all(&[0x0])
}

fn write_attr_value<W: Write>(sink: &mut W, value: &AttrValue) -> io::Result<()> {
    match value {
        AttrValue::Str(text) => {
            sink.write_all(&[ATTR_STR])?;
            write_cstr(sink, text)
        }
        AttrValue::Int(value) => {
            sink.write_all(&[ATTR_INT])?;
            sink.write_all(&value.to_ne_bytes())
        }
        AttrValue::Float(value) => {
            sink.write_all(&[ATTR_FLOAT])?;
            sink.write_all(&value.to_ne_bytes())
        }
    }
}

fn write_data<W: Write>(sink: &mut W, data: &RawArray) -> io::Result<()> {
    macro_rules! write_elems {
        ($values:expr) => {
            for value in $values {
                sink.write_all(&value.to_ne_bytes())?;
            }
        };
    }

    match data {
        RawArray::I8(values) => write_elems!(values),
        RawArray::U8(values) => write_elems!(values),
        RawArray::I16(values) => write_elems!(values),
        RawArray::U16(values) => write_elems!(values),
        RawArray::I32(values) => write_elems!(values),
        RawArray::U32(values) => write_elems!(values),
        RawArray::I64(values) => write_elems!(values),
        RawArray::U64(values) => write_elems!(values),
        RawArray::F32(values) => write_elems!(values),
        RawArray::F64(values) => write_elems!(values),
        RawArray::Char(values) => write_elems!(values),
    }
    Ok(())
}

fn write_image<W: Write>(sink: &mut W, image: &FileImage) -> io::Result<()> {
    sink.write_all(MAGIC)?;
    sink.write_all(&[VERSION])?;

    sink.write_all(&[TOKEN_FORMAT, format_tag(image.format)])?;

    for (name, value) in &image.attrs {
        sink.write_all(&[TOKEN_ATTRIBUTE])?;
        write_cstr(sink, name)?;
        write_attr_value(sink, value)?;
    }

    for dim in &image.dimensions {
        sink.write_all(&[TOKEN_DIMENSION])?;
        write_cstr(sink, &dim.name)?;
        sink.write_all(&(dim.size as u64).to_ne_bytes())?;
        sink.write_all(&[dim.unlimited as u8])?;
    }

    for var in &image.variables {
        sink.write_all(&[TOKEN_VARIABLE])?;
        write_cstr(sink, &var.name)?;
        sink.write_all(&[datatype_tag(var.datatype), var.dimensions.len() as u8])?;
        for dim in &var.dimensions {
            write_cstr(sink, dim)?;
        }
        sink.write_all(&(var.attrs.len() as u32).to_ne_bytes())?;
        for (name, value) in &var.attrs {
            write_cstr(sink, name)?;
            write_attr_value(sink, value)?;
        }
        let data = &image.data[&var.name];
        sink.write_all(&(data.len() as u64).to_ne_bytes())?;
        write_data(sink, data)?;
    }

    Ok(())
}

/// Store backed by native container files under a root directory.
pub struct NativeStore {
    root: PathBuf,
}

impl NativeStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        NativeStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Store for NativeStore {
    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>, IoError> {
        let path = self.resolve(name);
        let file = File::open(&path).map_err(|inner| match inner.kind() {
            io::ErrorKind::NotFound => IoError::NotFound(name.to_owned()),
            _ => IoError::Io {
                file: name.to_owned(),
                inner,
            },
        })?;

        let image = Parser::new(BufReader::new(file))
            .parse_image()
            .map_err(|err| IoError::Corrupt {
                file: name.to_owned(),
                reason: err.to_string(),
            })?;

        Ok(Box::new(NativeReadHandle {
            name: name.to_owned(),
            image,
        }))
    }

    fn create_write(&self, name: &str, format: Format) -> Result<Box<dyn WriteHandle>, IoError> {
        let path = self.resolve(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|inner| IoError::Io {
                file: name.to_owned(),
                inner,
            })?;
        }

        // Create the file eagerly so permission and path problems surface in
        // the open phase, not after the chunks have been computed.
        let file = File::create(&path).map_err(|inner| IoError::Io {
            file: name.to_owned(),
            inner,
        })?;

        Ok(Box::new(NativeWriteHandle {
            name: name.to_owned(),
            file: Some(file),
            image: Some(FileImage::new(format)),
        }))
    }
}

struct NativeReadHandle {
    name: String,
    image: FileImage,
}

impl ReadHandle for NativeReadHandle {
    fn attrs(&self) -> Attrs {
        self.image.attrs.clone()
    }

    fn dimensions(&self) -> Vec<DimensionInfo> {
        self.image.dimensions.clone()
    }

    fn variables(&self) -> Vec<VariableInfo> {
        self.image.variables.clone()
    }

    fn read(
        &mut self,
        variable: &str,
        selection: &[NormSelector],
    ) -> Result<(RawArray, Attrs), IoError> {
        self.image.read(&self.name, variable, selection)
    }
}

struct NativeWriteHandle {
    name: String,
    file: Option<File>,
    image: Option<FileImage>,
}

impl NativeWriteHandle {
    fn image_mut(&mut self) -> Result<&mut FileImage, IoError> {
        let name = &self.name;
        self.image
            .as_mut()
            .ok_or_else(|| IoError::Closed(name.clone()))
    }
}

impl WriteHandle for NativeWriteHandle {
    fn set_global_attrs(&mut self, attrs: &Attrs) -> Result<(), IoError> {
        self.image_mut()?.attrs = attrs.clone();
        Ok(())
    }

    fn create_dimension(
        &mut self,
        name: &str,
        size: usize,
        unlimited: bool,
    ) -> Result<(), IoError> {
        self.image_mut()?.add_dimension(name, size, unlimited);
        Ok(())
    }

    fn create_variable(
        &mut self,
        name: &str,
        datatype: Datatype,
        dimensions: &[String],
        fill_value: Option<f64>,
    ) -> Result<(), IoError> {
        let file_name = self.name.clone();
        let image = self.image_mut()?;

        let mut size = 1;
        for dim in dimensions {
            match image.dimension(dim) {
                Some(info) => size *= info.size,
                None => {
                    return Err(IoError::UnknownDimension {
                        file: file_name,
                        dimension: dim.clone(),
                    })
                }
            }
        }

        image.variables.push(VariableInfo {
            name: name.to_owned(),
            datatype,
            dimensions: dimensions.to_vec(),
            attrs: Attrs::new(),
        });
        image.data.insert(
            name.to_owned(),
            RawArray::filled(datatype, size, fill_value.unwrap_or(0.0)),
        );
        Ok(())
    }

    fn set_attrs(&mut self, variable: &str, attrs: &Attrs) -> Result<(), IoError> {
        let file_name = self.name.clone();
        let image = self.image_mut()?;
        match image.variables.iter_mut().find(|var| var.name == variable) {
            Some(var) => {
                var.attrs = attrs.clone();
                Ok(())
            }
            None => Err(IoError::UnknownVariable {
                file: file_name,
                variable: variable.to_owned(),
            }),
        }
    }

    fn write(
        &mut self,
        variable: &str,
        origin: &[usize],
        shape: &[usize],
        array: &RawArray,
    ) -> Result<(), IoError> {
        let file_name = self.name.clone();
        let image = self.image_mut()?;

        let full_shape =
            image
                .variable_shape(variable)
                .ok_or_else(|| IoError::UnknownVariable {
                    file: file_name,
                    variable: variable.to_owned(),
                })?;

        let in_range = origin.len() == full_shape.len()
            && shape.len() == full_shape.len()
            && origin
                .iter()
                .zip(shape.iter())
                .zip(full_shape.iter())
                .all(|((start, len), full)| start + len <= *full);
        if !in_range {
            return Err(IoError::OutOfRange {
                variable: variable.to_owned(),
            });
        }

        let positions = super::region_positions(origin, shape, &full_shape);
        if positions.len() != array.len() {
            return Err(IoError::OutOfRange {
                variable: variable.to_owned(),
            });
        }

        let buffer = image.data.get_mut(variable).unwrap();
        if !buffer.scatter(&positions, array) {
            return Err(IoError::TypeMismatch {
                variable: variable.to_owned(),
            });
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), IoError> {
        let image = self.image.take().ok_or_else(|| IoError::Closed(self.name.clone()))?;
        let file = self.file.take().ok_or_else(|| IoError::Closed(self.name.clone()))?;

        let mut sink = BufWriter::new(file);
        write_image(&mut sink, &image).map_err(|inner| IoError::Io {
            file: self.name.clone(),
            inner,
        })?;
        sink.flush().map_err(|inner| IoError::Io {
            file: self.name.clone(),
            inner,
        })
    }
}
