//! In-memory file store.
//!
//! Files live in a shared map of [`FileImage`]s. The store backs the test
//! suite and dry runs; it implements the same contract as the native backend,
//! including write bounds checks and the closed-handle guard.
//!
//! [`FileImage`]: struct.FileImage.html

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::{
    region_positions, selection_positions, DimensionInfo, Format, IoError, ReadHandle, Store,
    VariableInfo, WriteHandle,
};
use crate::array::{Attrs, Datatype, RawArray};
use crate::index::NormSelector;

/// A complete file: header plus per-variable data buffers.
#[derive(Clone, PartialEq, Debug)]
pub struct FileImage {
    pub format: Format,
    pub attrs: Attrs,
    pub dimensions: Vec<DimensionInfo>,
    pub variables: Vec<VariableInfo>,
    pub data: HashMap<String, RawArray>,
}

impl FileImage {
    pub fn new(format: Format) -> Self {
        FileImage {
            format,
            attrs: Attrs::new(),
            dimensions: Vec::new(),
            variables: Vec::new(),
            data: HashMap::new(),
        }
    }

    pub fn add_dimension(&mut self, name: &str, size: usize, unlimited: bool) {
        self.dimensions.push(DimensionInfo {
            name: name.to_owned(),
            size,
            unlimited,
        });
    }

    pub fn add_variable(
        &mut self,
        name: &str,
        datatype: Datatype,
        dimensions: &[&str],
        attrs: Attrs,
        data: RawArray,
    ) {
        self.variables.push(VariableInfo {
            name: name.to_owned(),
            datatype,
            dimensions: dimensions.iter().map(|dim| (*dim).to_owned()).collect(),
            attrs,
        });
        self.data.insert(name.to_owned(), data);
    }

    pub fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables.iter().find(|var| var.name == name)
    }

    pub fn dimension(&self, name: &str) -> Option<&DimensionInfo> {
        self.dimensions.iter().find(|dim| dim.name == name)
    }

    /// Shape of a variable derived from the dimension table.
    pub fn variable_shape(&self, name: &str) -> Option<Vec<usize>> {
        let var = self.variable(name)?;
        var.dimensions
            .iter()
            .map(|dim| self.dimension(dim).map(|info| info.size))
            .collect()
    }

    /// Reads the selected region of a variable out of the image. `file` is
    /// only used for error messages.
    pub fn read(
        &self,
        file: &str,
        variable: &str,
        selection: &[NormSelector],
    ) -> Result<(RawArray, Attrs), IoError> {
        let info = self
            .variable(variable)
            .ok_or_else(|| IoError::UnknownVariable {
                file: file.to_owned(),
                variable: variable.to_owned(),
            })?;
        let shape = self
            .variable_shape(variable)
            .ok_or_else(|| IoError::Corrupt {
                file: file.to_owned(),
                reason: format!("variable \"{}\" references unknown dimensions", variable),
            })?;

        let positions = selection_positions(selection, &shape);
        let buffer = self.data[variable].gather(&positions);
        Ok((buffer, info.attrs.clone()))
    }
}

type SharedFiles = Rc<RefCell<HashMap<String, FileImage>>>;

/// The in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
    files: SharedFiles,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            files: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Installs a prebuilt file, replacing any previous one of that name.
    pub fn insert(&self, name: &str, image: FileImage) {
        self.files.borrow_mut().insert(name.to_owned(), image);
    }

    /// A snapshot of the named file, if it exists.
    pub fn image(&self, name: &str) -> Option<FileImage> {
        self.files.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.borrow().contains_key(name)
    }
}

impl Store for MemoryStore {
    fn open_read(&self, name: &str) -> Result<Box<dyn ReadHandle>, IoError> {
        if !self.files.borrow().contains_key(name) {
            return Err(IoError::NotFound(name.to_owned()));
        }
        Ok(Box::new(MemoryReadHandle {
            files: self.files.clone(),
            name: name.to_owned(),
        }))
    }

    fn create_write(&self, name: &str, format: Format) -> Result<Box<dyn WriteHandle>, IoError> {
        Ok(Box::new(MemoryWriteHandle {
            files: self.files.clone(),
            name: name.to_owned(),
            image: Some(FileImage::new(format)),
        }))
    }
}

struct MemoryReadHandle {
    files: SharedFiles,
    name: String,
}

impl ReadHandle for MemoryReadHandle {
    fn attrs(&self) -> Attrs {
        self.files.borrow()[&self.name].attrs.clone()
    }

    fn dimensions(&self) -> Vec<DimensionInfo> {
        self.files.borrow()[&self.name].dimensions.clone()
    }

    fn variables(&self) -> Vec<VariableInfo> {
        self.files.borrow()[&self.name].variables.clone()
    }

    fn read(
        &mut self,
        variable: &str,
        selection: &[NormSelector],
    ) -> Result<(RawArray, Attrs), IoError> {
        let files = self.files.borrow();
        files[&self.name].read(&self.name, variable, selection)
    }
}

struct MemoryWriteHandle {
    files: SharedFiles,
    name: String,
    image: Option<FileImage>,
}

impl MemoryWriteHandle {
    fn image_mut(&mut self) -> Result<&mut FileImage, IoError> {
        let name = &self.name;
        self.image
            .as_mut()
            .ok_or_else(|| IoError::Closed(name.clone()))
    }
}

impl WriteHandle for MemoryWriteHandle {
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
        let name_for_error = self.name.clone();
        let image = self.image_mut()?;

        let mut size = 1;
        for dim in dimensions {
            match image.dimension(dim) {
                Some(info) => size *= info.size,
                None => {
                    return Err(IoError::UnknownDimension {
                        file: name_for_error,
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
        let image = self.image_mut()?;
        match image.variables.iter_mut().find(|var| var.name == variable) {
            Some(var) => {
                var.attrs = attrs.clone();
                Ok(())
            }
            None => Err(IoError::UnknownVariable {
                file: self.name.clone(),
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
        let name = self.name.clone();
        let image = self.image_mut()?;

        let full_shape = image
            .variable_shape(variable)
            .ok_or_else(|| IoError::UnknownVariable {
                file: name,
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

        let positions = region_positions(origin, shape, &full_shape);
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
        match self.image.take() {
            Some(image) => {
                self.files.borrow_mut().insert(self.name.clone(), image);
                Ok(())
            }
            None => Err(IoError::Closed(self.name.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_input() -> MemoryStore {
        let store = MemoryStore::new();
        let mut image = FileImage::new(Format::Classic);
        image.add_dimension("x", 3, false);
        image.add_variable(
            "v",
            Datatype::F64,
            &["x"],
            Attrs::new(),
            RawArray::F64(vec![1.0, 2.0, 3.0]),
        );
        store.insert("in.arr", image);
        store
    }

    #[test]
    fn read_selected_region() {
        let store = store_with_input();
        let mut handle = store.open_read("in.arr").unwrap();
        let (buffer, _) = handle
            .read(
                "v",
                &[NormSelector::Range {
                    start: 1,
                    len: 2,
                    step: 1,
                }],
            )
            .unwrap();
        assert_eq!(buffer, RawArray::F64(vec![2.0, 3.0]));
    }

    #[test]
    fn open_missing_file_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.open_read("nope.arr"),
            Err(IoError::NotFound(_))
        ));
    }

    #[test]
    fn write_lifecycle() {
        let store = MemoryStore::new();
        let mut handle = store.create_write("out.arr", Format::V4).unwrap();
        handle.create_dimension("x", 2, false).unwrap();
        handle
            .create_variable("v", Datatype::F64, &[String::from("x")], Some(-1.0))
            .unwrap();
        handle
            .write("v", &[0], &[2], &RawArray::F64(vec![5.0, 6.0]))
            .unwrap();
        handle.close().unwrap();

        let image = store.image("out.arr").unwrap();
        assert_eq!(image.data["v"], RawArray::F64(vec![5.0, 6.0]));
        assert!(handle.close().is_err());
    }

    #[test]
    fn unclosed_file_is_not_committed() {
        let store = MemoryStore::new();
        let mut handle = store.create_write("out.arr", Format::V4).unwrap();
        handle.create_dimension("x", 1, false).unwrap();
        drop(handle);
        assert!(!store.contains("out.arr"));
    }

    #[test]
    fn out_of_range_write_fails() {
        let store = MemoryStore::new();
        let mut handle = store.create_write("out.arr", Format::V4).unwrap();
        handle.create_dimension("x", 2, false).unwrap();
        handle
            .create_variable("v", Datatype::F64, &[String::from("x")], None)
            .unwrap();
        assert!(matches!(
            handle.write("v", &[1], &[2], &RawArray::F64(vec![0.0, 0.0])),
            Err(IoError::OutOfRange { .. })
        ));
    }

    #[test]
    fn type_mismatch_write_fails() {
        let store = MemoryStore::new();
        let mut handle = store.create_write("out.arr", Format::V4).unwrap();
        handle.create_dimension("x", 1, false).unwrap();
        handle
            .create_variable("v", Datatype::F64, &[String::from("x")], None)
            .unwrap();
        assert!(matches!(
            handle.write("v", &[0], &[1], &RawArray::I32(vec![1])),
            Err(IoError::TypeMismatch { .. })
        ));
    }
}
