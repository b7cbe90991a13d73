//! Input file catalog.
//!
//! The catalog ingests the headers of all input files and merges them into a
//! single schema: a dimension table, a variable table with the set of files
//! backing each variable, and per-file entries. Files must agree with each
//! other; disagreements on sizes, datatypes, dimension tuples or the
//! identifying attributes are rejected during ingestion. Entries are
//! immutable once the catalog is built.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::array::{Attrs, Datatype};
use crate::io::{IoError, Store};

/// Attributes that identify a variable; files may not disagree on them.
const IDENTIFYING_ATTRS: &[&str] = &["units", "standard_name"];

#[derive(Debug)]
pub enum ConsistencyError {
    DimensionSize {
        name: String,
        seen: usize,
        found: usize,
    },
    DimensionUnlimited {
        name: String,
    },
    VariableDatatype {
        name: String,
        seen: Datatype,
        found: Datatype,
    },
    VariableDimensions {
        name: String,
    },
    VariableAttribute {
        name: String,
        attribute: String,
    },
    MissingDimension {
        file: String,
        variable: String,
        dimension: String,
    },
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyError::DimensionSize { name, seen, found } => write!(
                f,
                "dimension \"{}\" has size {} in one file and {} in another",
                name, seen, found
            ),
            ConsistencyError::DimensionUnlimited { name } => write!(
                f,
                "dimension \"{}\" is unlimited in one file but not in another",
                name
            ),
            ConsistencyError::VariableDatatype { name, seen, found } => write!(
                f,
                "variable \"{}\" has datatype {} in one file and {} in another",
                name, seen, found
            ),
            ConsistencyError::VariableDimensions { name } => write!(
                f,
                "variable \"{}\" has different dimensions across files",
                name
            ),
            ConsistencyError::VariableAttribute { name, attribute } => write!(
                f,
                "variable \"{}\" has conflicting \"{}\" attributes across files",
                name, attribute
            ),
            ConsistencyError::MissingDimension {
                file,
                variable,
                dimension,
            } => write!(
                f,
                "variable \"{}\" in file \"{}\" references dimension \"{}\" which the file does not declare",
                variable, file, dimension
            ),
        }
    }
}

#[derive(Debug)]
pub enum CatalogError {
    Io(IoError),
    Consistency(ConsistencyError),
}

impl From<IoError> for CatalogError {
    fn from(err: IoError) -> Self {
        CatalogError::Io(err)
    }
}

impl From<ConsistencyError> for CatalogError {
    fn from(err: ConsistencyError) -> Self {
        CatalogError::Consistency(err)
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "{}", err),
            CatalogError::Consistency(err) => write!(f, "{}", err),
        }
    }
}

/// A dimension merged across the input files. An unlimited dimension whose
/// per-file sizes disagree keeps its size unset.
#[derive(Clone, Debug)]
pub struct Dimension {
    pub name: String,
    pub size: Option<usize>,
    pub unlimited: bool,
}

/// A variable merged across the input files.
#[derive(Clone, Debug)]
pub struct Variable {
    pub name: String,
    pub datatype: Datatype,
    pub dimensions: Vec<String>,
    pub attrs: Attrs,
    pub files: BTreeSet<String>,
}

impl Variable {
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|value| value.as_str())
    }

    pub fn units_attr(&self) -> Option<&str> {
        self.attr_str("units")
    }

    pub fn calendar_attr(&self) -> Option<&str> {
        self.attr_str("calendar")
    }

    /// A coordinate variable is one-dimensional over its own name, or carries
    /// an `axis` attribute.
    pub fn is_coordinate(&self) -> bool {
        (self.dimensions.len() == 1 && self.dimensions[0] == self.name)
            || self.attrs.contains_key("axis")
    }
}

/// The header of one ingested file.
#[derive(Clone, Debug)]
pub struct FileEntry {
    pub name: String,
    pub attrs: Attrs,
    pub dimensions: BTreeMap<String, (usize, bool)>,
    pub variables: Vec<String>,
}

/// The merged view over all input files.
pub struct Catalog {
    dimensions: BTreeMap<String, Dimension>,
    variables: BTreeMap<String, Variable>,
    files: BTreeMap<String, FileEntry>,
}

impl Catalog {
    /// Ingests the headers of the given files.
    pub fn from_store(store: &dyn Store, file_names: &[String]) -> Result<Self, CatalogError> {
        let mut catalog = Catalog {
            dimensions: BTreeMap::new(),
            variables: BTreeMap::new(),
            files: BTreeMap::new(),
        };

        for name in file_names {
            let handle = store.open_read(name)?;
            catalog.ingest(name, &*handle)?;
        }

        Ok(catalog)
    }

    fn ingest(&mut self, name: &str, handle: &dyn crate::io::ReadHandle) -> Result<(), CatalogError> {
        let dimensions = handle.dimensions();
        let variables = handle.variables();

        let mut entry = FileEntry {
            name: name.to_owned(),
            attrs: handle.attrs(),
            dimensions: BTreeMap::new(),
            variables: Vec::new(),
        };

        for dim in &dimensions {
            entry
                .dimensions
                .insert(dim.name.clone(), (dim.size, dim.unlimited));
            self.merge_dimension(&dim.name, dim.size, dim.unlimited)?;
        }

        for var in &variables {
            for dim in &var.dimensions {
                if !entry.dimensions.contains_key(dim) {
                    return Err(ConsistencyError::MissingDimension {
                        file: name.to_owned(),
                        variable: var.name.clone(),
                        dimension: dim.clone(),
                    }
                    .into());
                }
            }

            entry.variables.push(var.name.clone());
            self.merge_variable(name, &var.name, var.datatype, &var.dimensions, &var.attrs)?;
        }

        self.files.insert(name.to_owned(), entry);
        Ok(())
    }

    fn merge_dimension(
        &mut self,
        name: &str,
        size: usize,
        unlimited: bool,
    ) -> Result<(), ConsistencyError> {
        match self.dimensions.get_mut(name) {
            None => {
                self.dimensions.insert(
                    name.to_owned(),
                    Dimension {
                        name: name.to_owned(),
                        size: Some(size),
                        unlimited,
                    },
                );
                Ok(())
            }
            Some(seen) => {
                if seen.unlimited != unlimited {
                    return Err(ConsistencyError::DimensionUnlimited {
                        name: name.to_owned(),
                    });
                }
                match seen.size {
                    Some(seen_size) if seen_size != size => {
                        if unlimited {
                            // The record dimension naturally grows from file
                            // to file; its merged size is unknowable.
                            seen.size = None;
                            Ok(())
                        } else {
                            Err(ConsistencyError::DimensionSize {
                                name: name.to_owned(),
                                seen: seen_size,
                                found: size,
                            })
                        }
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn merge_variable(
        &mut self,
        file: &str,
        name: &str,
        datatype: Datatype,
        dimensions: &[String],
        attrs: &Attrs,
    ) -> Result<(), ConsistencyError> {
        match self.variables.get_mut(name) {
            None => {
                let mut files = BTreeSet::new();
                files.insert(file.to_owned());
                self.variables.insert(
                    name.to_owned(),
                    Variable {
                        name: name.to_owned(),
                        datatype,
                        dimensions: dimensions.to_vec(),
                        attrs: attrs.clone(),
                        files,
                    },
                );
                Ok(())
            }
            Some(seen) => {
                if seen.datatype != datatype {
                    return Err(ConsistencyError::VariableDatatype {
                        name: name.to_owned(),
                        seen: seen.datatype,
                        found: datatype,
                    });
                }
                if seen.dimensions != dimensions {
                    return Err(ConsistencyError::VariableDimensions {
                        name: name.to_owned(),
                    });
                }

                for attribute in IDENTIFYING_ATTRS {
                    let ours = seen.attrs.get(*attribute);
                    let theirs = attrs.get(*attribute);
                    if let (Some(ours), Some(theirs)) = (ours, theirs) {
                        if ours != theirs {
                            return Err(ConsistencyError::VariableAttribute {
                                name: name.to_owned(),
                                attribute: (*attribute).to_owned(),
                            });
                        }
                    }
                }

                // Attribute differences are tolerated otherwise; the merged
                // variable keeps the union, first value wins.
                for (key, value) in attrs {
                    seen.attrs.entry(key.clone()).or_insert_with(|| value.clone());
                }

                seen.files.insert(file.to_owned());
                Ok(())
            }
        }
    }

    pub fn n_files(&self) -> usize {
        self.files.len()
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.get(name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    /// A time-series variable lives in exactly one file of a multi-file
    /// dataset.
    pub fn is_time_series(&self, name: &str) -> bool {
        match self.variables.get(name) {
            Some(var) => self.n_files() > 1 && var.files.len() == 1,
            None => false,
        }
    }

    /// A metadata variable appears in every input file.
    pub fn is_metadata(&self, name: &str) -> bool {
        match self.variables.get(name) {
            Some(var) => var.files.len() == self.n_files(),
            None => false,
        }
    }

    /// The file a read of this variable is served from. Time-series
    /// variables have exactly one; metadata variables are read from the
    /// first file carrying them.
    pub fn backing_file(&self, name: &str) -> Option<&str> {
        self.variables
            .get(name)
            .and_then(|var| var.files.iter().next())
            .map(|file| file.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{AttrValue, RawArray};
    use crate::io::memory::{FileImage, MemoryStore};
    use crate::io::Format;

    fn units(text: &str) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert(String::from("units"), AttrValue::Str(text.to_owned()));
        attrs
    }

    fn input_file(var: &str, n: usize, units_text: &str) -> FileImage {
        let mut image = FileImage::new(Format::Classic);
        image.add_dimension("x", n, false);
        image.add_variable(
            var,
            Datatype::F64,
            &["x"],
            units(units_text),
            RawArray::F64(vec![0.0; n]),
        );
        image
    }

    #[test]
    fn merges_two_files() {
        let store = MemoryStore::new();
        let mut first = input_file("T", 3, "K");
        first.add_variable(
            "x",
            Datatype::F64,
            &["x"],
            units("m"),
            RawArray::F64(vec![0.0, 1.0, 2.0]),
        );
        store.insert("a.arr", first);

        let mut second = input_file("P", 3, "Pa");
        second.add_variable(
            "x",
            Datatype::F64,
            &["x"],
            units("m"),
            RawArray::F64(vec![0.0, 1.0, 2.0]),
        );
        store.insert("b.arr", second);

        let catalog = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        )
        .unwrap();

        assert_eq!(catalog.n_files(), 2);
        assert!(catalog.is_time_series("T"));
        assert!(catalog.is_time_series("P"));
        assert!(catalog.is_metadata("x"));
        assert_eq!(catalog.variable("x").unwrap().files.len(), 2);
    }

    #[test]
    fn rejects_dimension_size_conflict() {
        let store = MemoryStore::new();
        store.insert("a.arr", input_file("T", 3, "K"));
        store.insert("b.arr", input_file("P", 4, "Pa"));

        let result = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        );
        assert!(matches!(
            result,
            Err(CatalogError::Consistency(
                ConsistencyError::DimensionSize { .. }
            ))
        ));
    }

    #[test]
    fn unlimited_dimension_sizes_may_differ() {
        let store = MemoryStore::new();

        let mut first = FileImage::new(Format::Classic);
        first.add_dimension("t", 3, true);
        first.add_variable(
            "T",
            Datatype::F64,
            &["t"],
            units("K"),
            RawArray::F64(vec![0.0; 3]),
        );
        store.insert("a.arr", first);

        let mut second = FileImage::new(Format::Classic);
        second.add_dimension("t", 5, true);
        second.add_variable(
            "P",
            Datatype::F64,
            &["t"],
            units("Pa"),
            RawArray::F64(vec![0.0; 5]),
        );
        store.insert("b.arr", second);

        let catalog = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        )
        .unwrap();
        assert_eq!(catalog.dimension("t").unwrap().size, None);
        assert!(catalog.dimension("t").unwrap().unlimited);
    }

    #[test]
    fn rejects_units_conflict() {
        let store = MemoryStore::new();
        store.insert("a.arr", input_file("T", 3, "K"));
        store.insert("b.arr", input_file("T", 3, "degC"));

        let result = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        );
        assert!(matches!(
            result,
            Err(CatalogError::Consistency(
                ConsistencyError::VariableAttribute { .. }
            ))
        ));
    }

    #[test]
    fn rejects_datatype_conflict() {
        let store = MemoryStore::new();
        store.insert("a.arr", input_file("T", 3, "K"));

        let mut second = FileImage::new(Format::Classic);
        second.add_dimension("x", 3, false);
        second.add_variable(
            "T",
            Datatype::F32,
            &["x"],
            units("K"),
            RawArray::F32(vec![0.0; 3]),
        );
        store.insert("b.arr", second);

        let result = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        );
        assert!(matches!(
            result,
            Err(CatalogError::Consistency(
                ConsistencyError::VariableDatatype { .. }
            ))
        ));
    }

    #[test]
    fn richer_attribute_set_wins() {
        let store = MemoryStore::new();
        store.insert("a.arr", input_file("T", 3, "K"));

        let mut attrs = units("K");
        attrs.insert(
            String::from("long_name"),
            AttrValue::Str(String::from("temperature")),
        );
        let mut second = FileImage::new(Format::Classic);
        second.add_dimension("x", 3, false);
        second.add_variable("T", Datatype::F64, &["x"], attrs, RawArray::F64(vec![0.0; 3]));
        store.insert("b.arr", second);

        let catalog = Catalog::from_store(
            &store,
            &[String::from("a.arr"), String::from("b.arr")],
        )
        .unwrap();
        assert_eq!(
            catalog.variable("T").unwrap().attr_str("long_name"),
            Some("temperature")
        );
    }
}
