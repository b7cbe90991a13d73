//! Output specification.
//!
//! The target of a run is described by a JSON document with a top-level
//! `attributes` map and a `files` map. Each file entry declares its `format`,
//! `attributes`, `dimensions` (size or `"unlimited"`) and `variables`; each
//! variable declares `datatype`, `dimensions`, `attributes` and a
//! `definition`, which is either an expression string or an array literal.
//!
//! # Examples
//!
//! ```json
//! {
//!     "attributes": {"institution": "NCAR"},
//!     "files": {
//!         "Tc.arr": {
//!             "format": "v4",
//!             "attributes": {"title": "surface temperature"},
//!             "dimensions": {"t": "unlimited", "x": 4},
//!             "variables": {
//!                 "Tc": {
//!                     "datatype": "double",
//!                     "dimensions": ["t", "x"],
//!                     "attributes": {"units": "degC"},
//!                     "definition": "T"
//!                 }
//!             }
//!         }
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde_json::Value;

use crate::array::{AttrValue, Attrs, Datatype};
use crate::io::Format;

#[derive(Debug)]
pub enum LoadSpecError {
    Io(io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for LoadSpecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSpecError::Io(error) => write!(f, "{}", error),
            LoadSpecError::Json(error) => write!(f, "invalid specification syntax: {}", error),
            LoadSpecError::Invalid(error) => {
                write!(f, "invalid specification format: {}", error)
            }
        }
    }
}

fn invalid<T, S: Into<String>>(message: S) -> Result<T, LoadSpecError> {
    Err(LoadSpecError::Invalid(message.into()))
}

/// How an output variable gets its values.
#[derive(Clone, PartialEq, Debug)]
pub enum Definition {
    /// An expression over input variables, parsed later.
    Expression(String),
    /// An array literal, used verbatim.
    Data { values: Vec<f64>, shape: Vec<usize> },
}

/// Declared direction of a coordinate variable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Increasing,
    Decreasing,
}

impl Direction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "increasing" => Some(Direction::Increasing),
            "decreasing" => Some(Direction::Decreasing),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Increasing => write!(f, "increasing"),
            Direction::Decreasing => write!(f, "decreasing"),
        }
    }
}

/// One declared output variable.
#[derive(Clone, Debug)]
pub struct VariableSpec {
    pub name: String,
    pub datatype: Datatype,
    pub dimensions: Vec<String>,
    pub attrs: Attrs,
    pub definition: Definition,
}

impl VariableSpec {
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|value| value.as_str())
    }

    pub fn units_attr(&self) -> Option<&str> {
        self.attr_str("units")
    }

    pub fn calendar_attr(&self) -> Option<&str> {
        self.attr_str("calendar")
    }

    pub fn direction(&self) -> Option<Direction> {
        self.attr_str("direction").and_then(Direction::parse)
    }

    /// A declared coordinate: one-dimensional with an `axis` attribute or
    /// spanning only its own name.
    pub fn is_coordinate(&self) -> bool {
        self.dimensions.len() == 1
            && (self.attrs.contains_key("axis") || self.dimensions[0] == self.name)
    }
}

/// One declared output file.
#[derive(Clone, Debug)]
pub struct FileSpec {
    pub name: String,
    pub format: Format,
    pub attrs: Attrs,
    pub dimensions: BTreeMap<String, DimensionSpec>,
    pub variables: Vec<VariableSpec>,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DimensionSpec {
    pub size: Option<usize>,
    pub unlimited: bool,
}

/// The whole target specification.
#[derive(Clone, Debug)]
pub struct Specification {
    pub attrs: Attrs,
    pub files: Vec<FileSpec>,
}

impl Specification {
    /// Loads and validates a specification file.
    pub fn load_from_file<P: AsRef<Path>>(filepath: P) -> Result<Self, LoadSpecError> {
        let mut file = File::open(&filepath).map_err(LoadSpecError::Io)?;
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(LoadSpecError::Io)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, LoadSpecError> {
        let value = serde_json::from_str(content).map_err(LoadSpecError::Json)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, LoadSpecError> {
        let root = match value.as_object() {
            Some(root) => root,
            None => return invalid("the specification must be an object"),
        };

        let mut attrs = Attrs::new();
        let mut files = Vec::new();

        for (key, value) in root {
            match key.as_str() {
                "attributes" => attrs = parse_attrs(value)?,
                "files" => {
                    let entries = match value.as_object() {
                        Some(entries) => entries,
                        None => return invalid("\"files\" must be an object"),
                    };
                    for (name, entry) in entries {
                        files.push(parse_file(name, entry)?);
                    }
                }
                option => {
                    return invalid(format!("unknown specification option \"{}\"", option))
                }
            }
        }

        if files.is_empty() {
            return invalid("the specification declares no output files");
        }

        // Deterministic processing order regardless of the JSON map order.
        files.sort_by(|left, right| left.name.cmp(&right.name));

        Ok(Specification { attrs, files })
    }

    /// All declared output variables across files.
    pub fn variables(&self) -> impl Iterator<Item = (&FileSpec, &VariableSpec)> {
        self.files
            .iter()
            .flat_map(|file| file.variables.iter().map(move |var| (file, var)))
    }
}

fn parse_attrs(value: &Value) -> Result<Attrs, LoadSpecError> {
    let entries = match value.as_object() {
        Some(entries) => entries,
        None => return invalid("attributes must be an object"),
    };

    let mut attrs = Attrs::new();
    for (name, value) in entries {
        let parsed = match value {
            Value::String(text) => AttrValue::Str(text.clone()),
            Value::Number(number) => match number.as_i64() {
                Some(int) => AttrValue::Int(int),
                None => AttrValue::Float(number.as_f64().unwrap()),
            },
            _ => {
                return invalid(format!(
                    "attribute \"{}\" must be a string or a number",
                    name
                ))
            }
        };
        attrs.insert(name.clone(), parsed);
    }

    Ok(attrs)
}

fn parse_file(name: &str, value: &Value) -> Result<FileSpec, LoadSpecError> {
    let entry = match value.as_object() {
        Some(entry) => entry,
        None => return invalid(format!("file \"{}\" must be an object", name)),
    };

    let mut format = None;
    let mut attrs = Attrs::new();
    let mut dimensions = BTreeMap::new();
    let mut variables = Vec::new();

    for (key, value) in entry {
        match key.as_str() {
            "format" => {
                let text = match value.as_str() {
                    Some(text) => text,
                    None => return invalid(format!("format of \"{}\" must be a string", name)),
                };
                format = match Format::parse(text) {
                    Some(format) => Some(format),
                    None => {
                        return invalid(format!(
                            "file \"{}\" declares unknown format \"{}\"",
                            name, text
                        ))
                    }
                };
            }
            "attributes" => attrs = parse_attrs(value)?,
            "dimensions" => {
                let entries = match value.as_object() {
                    Some(entries) => entries,
                    None => {
                        return invalid(format!("dimensions of \"{}\" must be an object", name))
                    }
                };
                for (dim, size) in entries {
                    dimensions.insert(dim.clone(), parse_dimension(name, dim, size)?);
                }
            }
            "variables" => {
                let entries = match value.as_object() {
                    Some(entries) => entries,
                    None => {
                        return invalid(format!("variables of \"{}\" must be an object", name))
                    }
                };
                for (var, entry) in entries {
                    variables.push(parse_variable(var, entry)?);
                }
            }
            option => {
                return invalid(format!(
                    "unknown option \"{}\" in file \"{}\"",
                    option, name
                ))
            }
        }
    }

    let format = match format {
        Some(format) => format,
        None => return invalid(format!("file \"{}\" declares no format", name)),
    };

    variables.sort_by(|left, right| left.name.cmp(&right.name));

    for var in &variables {
        for dim in &var.dimensions {
            if !dimensions.contains_key(dim) {
                return invalid(format!(
                    "variable \"{}\" in file \"{}\" references undeclared dimension \"{}\"",
                    var.name, name, dim
                ));
            }
        }
    }

    Ok(FileSpec {
        name: name.to_owned(),
        format,
        attrs,
        dimensions,
        variables,
    })
}

fn parse_dimension(file: &str, dim: &str, value: &Value) -> Result<DimensionSpec, LoadSpecError> {
    match value {
        Value::String(text) if text == "unlimited" => Ok(DimensionSpec {
            size: None,
            unlimited: true,
        }),
        Value::Number(number) => match number.as_u64() {
            Some(size) => Ok(DimensionSpec {
                size: Some(size as usize),
                unlimited: false,
            }),
            None => invalid(format!(
                "dimension \"{}\" of \"{}\" must have a non-negative size",
                dim, file
            )),
        },
        _ => invalid(format!(
            "dimension \"{}\" of \"{}\" must be a size or \"unlimited\"",
            dim, file
        )),
    }
}

fn parse_variable(name: &str, value: &Value) -> Result<VariableSpec, LoadSpecError> {
    let entry = match value.as_object() {
        Some(entry) => entry,
        None => return invalid(format!("variable \"{}\" must be an object", name)),
    };

    let mut datatype = None;
    let mut dimensions = Vec::new();
    let mut attrs = Attrs::new();
    let mut definition = None;

    for (key, value) in entry {
        match key.as_str() {
            "datatype" => {
                let text = match value.as_str() {
                    Some(text) => text,
                    None => {
                        return invalid(format!("datatype of \"{}\" must be a string", name))
                    }
                };
                datatype = match Datatype::parse(text) {
                    Some(datatype) => Some(datatype),
                    None => {
                        return invalid(format!(
                            "variable \"{}\" declares unknown datatype \"{}\"",
                            name, text
                        ))
                    }
                };
            }
            "dimensions" => {
                let entries = match value.as_array() {
                    Some(entries) => entries,
                    None => {
                        return invalid(format!("dimensions of \"{}\" must be an array", name))
                    }
                };
                for dim in entries {
                    match dim.as_str() {
                        Some(dim) => dimensions.push(dim.to_owned()),
                        None => {
                            return invalid(format!(
                                "dimensions of \"{}\" must be strings",
                                name
                            ))
                        }
                    }
                }
            }
            "attributes" => attrs = parse_attrs(value)?,
            "definition" => {
                definition = Some(match value {
                    Value::String(text) => Definition::Expression(text.clone()),
                    Value::Array(_) => parse_data_definition(name, value)?,
                    _ => {
                        return invalid(format!(
                            "definition of \"{}\" must be a string or an array",
                            name
                        ))
                    }
                });
            }
            option => {
                return invalid(format!(
                    "unknown option \"{}\" in variable \"{}\"",
                    option, name
                ))
            }
        }
    }

    let datatype = match datatype {
        Some(datatype) => datatype,
        None => return invalid(format!("variable \"{}\" declares no datatype", name)),
    };
    let definition = match definition {
        Some(definition) => definition,
        None => return invalid(format!("variable \"{}\" declares no definition", name)),
    };

    Ok(VariableSpec {
        name: name.to_owned(),
        datatype,
        dimensions,
        attrs,
        definition,
    })
}

/// Flattens a (possibly nested) array literal into values plus shape,
/// checking that nesting is rectangular.
fn parse_data_definition(name: &str, value: &Value) -> Result<Definition, LoadSpecError> {
    fn flatten(
        name: &str,
        value: &Value,
        depth: usize,
        shape: &mut Vec<usize>,
        values: &mut Vec<f64>,
    ) -> Result<(), LoadSpecError> {
        match value {
            Value::Array(items) => {
                if shape.len() == depth {
                    shape.push(items.len());
                } else if shape[depth] != items.len() {
                    return invalid(format!(
                        "array definition of \"{}\" is not rectangular",
                        name
                    ));
                }
                for item in items {
                    flatten(name, item, depth + 1, shape, values)?;
                }
                Ok(())
            }
            Value::Number(number) => {
                if depth != shape.len() {
                    return invalid(format!(
                        "array definition of \"{}\" mixes numbers and arrays",
                        name
                    ));
                }
                values.push(number.as_f64().unwrap());
                Ok(())
            }
            _ => invalid(format!(
                "array definition of \"{}\" must contain only numbers",
                name
            )),
        }
    }

    let mut shape = Vec::new();
    let mut values = Vec::new();
    flatten(name, value, 0, &mut shape, &mut values)?;
    Ok(Definition::Data { values, shape })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"{
        "attributes": {"institution": "somewhere"},
        "files": {
            "out.arr": {
                "format": "v4",
                "attributes": {"title": "output"},
                "dimensions": {"t": "unlimited", "x": 4},
                "variables": {
                    "Tc": {
                        "datatype": "double",
                        "dimensions": ["t", "x"],
                        "attributes": {"units": "degC"},
                        "definition": "T"
                    },
                    "x": {
                        "datatype": "double",
                        "dimensions": ["x"],
                        "attributes": {"units": "m", "axis": "X"},
                        "definition": [0, 1, 2, 3]
                    }
                }
            }
        }
    }"#;

    #[test]
    fn parses_a_complete_specification() {
        let spec = Specification::from_json_str(SPEC).unwrap();
        assert_eq!(spec.files.len(), 1);

        let file = &spec.files[0];
        assert_eq!(file.format, Format::V4);
        assert_eq!(
            file.dimensions["t"],
            DimensionSpec {
                size: None,
                unlimited: true
            }
        );
        assert_eq!(
            file.dimensions["x"],
            DimensionSpec {
                size: Some(4),
                unlimited: false
            }
        );

        let var = &file.variables[0];
        assert_eq!(var.name, "Tc");
        assert_eq!(var.datatype, Datatype::F64);
        assert_eq!(var.units_attr(), Some("degC"));
        assert_eq!(
            var.definition,
            Definition::Expression(String::from("T"))
        );

        let coord = &file.variables[1];
        assert!(coord.is_coordinate());
        assert_eq!(
            coord.definition,
            Definition::Data {
                values: vec![0.0, 1.0, 2.0, 3.0],
                shape: vec![4]
            }
        );
    }

    #[test]
    fn nested_array_definitions_keep_their_shape() {
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"a": 2, "b": 2},
                    "variables": {
                        "m": {
                            "datatype": "double",
                            "dimensions": ["a", "b"],
                            "definition": [[1, 2], [3, 4]]
                        }
                    }
                }
            }
        }"#;
        let spec = Specification::from_json_str(spec).unwrap();
        assert_eq!(
            spec.files[0].variables[0].definition,
            Definition::Data {
                values: vec![1.0, 2.0, 3.0, 4.0],
                shape: vec![2, 2]
            }
        );
    }

    #[test]
    fn ragged_array_definition_is_rejected() {
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"a": 2, "b": 2},
                    "variables": {
                        "m": {
                            "datatype": "double",
                            "dimensions": ["a", "b"],
                            "definition": [[1, 2], [3]]
                        }
                    }
                }
            }
        }"#;
        assert!(matches!(
            Specification::from_json_str(spec),
            Err(LoadSpecError::Invalid(_))
        ));
    }

    #[test]
    fn missing_format_is_rejected() {
        let spec = r#"{
            "files": {
                "out.arr": {
                    "dimensions": {},
                    "variables": {}
                }
            }
        }"#;
        assert!(matches!(
            Specification::from_json_str(spec),
            Err(LoadSpecError::Invalid(_))
        ));
    }

    #[test]
    fn undeclared_variable_dimension_is_rejected() {
        let spec = r#"{
            "files": {
                "out.arr": {
                    "format": "v4",
                    "dimensions": {"x": 2},
                    "variables": {
                        "v": {
                            "datatype": "double",
                            "dimensions": ["y"],
                            "definition": "v"
                        }
                    }
                }
            }
        }"#;
        assert!(matches!(
            Specification::from_json_str(spec),
            Err(LoadSpecError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let spec = r#"{"bogus": 1, "files": {}}"#;
        assert!(matches!(
            Specification::from_json_str(spec),
            Err(LoadSpecError::Invalid(_))
        ));
    }
}
