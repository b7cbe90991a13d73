//! Run configuration.
//!
//! The configuration is stored (by default) in `.conform.yml` in the working
//! directory. It names the target specification and the input files, and
//! tunes how the engine runs.
//!
//! * `specification` **(required)** -- Path to the JSON target specification
//!   describing the output files.
//!
//! * `inputs` **(required)** -- List of input file names, relative to
//!   `data_dir`.
//!
//! * `data_dir` (optional, default: `.`) -- Directory that holds the input
//!   files and receives the output files.
//!
//! * `chunks` (optional) -- Mapping from dimension name to chunk size. A
//!   dimension that is not listed is processed in one piece. Smaller chunks
//!   bound the working set at the cost of more reads.
//!
//! * `history` (optional, default: `true`) -- Whether output variables carry
//!   a `history` attribute recording what they were computed from.
//!
//! * `log_file` (optional, default: `conform.log`) -- Where the run log is
//!   written.
//!
//! # Examples
//!
//! ```yml
//! specification: cmip.json
//! inputs:
//!   - monthly_0001.arr
//!   - monthly_0002.arr
//! chunks:
//!   time: 12
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use yaml_rust::{ScanError, YamlLoader};

pub const DEFAULT_CONFIG_FILE: &'static str = ".conform.yml";
pub const DEFAULT_LOG_FILE: &'static str = "conform.log";

/// Configuration structure.
#[derive(Debug)]
pub struct Config {
    /// Path to the target specification.
    pub specification: PathBuf,
    /// Input file names.
    pub inputs: Vec<String>,
    /// Directory holding inputs and receiving outputs.
    pub data_dir: PathBuf,
    /// Per-dimension chunk sizes.
    pub chunks: BTreeMap<String, usize>,
    /// Whether to write `history` attributes.
    pub history: bool,
    /// Path of the run log.
    pub log_file: PathBuf,
}

#[derive(Debug)]
pub enum LoadConfigError {
    Io(io::Error),
    Yaml(ScanError),
    Invalid(String),
    UnknownOption(String),
    NotFound,
}

impl fmt::Display for LoadConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadConfigError::Io(error) => write!(f, "{}", error),
            LoadConfigError::Yaml(error) => write!(f, "invalid configuration syntax: {}", error),
            LoadConfigError::Invalid(error) => {
                write!(f, "invalid configuration format: {}", error)
            }
            LoadConfigError::UnknownOption(error) => {
                write!(f, "unknown configuration option: {}", error)
            }
            LoadConfigError::NotFound => write!(f, "configuration not found"),
        }
    }
}

fn invalid<T, S: Into<String>>(message: S) -> Result<T, LoadConfigError> {
    Err(LoadConfigError::Invalid(message.into()))
}

impl Config {
    /// Loads the configuration from given file. If optional items are not
    /// specified, default values are used.
    pub fn load_from_file<P: AsRef<Path>>(filepath: P) -> Result<Self, LoadConfigError> {
        let mut file = File::open(&filepath).map_err(LoadConfigError::Io)?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(LoadConfigError::Io)?;

        let parent = filepath
            .as_ref()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::parse(&content, &parent)
    }

    fn parse(content: &str, parent: &Path) -> Result<Self, LoadConfigError> {
        let yaml = YamlLoader::load_from_str(content).map_err(LoadConfigError::Yaml)?;

        let config = yaml
            .get(0)
            .ok_or_else(|| LoadConfigError::Invalid(String::from("empty file")))
            .and_then(|item| {
                item.as_hash()
                    .ok_or_else(|| LoadConfigError::Invalid(String::from("not a mapping")))
            })?;

        let mut specification = None;
        let mut inputs = Vec::new();
        let mut data_dir = parent.to_path_buf();
        let mut chunks = BTreeMap::new();
        let mut history = true;
        let mut log_file = parent.join(DEFAULT_LOG_FILE);

        for (key, value) in config {
            match key
                .as_str()
                .ok_or_else(|| LoadConfigError::Invalid(String::from("non-string option")))?
            {
                "specification" => {
                    let path = value.as_str().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"specification\" must be a path"))
                    })?;
                    specification = Some(parent.join(path));
                }
                "inputs" => {
                    for input in value.as_vec().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"inputs\" must be a list"))
                    })? {
                        inputs.push(
                            input
                                .as_str()
                                .ok_or_else(|| {
                                    LoadConfigError::Invalid(String::from(
                                        "input entries must be file names",
                                    ))
                                })?
                                .to_owned(),
                        );
                    }
                }
                "data_dir" => {
                    data_dir = parent.join(value.as_str().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"data_dir\" must be a path"))
                    })?);
                }
                "chunks" => {
                    let entries = value.as_hash().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"chunks\" must be a mapping"))
                    })?;
                    for (dim, size) in entries {
                        let dim = match dim.as_str() {
                            Some(dim) => dim.to_owned(),
                            None => return invalid("chunk keys must be dimension names"),
                        };
                        let size = match size.as_i64() {
                            Some(size) if size > 0 => size as usize,
                            _ => return invalid("chunk sizes must be positive integers"),
                        };
                        chunks.insert(dim, size);
                    }
                }
                "history" => {
                    history = value.as_bool().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"history\" must be a boolean"))
                    })?;
                }
                "log_file" => {
                    log_file = parent.join(value.as_str().ok_or_else(|| {
                        LoadConfigError::Invalid(String::from("\"log_file\" must be a path"))
                    })?);
                }
                option => return Err(LoadConfigError::UnknownOption(option.to_owned())),
            }
        }

        let specification = match specification {
            Some(specification) => specification,
            None => return invalid("\"specification\" is required"),
        };
        if inputs.is_empty() {
            return invalid("\"inputs\" is required and must not be empty");
        }

        Ok(Config {
            specification,
            inputs,
            data_dir,
            chunks,
            history,
            log_file,
        })
    }

    /// Looks for [`DEFAULT_CONFIG_FILE`] in the given directory and its
    /// ancestors.
    ///
    /// [`DEFAULT_CONFIG_FILE`]: constant.DEFAULT_CONFIG_FILE.html
    pub fn find_and_load<P: AsRef<Path>>(start: P) -> Result<(Self, PathBuf), LoadConfigError> {
        let mut current = Some(start.as_ref());

        while let Some(dir) = current {
            let candidate = dir.join(DEFAULT_CONFIG_FILE);
            if candidate.is_file() {
                return Self::load_from_file(&candidate).map(|config| (config, candidate));
            }
            current = dir.parent();
        }

        Err(LoadConfigError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_config() {
        let content = r#"
specification: spec.json
inputs:
  - a.arr
  - b.arr
chunks:
  time: 12
history: false
"#;
        let config = Config::parse(content, Path::new("work")).unwrap();
        assert_eq!(config.specification, Path::new("work/spec.json"));
        assert_eq!(config.inputs, vec!["a.arr", "b.arr"]);
        assert_eq!(config.chunks.get("time"), Some(&12));
        assert!(!config.history);
        assert_eq!(config.log_file, Path::new("work/conform.log"));
    }

    #[test]
    fn missing_specification_is_invalid() {
        let content = "inputs:\n  - a.arr\n";
        assert!(matches!(
            Config::parse(content, Path::new(".")),
            Err(LoadConfigError::Invalid(_))
        ));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let content = "specification: s.json\ninputs:\n  - a.arr\nbogus: 1\n";
        assert!(matches!(
            Config::parse(content, Path::new(".")),
            Err(LoadConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn non_positive_chunk_is_invalid() {
        let content = "specification: s.json\ninputs:\n  - a.arr\nchunks:\n  t: 0\n";
        assert!(matches!(
            Config::parse(content, Path::new(".")),
            Err(LoadConfigError::Invalid(_))
        ));
    }
}
