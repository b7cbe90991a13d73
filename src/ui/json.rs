//! JSON output for external tools.

use std::io::{self, Stdout, Write};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use super::Ui;
use crate::flow::ValidationWarning;

#[derive(Serialize, Deserialize)]
struct Output {
    version: String,
    utc_time: DateTime<Utc>,
    local_time: DateTime<Local>,
    inputs_count: usize,
    files: Vec<FileReport>,
}

#[derive(Serialize, Deserialize)]
struct ErrorOutput {
    version: String,
    utc_time: DateTime<Utc>,
    local_time: DateTime<Local>,
    error: String,
}

#[derive(Serialize, Deserialize)]
struct FileReport {
    name: String,
    variables_count: usize,
    warnings: Vec<WarningReport>,
}

#[derive(Serialize, Deserialize)]
struct WarningReport {
    variable: String,
    check: String,
    message: String,
}

pub struct JsonUi {
    terminal: Stdout,
    output: Output,
}

impl JsonUi {
    pub fn new() -> Self {
        JsonUi {
            terminal: io::stdout(),
            output: Output {
                version: String::from("v1"),
                utc_time: Utc::now(),
                local_time: Local::now(),
                inputs_count: 0,
                files: Vec::new(),
            },
        }
    }
}

impl Ui for JsonUi {
    fn prolog(&mut self, n_inputs: usize, _n_files: usize) {
        self.output.inputs_count = n_inputs;
    }

    fn file_started(&mut self, name: &str) {
        self.output.files.push(FileReport {
            name: name.to_owned(),
            variables_count: 0,
            warnings: Vec::new(),
        });
    }

    fn file_written(&mut self, _name: &str, n_variables: usize) {
        if let Some(report) = self.output.files.last_mut() {
            report.variables_count = n_variables;
        }
    }

    fn warning(&mut self, warning: &ValidationWarning) {
        if let Some(report) = self.output.files.last_mut() {
            report.warnings.push(WarningReport {
                variable: warning.variable.clone(),
                check: warning.check.clone(),
                message: warning.message.clone(),
            });
        }
    }

    fn epilog(&mut self) {
        write!(
            self.terminal,
            "{}",
            serde_json::to_string(&self.output).unwrap()
        )
        .unwrap();
    }

    fn error(&mut self, error: &str) {
        let error_output = ErrorOutput {
            version: self.output.version.clone(),
            utc_time: self.output.utc_time,
            local_time: self.output.local_time,
            error: error.to_owned(),
        };

        write!(
            self.terminal,
            "{}",
            serde_json::to_string(&error_output).unwrap()
        )
        .unwrap();
    }
}
