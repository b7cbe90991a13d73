//! User interfaces for run progress and diagnostics.

mod cli;
mod json;

use crate::flow::ValidationWarning;

pub use cli::CliUi;
pub use json::JsonUi;

/// The trait implemented by all UIs.
pub trait Ui {
    /// Prepares for the run presentation.
    fn prolog(&mut self, _n_inputs: usize, _n_files: usize) {}
    /// Indicates that production of given output file begins.
    fn file_started(&mut self, name: &str);
    /// Reports a completed output file.
    fn file_written(&mut self, name: &str, n_variables: usize);
    /// Reports a validation warning raised while producing the current file.
    fn warning(&mut self, warning: &ValidationWarning);
    /// Finishes the run presentation.
    fn epilog(&mut self) {}
    /// Displays the error the run was aborted with.
    fn error(&mut self, error: &str);
}

/// Enumeration of available UIs.
#[derive(Clone, Copy)]
pub enum UiName {
    /// Command line interface UI.
    Cli,
    /// JSON output that can be consumed by an external tool.
    Json,
}

impl UiName {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "cli" => Some(UiName::Cli),
            "json" => Some(UiName::Json),
            _ => None,
        }
    }
}

impl Default for UiName {
    fn default() -> Self {
        UiName::Cli
    }
}
