//! Conform run driver.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process;

use crate::catalog::Catalog;
use crate::config::{Config, LoadConfigError};
use crate::executor::Executor;
use crate::flow::{FlowNode, Graph};
use crate::functions::FunctionRegistry;
use crate::io::native::NativeStore;
use crate::logger::Logger;
use crate::reconcile::reconcile;
use crate::spec::Specification;
use crate::ui::{CliUi, JsonUi, Ui, UiName};

/// Command line arguments for the driver.
pub struct DriverArgs<P: AsRef<Path>> {
    config_path: Option<P>,
    ui: UiName,
}

impl<P: AsRef<Path>> DriverArgs<P> {
    /// Creates default arguments.
    pub fn new() -> Self {
        DriverArgs {
            config_path: None,
            ui: UiName::default(),
        }
    }

    /// Sets the configuration filepath.
    pub fn with_config_path(self, config_path: Option<P>) -> Self {
        Self {
            config_path,
            ..self
        }
    }

    /// Sets the UI name.
    pub fn with_ui(self, ui: UiName) -> Self {
        Self { ui, ..self }
    }
}

/// Unwraps a pipeline step, reporting a failure through the UI and ending
/// the process. Every error reaches the user the same way regardless of
/// which stage produced it.
fn check<T, E: fmt::Display>(ui: &mut dyn Ui, result: Result<T, E>) -> T {
    result.unwrap_or_else(|error| {
        ui.error(&error.to_string());
        process::exit(1);
    })
}

/// The main driver of a conform run.
pub struct Driver;

impl Driver {
    /// Runs the whole pipeline: catalog ingestion, graph construction,
    /// reconciliation and execution of every output file.
    pub fn run<P: AsRef<Path>>(args: &DriverArgs<P>) {
        let mut ui: Box<dyn Ui> = match args.ui {
            UiName::Cli => Box::new(CliUi::new().expect("Standard output is inaccessible.")),
            UiName::Json => Box::new(JsonUi::new()),
        };

        let (config, _config_path) = check(ui.as_mut(), Self::load_config(args.config_path.as_ref()));

        let mut logger = check(ui.as_mut(), Logger::create(&config.log_file));
        logger.info("configuration loaded");

        let spec = check(
            ui.as_mut(),
            Specification::load_from_file(&config.specification),
        );
        logger.info(format!(
            "specification declares {} output file(s)",
            spec.files.len()
        ));

        let store = NativeStore::new(&config.data_dir);

        let catalog = check(
            ui.as_mut(),
            logger.stage("ingest input headers", || {
                Catalog::from_store(&store, &config.inputs)
            }),
        );

        let registry = FunctionRegistry::standard();

        let mut graph = check(
            ui.as_mut(),
            logger.stage("build dataflow graph", || {
                Graph::build(&spec, &catalog, &registry, &store)
            }),
        );

        check(
            ui.as_mut(),
            logger.stage("reconcile units and dimensions", || reconcile(&mut graph)),
        );

        ui.prolog(config.inputs.len(), spec.files.len());

        let executor = Executor::new(&graph, config.chunks.clone(), config.history);
        for write_id in graph.write_nodes() {
            let (name, n_variables) = match graph.node(*write_id) {
                FlowNode::Write(write) => (write.file.clone(), write.inputs.len()),
                _ => unreachable!(),
            };

            ui.file_started(&name);

            check(
                ui.as_mut(),
                logger.stage(&format!("write {}", name), || executor.execute(*write_id)),
            );

            for warning in graph.take_warnings() {
                logger.warn(&warning);
                ui.warning(&warning);
            }

            ui.file_written(&name, n_variables);
        }

        ui.epilog();
    }

    fn load_config<P: AsRef<Path>>(
        config_path: Option<P>,
    ) -> Result<(Config, PathBuf), LoadConfigError> {
        match config_path {
            Some(config_path) => Config::load_from_file(&config_path)
                .map(|config| (config, config_path.as_ref().to_path_buf())),
            None => {
                let current_dir = env::current_dir().map_err(LoadConfigError::Io)?;
                Config::find_and_load(&current_dir)
            }
        }
    }
}
