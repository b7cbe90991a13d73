pub mod array;
pub mod catalog;
pub mod config;
mod driver;
pub mod executor;
pub mod flow;
pub mod functions;
pub mod index;
pub mod io;
pub mod logger;
pub mod parse;
pub mod reconcile;
pub mod spec;
pub mod ui;
pub mod units;

use clap::{App, Arg};

use driver::{Driver, DriverArgs};
use ui::UiName;

fn main() {
    let matches = App::new("conform")
        .version("0.1")
        .about("Transforms array datasets into the shape a target specification demands")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                // Sets path to the config file. By default it searches for .conform.yml in the current and parent directories.
                .help("")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("ui")
                .long("ui")
                .value_name("NAME")
                .help("Output style, either \"cli\" (default) or \"json\"")
                .takes_value(true),
        )
        .get_matches();

    let ui = matches
        .value_of("ui")
        .and_then(UiName::parse)
        .unwrap_or_default();

    let args = DriverArgs::new()
        .with_config_path(matches.value_of("config"))
        .with_ui(ui);

    Driver::run(&args);
}
