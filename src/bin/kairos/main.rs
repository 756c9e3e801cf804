use clap::Parser;
use miette::Result;

mod common;
mod daemon;
mod sensor;
mod supervisor;
mod validator;

#[derive(Parser)]
#[clap(name = "Kairos")]
#[clap(bin_name = "kairos")]
#[clap(author, version, about, long_about = None)]
enum Kairos {
    /// Run sensor, supervisor, and validator in one process.
    Daemon(daemon::Args),
    /// Monitor the observatory and order execution of analyzer modules.
    Sensor(sensor::Args),
    /// Manage execution of analyzer modules.
    Supervisor(supervisor::Args),
    /// Assign upload action ids and commit executed analyzers.
    Validator(validator::Args),
}

fn main() -> Result<()> {
    let args = Kairos::parse();

    match args {
        Kairos::Daemon(x) => daemon::run(&x)?,
        Kairos::Sensor(x) => sensor::run(&x)?,
        Kairos::Supervisor(x) => supervisor::run(&x)?,
        Kairos::Validator(x) => validator::run(&x)?,
    };

    Ok(())
}
