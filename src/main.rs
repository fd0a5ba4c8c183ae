mod args;
mod cli;
mod defaults;
mod error;
mod gpu_monitor;
mod launch_config;
mod launcher;
mod logging;
mod paths;
mod scheduler;
mod selector;
mod shell_init;
mod ui;
mod utils;

use cli::{Env, Outcome};
use error::BeakerUtilError;
use gpu_monitor::SshGpuSource;
use paths::ConfigPaths;
use scheduler::BeakerCli;
use std::process::ExitCode;
use utils::ProcessExecutor;

fn run(argv: Vec<String>) -> anyhow::Result<Outcome> {
    let env = Env {
        scheduler: &BeakerCli::new(),
        executor: &ProcessExecutor,
        gpu_source: &SshGpuSource,
        paths: ConfigPaths::from_env()?,
        home: paths::home_dir()?,
        source_file: std::env::var_os(shell_init::SOURCE_FILE_ENV).map(Into::into),
    };
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    cli::run(argv, &env, &mut out)
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    logging::init(logging::verbosity(&argv));

    match run(argv) {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::Source) => ExitCode::from(shell_init::SOURCE_EXIT_CODE),
        Err(e) => {
            if let Some(usage) = e.downcast_ref::<clap::Error>() {
                usage.exit();
            }
            match e.downcast_ref::<BeakerUtilError>() {
                Some(known) => eprintln!("{}", known),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
