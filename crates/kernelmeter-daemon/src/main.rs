//! Launcher for the two measurement daemon processes.
//!
//! Each daemon is an independent, single-purpose HTTP server: this binary
//! just wires up logging, loads the shared TOML config, and dispatches to
//! whichever server crate the chosen subcommand names. The rapl daemon and
//! the scope daemon are never run in the same process — see the Process
//! topology note on why that coupling is physical (the pulse wire), not a
//! shared address space.

use clap::{Parser, Subcommand};
use kernelmeter_core::config::Config;
use log::{error, info};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "kernelmeterd")]
#[command(about = "Per-kernel energy and time measurement daemons")]
#[command(version = kernelmeter_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rapl daemon: marker pipe, socket energy counter, timer, pulse GPIO.
    RaplServer {
        /// Path to the TOML config file.
        #[arg(long, default_value = "kernelmeter.toml")]
        config: String,
    },

    /// Run the scope daemon: oscilloscope streaming pipeline, segmented by pulse.
    ScopeServer {
        /// Path to the TOML config file.
        #[arg(long, default_value = "kernelmeter.toml")]
        config: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::RaplServer { config } => run(&config, "rapl", kernelmeter_rapl_server::run_server),
        Commands::ScopeServer { config } => {
            run(&config, "scope", kernelmeter_scope_server::run_server)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

fn run<F, Fut>(config_path: &str, label: &str, run_server: F) -> Result<(), ()>
where
    F: FnOnce(Config) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{label} daemon: failed to load config {config_path:?}: {e}");
            return Err(());
        }
    };

    let runtime = tokio::runtime::Runtime::new().map_err(|e| {
        error!("{label} daemon: failed to start tokio runtime: {e}");
    })?;

    {
        let label = label.to_string();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("{label} daemon: received interrupt, shutting down");
            std::process::exit(0);
        }) {
            error!("{label} daemon: failed to install signal handler: {e}");
        }
    }

    info!("{label} daemon: starting with config {config_path:?}");
    runtime.block_on(run_server(config));
    Ok(())
}
