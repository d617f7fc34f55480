use std::env::consts::{ARCH, FAMILY, OS};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::trace;

use dataset_wrangler::config::ConfigManager;
use dataset_wrangler::logger::init_logger;

use crate::program::Program;

mod program;
mod progress;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = ConfigManager::default_path();
    let config_manager = ConfigManager::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let config = config_manager.get_app_config();

    // Held until exit so buffered log lines are flushed
    let _log_guard = init_logger(&config.logging, Path::new(&config.paths.log_directory))
        .context("Failed to initialize logging")?;
    log_system_information();

    let program = Program::new(config_manager)?;
    program.run().await
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    trace!("CPUS:           \"{}\"", num_cpus::get());
}
