pub mod cli;
pub mod logging;
pub mod service;

use rdpforward_config::Config;
use std::error::Error;
use tokio::sync::broadcast;

/// Runs the forwarder as a console program until Ctrl+C.
pub fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    logging::init(&config);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        rdpforward_core::run_forwarder(config, shutdown_rx).await
    })?;
    Ok(())
}
