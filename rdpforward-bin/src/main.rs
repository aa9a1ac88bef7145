use clap::Parser;
use rdpforward_bin::cli::{self, Args};
use rdpforward_bin::service;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let config = cli::build_config(&args)?;

    // Service commands run before target validation so `--service stop`
    // works without a configured upstream.
    if let Some(command) = args.service {
        service::handle_command(command, &config)?;
        return Ok(());
    }

    config.validate()?;

    // When the service controller launched us, the dispatcher serves until
    // the controller stops the service.
    if service::run_dispatcher(config.clone())? {
        return Ok(());
    }

    rdpforward_bin::run(config)
}
