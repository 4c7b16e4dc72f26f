use std::process::ExitCode;
use clap::Parser;
use log::{error, info};
use gcs_compass::{init_logging, run};
use gcs_compass::app::Args;
use gcs_compass::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(args.verbose) {
        eprintln!("{}", err);
        return ExitCode::FAILURE;
    }
    info!(concat!("GCS Compass ", env!("CARGO_PKG_VERSION")));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("This application has already been started");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
    }
}
