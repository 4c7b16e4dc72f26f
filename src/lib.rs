use std::env;
use crate::app::{run_application, Args};
use crate::error::AppRunError;

pub mod app;
pub mod device;
pub mod error;
pub mod config;

pub fn init_logging(verbose: bool) -> Result<(), AppRunError> {
    let level = if verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Warn)
        .level_for("gcs_compass", level)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).map_err(|source| AppRunError::LogFile { source })?
        );
    }

    dispatch.apply()?;
    Ok(())
}

pub async fn run(args: Args) -> Result<(), AppRunError> {
    run_application(args).await
}
