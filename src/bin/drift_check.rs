use std::process::ExitCode;

use clap::Parser;
use site_mirror::app::config::DriftCheckArgs;
use site_mirror::app::logging::init_logging;
use site_mirror::app::runtime::run_drift_check;

#[tokio::main]
async fn main() -> ExitCode {
    let args = DriftCheckArgs::parse();
    if let Err(err) = init_logging(&args.logging.log_level) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run_drift_check(args).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "drift check failed");
            ExitCode::FAILURE
        }
    }
}
