use std::process::ExitCode;

use clap::Parser;
use site_mirror::app::config::StatusCheckArgs;
use site_mirror::app::logging::init_logging;
use site_mirror::app::runtime::run_status_check;

#[tokio::main]
async fn main() -> ExitCode {
    let args = StatusCheckArgs::parse();
    if let Err(err) = init_logging(&args.logging.log_level) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = run_status_check(args).await {
        tracing::error!(error = format!("{err:#}"), "status exporter failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
