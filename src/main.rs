use std::process::ExitCode;

use clap::Parser;
use site_mirror::app::config::MirrorArgs;
use site_mirror::app::logging::init_logging;
use site_mirror::app::runtime::run_mirror;

#[tokio::main]
async fn main() -> ExitCode {
    let args = MirrorArgs::parse();
    if let Err(err) = init_logging(&args.logging.log_level) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run_mirror(args).await {
        Ok(report) => {
            tracing::info!(crawled = report.crawled, uploaded = report.uploaded, "mirror complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = format!("{err:#}"), "mirror failed");
            ExitCode::FAILURE
        }
    }
}
