//! This file defines the thermocline binary entry point.

use std::process::ExitCode;
use std::sync::Arc;

use thermocline::app;
use thermocline::cli;
use thermocline::config::Settings;
use thermocline::error::IngestError;
use thermocline::metrics;
use thermocline::pipeline::Pipeline;
use thermocline::server;
use thermocline::tracing;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing(&args);
    metrics::register_metrics();
    let result = run(&args).await;
    tracing::shutdown_tracing();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("thermocline: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &cli::CommandLineArgs) -> Result<(), IngestError> {
    let settings = Settings::from_args(args)?;
    ::tracing::debug!("{:?}", settings);
    let pipeline = Arc::new(Pipeline::open(settings).await?);
    pipeline.start()?;
    let served = server::serve(args, app::service(pipeline.clone())).await;
    pipeline.shutdown().await?;
    served
}
