//! Tracing (logging)

use crate::cli::CommandLineArgs;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "thermocline=debug,tower_http=debug".into())
}

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to enable debug
/// logging for this crate and tower_http if not set. With `--enable-jaeger`, spans are also
/// exported to a Jaeger agent.
pub fn init_tracing(args: &CommandLineArgs) {
    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer());
    if !args.enable_jaeger {
        registry.init();
        return;
    }
    match opentelemetry_jaeger::new_agent_pipeline()
        .with_service_name("thermocline")
        .install_batch(opentelemetry::runtime::Tokio)
    {
        Ok(tracer) => {
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        Err(err) => {
            registry.init();
            tracing::error!("Failed to initialise Jaeger exporter: {}", err);
        }
    }
}

/// Flush and stop span export.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
