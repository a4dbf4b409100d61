//! Web server

use crate::cli;
use crate::error::IngestError;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use axum::ServiceExt;
use axum_server::{tls_rustls::RustlsConfig, Handle};
use expanduser::expanduser;
use tokio::signal;

/// Serve the ingestion API until a shutdown signal is received
///
/// # Arguments
///
/// * `args`: Command line arguments
/// * `service`: The [crate::app::Service] to serve
pub async fn serve(
    args: &cli::CommandLineArgs,
    service: crate::app::Service,
) -> Result<(), IngestError> {
    let addr = SocketAddr::from_str(&format!("{}:{}", args.host, args.port)).map_err(|err| {
        IngestError::InvalidSettings(format!("invalid host name, IP address or port number: {err}"))
    })?;

    // Catch ctrl+c and try to shutdown gracefully
    let handle = Handle::new();
    tokio::spawn(shutdown_signal(
        handle.clone(),
        args.graceful_shutdown_timeout,
    ));

    if args.https {
        let cert_file = tls_file(&args.cert_file, "certificate")?;
        let key_file = tls_file(&args.key_file, "key")?;
        // Set up TLS config
        let tls_config = RustlsConfig::from_pem_file(cert_file, key_file)
            .await
            .map_err(|err| {
                IngestError::InvalidSettings(format!("failed to load TLS certificate files: {err}"))
            })?;
        tracing::info!("Listening on https://{}", addr);
        // run HTTPS server with hyper
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service.into_make_service())
            .await
            .map_err(IngestError::Server)
    } else {
        tracing::info!("Listening on http://{}", addr);
        // run HTTP server with hyper
        axum_server::bind(addr)
            .handle(handle)
            .serve(service.into_make_service())
            .await
            .map_err(IngestError::Server)
    }
}

/// Expand and check the path of a TLS file
fn tls_file(path: &str, kind: &str) -> Result<PathBuf, IngestError> {
    let path = expanduser(path)
        .map_err(|err| {
            IngestError::InvalidSettings(format!(
                "failed to expand ~ in TLS {kind} file path, please provide an absolute path: {err}"
            ))
        })?;
    if !path.exists() {
        return Err(IngestError::InvalidSettings(format!(
            "TLS {kind} file expected at '{}' but not found",
            path.display()
        )));
    }
    path.canonicalize().map_err(|err| {
        IngestError::InvalidSettings(format!(
            "failed to determine absolute path to TLS {kind} file: {err}"
        ))
    })
}

/// Graceful shutdown handler
///
/// Installs signal handlers to catch Ctrl-C or SIGTERM and trigger a graceful shutdown.
async fn shutdown_signal(handle: Handle, timeout: u64) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Signal received, starting graceful shutdown");
    // Force shutdown if graceful shutdown takes longer than the timeout
    handle.graceful_shutdown(Some(Duration::from_secs(timeout)));
}
