//! Functions custom handler HTTP server

use std::{
    net::{Ipv4Addr, SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{extract::Request, routing::post, Router};
use axum_server::Handle;
use clap::Parser;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, info_span};

use crate::domain::dispatch::{BlobReader, DispatchPipeline, EmailDispatcher};

pub mod errors;
pub mod handlers;

/// Configuration for the custom handler server.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
pub struct FunctionsServerConfig {
    /// The port the Functions host forwards invocations to
    #[arg(short, long, env = "FUNCTIONS_CUSTOMHANDLER_PORT", default_value = "3000")]
    pub port: u16,
}

/// The server the Functions host invokes once per trigger event
#[derive(Debug)]
pub struct FunctionsServer {
    router: Router,
    listener: TcpListener,
}

impl FunctionsServer {
    /// Returns a new server bound to the loopback port specified in `config`.
    pub fn new<D, B>(pipeline: DispatchPipeline<D, B>, config: &FunctionsServerConfig) -> Result<Self>
    where
        D: EmailDispatcher,
        B: BlobReader,
    {
        let router = router(Arc::new(pipeline));

        let address = SocketAddr::from((Ipv4Addr::LOCALHOST, config.port));
        let listener = TcpListener::bind(address)
            .with_context(|| format!("failed to listen on {}", config.port))?;
        listener
            .set_nonblocking(true)
            .context("failed to set the listener to non-blocking")?;

        Ok(Self { router, listener })
    }

    /// Runs the server until a shutdown signal arrives.
    #[mutants::skip]
    pub async fn run(self) -> Result<()> {
        info!(
            "Custom handler listening on {}",
            self.listener
                .local_addr()
                .context("failed to get local address")?
        );

        let handle = Handle::new();

        let server = axum_server::from_tcp(self.listener)
            .handle(handle.clone())
            .serve(self.router.into_make_service());

        tokio::select! {
            result = server => result.context("server error")?,
            _ = shutdown_signal(Some(handle)) => {
                info!("Shutting down custom handler");
            }
        }

        Ok(())
    }
}

/// Create the router, one route per function
pub fn router<D, B>(pipeline: Arc<DispatchPipeline<D, B>>) -> Router
where
    D: EmailDispatcher,
    B: BlobReader,
{
    let trace_layer = TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
        let uri = request.uri().to_string();
        info_span!("invocation", method = ?request.method(), uri)
    });

    Router::new()
        .route("/queue_email_sender", post(handlers::queue_trigger::<D, B>))
        .route("/blob_email_sender", post(handlers::blob_trigger::<D, B>))
        .layer(CatchPanicLayer::custom(handlers::panic_handler))
        .layer(trace_layer)
        .with_state(pipeline)
}

#[mutants::skip]
async fn shutdown_signal(handle: Option<Handle>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    if let Some(handle) = handle {
        debug!("shutting down gracefully");
        handle.graceful_shutdown(Some(Duration::from_secs(10)));
    }
}
