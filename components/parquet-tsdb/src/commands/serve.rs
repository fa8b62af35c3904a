// Local crates
use crate::{
    helpers::shutdown::LifecycleContext,
    metrics::MetricsRegistry,
    runtime::ServeHandler,
    search::{SearchSubsystem, serve_http},
};

// External crates
use anyhow::{Context, Result};
use clap::Args;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{Instrument, Span};

/// Default listen address of the HTTP endpoints.
pub const DEFAULT_HTTP_ADDRESS: &str = "0.0.0.0:9000";

/// Options of the `serve` command.
#[derive(Debug, Clone, PartialEq, Args)]
pub struct ServeArgs {
    /// Address to expose HTTP endpoints on
    #[arg(long = "http.address", value_name = "ADDR", default_value = DEFAULT_HTTP_ADDRESS)]
    pub http_address: SocketAddr,
}

/// Serves the metrics registry over HTTP until shutdown.
#[derive(Debug, Clone)]
pub struct Server {
    search: Arc<SearchSubsystem>,
}

impl Server {
    /// Server recording requests into the metrics of `search`.
    pub fn new(search: Arc<SearchSubsystem>) -> Self {
        Self { search }
    }
}

impl ServeHandler for Server {
    async fn serve(
        &self,
        ctx: LifecycleContext,
        span: Span,
        args: ServeArgs,
        registry: MetricsRegistry,
    ) -> Result<()> {
        async {
            let listener = TcpListener::bind(args.http_address)
                .await
                .with_context(|| format!("Failed to bind HTTP listener on {}", args.http_address))?;

            serve_http(listener, registry, self.search.metrics().cloned(), ctx).await;
            Ok(())
        }
        .instrument(span)
        .await
    }
}
