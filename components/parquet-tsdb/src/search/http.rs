// Local crates
use crate::{helpers::shutdown::LifecycleContext, metrics::MetricsRegistry, search::search::SearchMetrics};

// External crates
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::{CONTENT_TYPE, HeaderValue},
    http::{Method, Request, Response, StatusCode},
    service::service_fn,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as HyperServerBuilder,
};
use std::{convert::Infallible, io, time::{Duration, Instant}};
use tokio::net::TcpListener;
use tracing::{instrument, instrument::WithSubscriber};

/// Everything a request handler needs, shared by all connections.
#[derive(Clone)]
struct HttpState {
    registry: MetricsRegistry,
    metrics: Option<SearchMetrics>,
}

fn text_response(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body)));
    *response.status_mut() = status;
    response
}

#[instrument(
    name = "search::http::metrics_handler",
    target = "search::http",
    skip_all,
    level = "debug"
)]
fn metrics_handler(registry: &MetricsRegistry) -> Response<Full<Bytes>> {
    tracing::debug!("Collecting all registered prometheus metrics");

    let mut buffer = Vec::new();
    if let Err(err) = registry.encode(&mut buffer) {
        tracing::error!(error = %err, "Failed to encode metrics");
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, b"Failed to encode metrics");
    }
    tracing::debug!(
        writer_buffer = %buffer.len(),
        "Encoded collected metrics into prometheus text format"
    );

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

fn route(state: &HttpState, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let path = req.uri().path();

    let response = match (req.method(), path) {
        (&Method::GET, "/metrics") => metrics_handler(&state.registry),
        _ => text_response(StatusCode::NOT_FOUND, b"Not Found"),
    };

    if let Some(metrics) = &state.metrics {
        // Unknown paths are folded together to keep label cardinality bounded.
        let label = if response.status() == StatusCode::NOT_FOUND {
            "other"
        } else {
            path
        };
        metrics.observe(label, response.status().as_u16(), started.elapsed());
    }
    response
}

/// Pause after a failed accept that is not specific to one connection.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that only concern the connection being accepted.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Waits [`ACCEPT_BACKOFF`] so that resource exhaustion (e.g. EMFILE) does not
/// spin the accept loop. Returns `false` if `ctx` was cancelled meanwhile.
async fn accept_backoff(ctx: &LifecycleContext) -> bool {
    tokio::select! {
        _ = ctx.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Serves `GET /metrics` on `listener` until `ctx` is cancelled.
///
/// Connections already accepted are left to finish on their own tasks.
#[instrument(
    name = "search::http::serve_http",
    target = "search::http",
    skip_all,
    level = "debug"
)]
pub async fn serve_http(
    listener: TcpListener,
    registry: MetricsRegistry,
    metrics: Option<SearchMetrics>,
    ctx: LifecycleContext,
) {
    let state = HttpState { registry, metrics };

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(
            metrics_endpoint = %addr,
            "Metrics available at http://{addr}/metrics"
        );
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.cancelled() => {
                tracing::info!("HTTP server received shutdown request");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_connection_error(&err) => {
                    tracing::debug!(error = %err, "Connection dropped before accept");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to accept connection, backing off");
                    if accept_backoff(&ctx).await {
                        continue;
                    }
                    tracing::info!("HTTP server received shutdown request");
                    break;
                }
            },
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let response = route(&state, &req);
            async move { Ok::<_, Infallible>(response) }
        });

        tracing::trace!(peer = %peer, "Spawning task for HTTP connection");
        let connection = async move {
            if let Err(err) = HyperServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::error!(error = %err, peer = %peer, "HTTP connection error");
            }
        };
        tokio::spawn(connection.with_current_subscriber());
    }
}
