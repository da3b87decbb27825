//! Prometheus metrics and their HTTP exporter.

use std::net::SocketAddr;
use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Statements executed, labeled `query` or `ddl`.
    pub static ref STATEMENTS_EXECUTED: IntCounterVec = IntCounterVec::new(
        Opts::new("sluice_statements_total", "SQL statements executed"),
        &["kind"]
    )
    .expect("metric can be created");

    /// Result pages streamed to clients.
    pub static ref PAGES_SERVED: IntCounter = IntCounter::new(
        "sluice_pages_served_total",
        "Result pages streamed to clients"
    )
    .expect("metric can be created");

    /// Rows streamed to clients.
    pub static ref ROWS_RETURNED: IntCounter = IntCounter::new(
        "sluice_rows_returned_total",
        "Rows streamed to clients"
    )
    .expect("metric can be created");

    /// Internal errors redacted at the API surface.
    pub static ref INTERNAL_ERRORS: IntCounter = IntCounter::new(
        "sluice_internal_errors_total",
        "Internal errors surfaced to clients as references"
    )
    .expect("metric can be created");
}

static INIT: Once = Once::new();

/// Register the metric statics; idempotent.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(STATEMENTS_EXECUTED.clone()))
            .expect("register statements metric");
        REGISTRY
            .register(Box::new(PAGES_SERVED.clone()))
            .expect("register pages metric");
        REGISTRY
            .register(Box::new(ROWS_RETURNED.clone()))
            .expect("register rows metric");
        REGISTRY
            .register(Box::new(INTERNAL_ERRORS.clone()))
            .expect("register errors metric");
    });
}

/// Serve `/metrics` on `addr`. Returns the bound address and the accept
/// task handle.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    init_metrics();
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut body = Vec::new();
                if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut body) {
                    warn!(error = ?err, "failed to encode metrics");
                    return;
                }
                let body = String::from_utf8_lossy(&body);
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                if let Err(err) = stream.write_all(response.as_bytes()).await {
                    warn!(error = ?err, "failed to write metrics response");
                }
            });
        }
    });
    Ok((bound, handle))
}
