use crate::query::{QueryProtocol, SessionSettings};
use crate::registry::ProcessTable;
use crate::session::{Replies, Session, SessionOutcome};
use metrics_exporter_prometheus::PrometheusBuilder;
use pgsession_core::{Charset, DataBackend, SessionError};
use pgsession_protocol::{FramedReader, RawReader};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Per-connection limits and settings shared by all sessions.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// 0 means unlimited.
    pub max_connections: usize,
    pub idle_timeout: Option<Duration>,
    pub charset: Charset,
    pub session: Arc<SessionSettings>,
}

/// Accepts connections and runs one session task per connection.
pub struct Server<F> {
    listener: TcpListener,
    options: ServerOptions,
    processes: Arc<ProcessTable>,
    make_backend: Arc<F>,
}

impl<F, B> Server<F>
where
    F: Fn() -> B + Send + Sync + 'static,
    B: DataBackend,
{
    pub async fn bind(addr: &str, options: ServerOptions, make_backend: F) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            options,
            processes: Arc::new(ProcessTable::new()),
            make_backend: Arc::new(make_backend),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn processes(&self) -> Arc<ProcessTable> {
        self.processes.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("pgsession listening on {}", self.local_addr()?);
        loop {
            let (socket, peer) = self.listener.accept().await?;
            if let Err(err) = socket.set_nodelay(true) {
                warn!(%peer, "set_nodelay failed: {err}");
            }
            let processes = self.processes.clone();
            let options = self.options.clone();
            let backend = (self.make_backend)();
            tokio::spawn(async move {
                handle_connection(socket, peer.to_string(), processes, options, backend).await;
            });
        }
    }
}

/// Runs one connection to completion and logs how it ended.
///
/// The connection limit is applied once the startup packet has been read, so
/// cancel requests still get through to a full server.
pub async fn handle_connection<S, B>(
    stream: S,
    peer: String,
    processes: Arc<ProcessTable>,
    options: ServerOptions,
    backend: B,
) -> Option<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: DataBackend,
{
    let (read_half, write_half) = tokio::io::split(stream);
    debug!(%peer, "connection accepted");

    let raw = RawReader::new(read_half)
        .with_idle_timeout(options.idle_timeout)
        .with_charset(options.charset);
    let replies = Replies::new(Box::new(write_half)).with_write_timeout(options.idle_timeout);
    let handler = QueryProtocol::new(backend, processes.clone(), options.session.clone());
    let session = Session::new(
        FramedReader::new(raw),
        replies,
        handler,
        processes,
        options.max_connections,
    );

    match session.run().await {
        Ok(outcome) => {
            info!(%peer, ?outcome, "session ended");
            Some(outcome)
        }
        Err(SessionError::Rejected(reason)) => {
            warn!(%peer, "connection rejected: {reason}");
            None
        }
        Err(err) => {
            error!(%peer, "session failed: {err}");
            None
        }
    }
}

/// Serves the Prometheus scrape endpoint plus a liveness probe.
pub async fn serve_metrics(addr: &str) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", listener.local_addr()?);
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || std::future::ready(handle.render())),
        )
        .route("/health", axum::routing::get(|| async { "ok" }));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("metrics endpoint failed: {err}");
        }
    });
    Ok(())
}
