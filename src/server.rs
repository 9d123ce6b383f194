use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error;
use crate::metrics::Metrics;
use crate::session::{self, SessionPool};
use crate::upstream::Upstream;
use crate::Error;

const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Accepts clients on `listener` and proxies them to the configured backend until `shutdown`
/// resolves or the backend link gives up.
pub async fn run(
    listener: TcpListener,
    config: Config,
    shutdown: impl Future,
) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    if config.cluster_mode {
        error!("Cluster mode is not supported");
        return Err(error::Error::NotImplemented.into());
    }

    let metrics = Arc::new(Metrics::new());
    let upstream = Arc::new(Upstream::new(config.clone(), metrics.clone()));
    let pool = Arc::new(SessionPool::new(config.session_pool_size, metrics.clone()));
    let config = Arc::new(config);
    let token = CancellationToken::new();

    let mut link = tokio::spawn(upstream.clone().run(token.clone()));

    info!(
        "Proxy listening on {}, forwarding to {}",
        listener.local_addr()?,
        config.upstream_address()
    );

    let mut report = tokio::time::interval(METRICS_INTERVAL);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, client_address) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                connections.spawn(handle_connection(
                    socket,
                    client_address,
                    pool.clone(),
                    upstream.clone(),
                    config.clone(),
                    token.clone(),
                ));
            }
            Some(joined) = connections.join_next() => connection_ended(joined),
            _ = report.tick() => {
                debug!(metrics = %metrics.snapshot(), "Proxy metrics");
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break Ok(());
            }
            joined = &mut link => {
                break match joined {
                    Ok(result) => result,
                    Err(e) => Err(e.into()),
                };
            }
        }
    };

    // Connections stop on the token and give their session slots back.
    token.cancel();
    while let Some(joined) = connections.join_next().await {
        connection_ended(joined);
    }
    info!(metrics = %metrics.snapshot(), "Proxy stopped");

    result
}

#[instrument(
    name = "session",
    skip(stream, pool, upstream, config, shutdown),
    fields(session_id)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    pool: Arc<SessionPool>,
    upstream: Arc<Upstream>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    info!("Accepted connection");
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let (reader, writer) = stream.into_split();
    let result = session::serve_client(reader, writer, &pool, &upstream, &config, &shutdown).await;

    info!("Connection closed");
    result
}

fn connection_ended(joined: Result<Result<(), Error>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Connection ended with error: {}", e),
        Err(e) => error!("Connection task failed: {}", e),
    }
}
