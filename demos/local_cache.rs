//! Example: keeping one shared connection to a local cache server
//!
//! Start a Redis-compatible server (or anything listening on TCP), then:
//!
//! Run with: CACHE_PORT=6379 cargo run --example local_cache
//!
//! Stop and restart the server while this runs to watch the manager
//! back off and reconnect.

use cache_conn_manager::{
    ConnectionManager, ConnectionObserver, Error, ManagerConfig, ObserverResult, StateChange,
    TcpTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Logs lifecycle events the way a dashboard exporter would record them
struct LifecycleLog;

impl ConnectionObserver for LifecycleLog {
    fn on_connected(&self, change: &StateChange) -> ObserverResult {
        info!("Cache at {} is up", change.endpoint);
        Ok(())
    }

    fn on_error(&self, cause: &Error, change: &StateChange) -> ObserverResult {
        warn!("Cache at {} failed: {}", change.endpoint, cause);
        Ok(())
    }

    fn on_reconnecting(&self, change: &StateChange) -> ObserverResult {
        info!(
            "Retrying {} in {:?} (attempt {})",
            change.endpoint,
            change.delay.unwrap_or_default(),
            change.attempt
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let config = ManagerConfig::from_env()?;
    info!("Connecting to {}", config.endpoint);

    let manager = Arc::new(ConnectionManager::new(TcpTransport::new()));
    manager.add_observer(Arc::new(LifecycleLog));

    let handle = manager.initialize(config).await?;

    // Ping the server every second; a failed exchange hands the socket back
    let pinger = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;

                let Some(conn) = handle.connection() else {
                    info!("Cache unavailable ({}), skipping ping", handle.state());
                    continue;
                };

                let mut stream = conn.stream().await;
                let result: std::io::Result<usize> = async {
                    stream.write_all(b"PING\r\n").await?;
                    match stream.read(&mut buf).await? {
                        0 => Err(std::io::ErrorKind::UnexpectedEof.into()),
                        n => Ok(n),
                    }
                }
                .await;
                drop(stream);

                match result {
                    Ok(n) => info!("Reply: {}", String::from_utf8_lossy(&buf[..n]).trim_end()),
                    Err(e) => conn.report_failure(e),
                }
            }
        })
    };

    info!("Running... Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    pinger.abort();
    manager.shutdown().await;

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnect attempts: {}", snapshot.reconnect_attempts_total);
    info!("  Transport errors: {}", snapshot.transport_errors_total);
    info!("  Uptime: {:?}", snapshot.total_uptime);

    Ok(())
}
