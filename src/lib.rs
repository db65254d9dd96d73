//! # cache-conn-manager
//!
//! A resilient manager for the single, process-wide connection to an
//! external key-value cache or session store.
//!
//! ## Features
//!
//! - **Single shared handle**: `initialize` is idempotent and every caller
//!   reads the same [`SharedHandle`]
//! - **Auto-reconnection** with capped linear backoff, one attempt in flight at a time
//! - **Configuration failures** surface from `initialize` instead of being retried forever
//! - **Observers** notified synchronously, in order, with isolated failures
//! - **Cancellable shutdown** from any state
//! - **Metrics** for observability
//!
//! The manager is protocol-agnostic: it wraps a [`Transport`] and governs
//! only the connection lifecycle, never the cache's commands.
//!
//! ## Example
//!
//! ```ignore
//! use cache_conn_manager::{ConnectionManager, ManagerConfig, TcpTransport};
//!
//! let manager = ConnectionManager::new(TcpTransport::new());
//! manager.on_state_change(|change| {
//!     tracing::info!("cache {} -> {}", change.previous, change.current);
//! });
//!
//! let handle = manager.initialize(ManagerConfig::from_env()?).await?;
//! if let Some(conn) = handle.connection() {
//!     // talk to the cache
//! }
//!
//! manager.shutdown().await;
//! ```

mod config;
mod connection;
mod error;
mod handle;
mod manager;
mod metrics;
#[cfg(test)]
mod mock;
mod observer;
mod transport;

pub use config::{
    BackoffPolicy, ConfigError, CustomBackoff, Endpoint, ManagerConfig, ManagerConfigBuilder,
    DEFAULT_ENV_PREFIX, DEFAULT_HOST, DEFAULT_PORT,
};
pub use error::{Error, ErrorKind, TransportError, TransportErrorKind};
pub use handle::{ConnectionState, SharedHandle};
pub use manager::{ConnectionHandle, ConnectionManager};
pub use metrics::{Metrics, MetricsSnapshot};
pub use observer::{
    BoxError, Callback, ConnectionObserver, FnObserver, ObserverError, ObserverResult, StateChange,
};
pub use transport::{TcpConnection, TcpTransport, Transport, TransportEvent, TransportEvents};

/// Result type for cache-conn-manager operations
pub type Result<T> = std::result::Result<T, Error>;
