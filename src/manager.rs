use crate::config::ManagerConfig;
use crate::connection::{Driver, ManagerCommand, Shared};
use crate::error::Error;
use crate::handle::{ConnectionState, SharedHandle};
use crate::metrics::Metrics;
use crate::observer::{panic_message, ConnectionObserver, FnObserver, ObserverError, StateChange};
use crate::transport::Transport;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Default command channel buffer size
const DEFAULT_CHANNEL_SIZE: usize = 16;

/// The handle returned by [`ConnectionManager::initialize`]
pub type ConnectionHandle<C> = Arc<SharedHandle<C>>;

/// Manages the single shared connection to the cache service.
///
/// Construct one manager per process and pass it by reference (or in an
/// `Arc`) to every collaborator that needs the cache. The manager owns the
/// [`SharedHandle`]; callers only ever read from it.
///
/// # Thread Safety
///
/// `ConnectionManager` is `Send + Sync`. `initialize`, `reconnect` and
/// `shutdown` are serialized by an internal lifecycle lock; state
/// transitions run on a single driver task.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    shared: Arc<Shared<T::Connection>>,
    /// Serializes initialize/reconnect/shutdown. Held across await points.
    lifecycle: Mutex<Lifecycle>,
    closed: AtomicBool,
}

#[derive(Default)]
struct Lifecycle {
    config: Option<ManagerConfig>,
    command_tx: Option<mpsc::Sender<ManagerCommand>>,
    driver: Option<JoinHandle<()>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a manager around `transport`. Nothing connects until
    /// [`initialize`](Self::initialize).
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            shared: Arc::new(Shared::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    /// Get a reference to the transport
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.handle.state()
    }

    /// Whether `shutdown` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the shared connection handle.
    ///
    /// Never blocks: while reconnecting the handle is returned immediately
    /// with no live connection in it. Fails only after `shutdown`.
    pub fn handle(&self) -> Result<ConnectionHandle<T::Connection>, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(self.shared.handle.clone())
    }

    /// Register an observer for lifecycle notifications.
    ///
    /// Returns the observer's registration index (used in [`ObserverError`]).
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> usize {
        self.shared.observers.register(observer)
    }

    /// Register a closure called on every state transition.
    pub fn on_state_change<F>(&self, f: F) -> usize
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.add_observer(Arc::new(FnObserver::new(f)))
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.shared.observers.len()
    }

    /// Take the receiver for observer failures.
    ///
    /// Returns `None` after the first call. Only failures raised after the
    /// call are delivered; all of them are logged whether or not anyone
    /// listens.
    pub fn observer_errors(&self) -> Option<mpsc::UnboundedReceiver<ObserverError>> {
        self.shared.observers.take_error_receiver()
    }

    /// Initialize the shared connection.
    ///
    /// Idempotent: once initialized, further calls return the existing
    /// handle without opening another connection. Waits for the outcome of
    /// the first attempt only:
    /// - success returns the handle in `Connected`,
    /// - a transient failure returns the handle in `Reconnecting` (the
    ///   manager keeps retrying in the background),
    /// - a configuration failure moves to `Failed` and is returned as an
    ///   error. A failed manager may be initialized again.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] / [`Error::InvalidConfiguration`] for
    /// configuration failures, [`Error::Closed`] after shutdown.
    pub async fn initialize(
        &self,
        config: ManagerConfig,
    ) -> Result<ConnectionHandle<T::Connection>, Error> {
        let mut lifecycle = self.lifecycle.lock().await;

        if self.is_closed() {
            return Err(Error::Closed);
        }

        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Failed => {}
            state => {
                if let Some(current) = &lifecycle.config {
                    if current.endpoint != config.endpoint {
                        warn!(
                            "[cache {}] Already initialized ({}); ignoring configuration for {}",
                            current.endpoint, state, config.endpoint
                        );
                    }
                }
                return Ok(self.shared.handle.clone());
            }
        }

        // Reap the driver of a previous, failed initialization
        lifecycle.command_tx = None;
        if let Some(driver) = lifecycle.driver.take() {
            let _ = driver.await;
        }

        if let Err(e) = config.validate() {
            self.shared.metrics.record_configuration_failure();
            error!("[cache {}] Invalid configuration: {}", config.endpoint, e);
            self.shared.transition(
                &config.endpoint,
                ConnectionState::Failed,
                0,
                None,
                Some(&Error::Configuration(e.clone())),
            );
            return Err(Error::Configuration(e));
        }

        info!("[cache {}] Initializing shared connection", config.endpoint);
        self.shared
            .transition(&config.endpoint, ConnectionState::Connecting, 0, None, None);

        let (command_tx, command_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver::new(
            self.transport.clone(),
            config.clone(),
            self.shared.clone(),
            command_rx,
            ready_tx,
        );

        lifecycle.driver = Some(tokio::spawn(run_driver_with_recovery(
            driver,
            config.clone(),
            self.shared.clone(),
        )));
        lifecycle.command_tx = Some(command_tx);
        lifecycle.config = Some(config);

        // Release the lock so shutdown can cancel the first attempt
        drop(lifecycle);

        match ready_rx.await {
            Ok(Ok(())) => Ok(self.shared.handle.clone()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Closed),
        }
    }

    /// Drop the current connection and connect again immediately,
    /// skipping any pending backoff.
    ///
    /// Ignored while an attempt is already in flight, or when the manager
    /// is not running (not initialized, or `Failed`).
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after shutdown.
    pub async fn reconnect(&self) -> Result<(), Error> {
        let lifecycle = self.lifecycle.lock().await;

        if self.is_closed() {
            return Err(Error::Closed);
        }

        match &lifecycle.command_tx {
            Some(tx) if !self.state().is_terminal() => {
                // The driver only goes away on shutdown or Failed
                if tx.send(ManagerCommand::Reconnect).await.is_err() {
                    debug!("Connection driver already stopped, reconnect ignored");
                }
            }
            _ => debug!("Manager not running ({}), reconnect ignored", self.state()),
        }

        Ok(())
    }

    /// Shut the manager down.
    ///
    /// Cancels any pending backoff or in-flight attempt, closes the
    /// connection and enters the terminal `Closed` state. Safe to call from
    /// any state and idempotent.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;

        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (endpoint, close_timeout) = match &lifecycle.config {
            Some(config) => (config.endpoint.clone(), config.connect_timeout),
            None => {
                let defaults = ManagerConfig::default();
                (defaults.endpoint, defaults.connect_timeout)
            }
        };
        info!("[cache {}] Shutting down connection manager", endpoint);

        if let Some(tx) = lifecycle.command_tx.take() {
            if tx.send(ManagerCommand::Close).await.is_err() {
                debug!("[cache {}] Connection driver already stopped", endpoint);
            }
        }

        // Wait for the driver to release the connection
        if let Some(driver) = lifecycle.driver.take() {
            if let Err(e) = driver.await {
                warn!("[cache {}] Connection driver task failed: {}", endpoint, e);
            }
        }

        if let Some(connection) = self.shared.handle.take() {
            self.shared.metrics.record_disconnected();
            if timeout(close_timeout, self.transport.close(&connection))
                .await
                .is_err()
            {
                warn!(
                    "[cache {}] Transport close timed out after {:?}",
                    endpoint, close_timeout
                );
            }
        }

        self.shared.transition(
            &endpoint,
            ConnectionState::Closed,
            self.shared.handle.reconnect_attempt(),
            None,
            None,
        );
        info!("[cache {}] Connection manager closed", endpoint);
    }
}

/// Run the driver, turning a panic into a `Failed` state instead of a
/// silently dead connection.
async fn run_driver_with_recovery<T: Transport>(
    driver: Driver<T>,
    config: ManagerConfig,
    shared: Arc<Shared<T::Connection>>,
) {
    if let Err(panic_err) = AssertUnwindSafe(driver.run()).catch_unwind().await {
        error!(
            "[cache {}] Connection driver PANICKED: {}. Manager needs re-initialization.",
            config.endpoint,
            panic_message(panic_err.as_ref())
        );
        if shared.handle.take().is_some() {
            shared.metrics.record_disconnected();
        }
        shared.transition(
            &config.endpoint,
            ConnectionState::Failed,
            shared.handle.reconnect_attempt(),
            None,
            None,
        );
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        // Abort the driver to prevent an orphaned task
        if let Some(driver) = self.lifecycle.get_mut().driver.take() {
            driver.abort();
        }
    }
}
