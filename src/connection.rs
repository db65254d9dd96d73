use crate::config::{Endpoint, ManagerConfig};
use crate::error::{Error, TransportError};
use crate::handle::{ConnectionState, SharedHandle};
use crate::metrics::Metrics;
use crate::observer::{Observers, StateChange};
use crate::transport::{EventReceiver, EventSender, Transport, TransportEvent, TransportEvents};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Commands that can be sent to the driver
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    /// Release the connection and stop
    Close,
    /// Drop the current connection (or pending backoff) and connect again
    Reconnect,
}

/// State shared between the manager and its driver task
pub(crate) struct Shared<C> {
    pub(crate) handle: Arc<SharedHandle<C>>,
    pub(crate) observers: Observers,
    pub(crate) metrics: Arc<Metrics>,
}

impl<C> Shared<C> {
    pub(crate) fn new() -> Self {
        Self {
            handle: Arc::new(SharedHandle::new()),
            observers: Observers::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Apply a transition and deliver it to every observer before returning.
    ///
    /// Callers guarantee that only one transition is applied at a time: the
    /// driver task while it runs, the manager (under its lifecycle lock)
    /// otherwise.
    pub(crate) fn transition(
        &self,
        endpoint: &Endpoint,
        next: ConnectionState,
        attempt: u32,
        delay: Option<Duration>,
        cause: Option<&Error>,
    ) {
        self.handle.set_reconnect_attempt(attempt);
        let previous = self.handle.set_state(next);
        trace!("[cache {}] {} -> {}", endpoint, previous, next);

        let change = StateChange {
            endpoint: endpoint.clone(),
            previous,
            current: next,
            attempt,
            delay,
        };
        let failures = self.observers.notify(&change, cause);
        self.metrics.record_observer_failures(failures);
    }
}

enum Phase {
    /// Issue a connection attempt
    Connect,
    /// Connection is up; wait for transport events
    Live,
    /// Wait out the backoff after a transient failure
    Backoff(Instant),
}

/// Owns the state machine for one initialized manager.
///
/// All transitions happen on this task, one at a time. Transport events
/// and manager commands are queued and handled in order, so only one
/// connection attempt is ever in flight.
pub(crate) struct Driver<T: Transport> {
    transport: Arc<T>,
    config: ManagerConfig,
    shared: Arc<Shared<T::Connection>>,
    commands: mpsc::Receiver<ManagerCommand>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    /// Bumped on every attempt; events tagged with an older value are stale
    generation: u64,
    reconnect_attempt: u32,
    /// Signals `initialize` once the first attempt has an outcome
    ready_tx: Option<oneshot::Sender<Result<(), Error>>>,
}

impl<T: Transport> Driver<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        config: ManagerConfig,
        shared: Arc<Shared<T::Connection>>,
        commands: mpsc::Receiver<ManagerCommand>,
        ready_tx: oneshot::Sender<Result<(), Error>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            config,
            shared,
            commands,
            events_tx,
            events_rx,
            generation: 0,
            reconnect_attempt: 0,
            ready_tx: Some(ready_tx),
        }
    }

    /// Run the state machine until shutdown or a configuration failure.
    pub(crate) async fn run(mut self) {
        let mut phase = Phase::Connect;

        loop {
            let next = match phase {
                Phase::Connect => self.connect().await,
                Phase::Live => self.live().await,
                Phase::Backoff(deadline) => self.backoff(deadline).await,
            };

            match next {
                Some(p) => phase = p,
                None => break,
            }
        }

        self.release_connection().await;
        debug!("[cache {}] Connection driver stopped", self.config.endpoint);
    }

    /// Issue one connection attempt. Returns `None` when the driver must stop.
    async fn connect(&mut self) -> Option<Phase> {
        self.generation += 1;
        let events = TransportEvents::new(self.generation, self.events_tx.clone());
        let transport = self.transport.clone();
        let endpoint = self.config.endpoint.clone();
        let connect_timeout = self.config.connect_timeout;

        debug!(
            "[cache {}] Connecting (attempt {}, generation {})",
            endpoint, self.reconnect_attempt, self.generation
        );

        let result = {
            let attempt = timeout(connect_timeout, transport.connect(&endpoint, events));
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    cmd = self.commands.recv() => match cmd {
                        Some(ManagerCommand::Reconnect) => {
                            debug!("[cache {}] Reconnect requested while an attempt is in flight, ignoring", endpoint);
                        }
                        Some(ManagerCommand::Close) | None => {
                            info!("[cache {}] Connection attempt cancelled by shutdown", endpoint);
                            return None;
                        }
                    },
                }
            }
        };

        match result {
            Ok(Ok(connection)) => {
                self.on_connected(connection);
                Some(Phase::Live)
            }
            Ok(Err(e)) => self.on_failure(e),
            Err(_) => self.on_failure(TransportError::timeout(format!(
                "connect timed out after {:?}",
                connect_timeout
            ))),
        }
    }

    fn on_connected(&mut self, connection: T::Connection) {
        let endpoint = &self.config.endpoint;

        self.shared.handle.install(Arc::new(connection));
        self.shared.metrics.record_connected();
        self.reconnect_attempt = 0;

        info!("[cache {}] Connected", endpoint);
        self.shared
            .transition(endpoint, ConnectionState::Connected, 0, None, None);
        self.signal_ready(Ok(()));
    }

    /// Route a failure: transient ones schedule a retry, the rest end in `Failed`.
    ///
    /// The transition is applied before returning, so callers release the
    /// old connection only once the state no longer reads `Connected`.
    fn on_failure(&mut self, cause: TransportError) -> Option<Phase> {
        if cause.is_retryable() {
            self.shared.metrics.record_transport_error();
            warn!(
                "[cache {}] Transport error: {} (attempt {})",
                self.config.endpoint, cause, self.reconnect_attempt
            );
            return Some(self.schedule_retry(cause));
        }

        self.shared.metrics.record_configuration_failure();
        error!(
            "[cache {}] Non-retryable transport error, giving up: {}",
            self.config.endpoint, cause
        );
        self.shared.transition(
            &self.config.endpoint,
            ConnectionState::Failed,
            self.reconnect_attempt,
            None,
            Some(&Error::InvalidConfiguration(cause.clone())),
        );
        self.signal_ready(Err(Error::InvalidConfiguration(cause)));
        None
    }

    /// Wait for transport events or commands while connected.
    async fn live(&mut self) -> Option<Phase> {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ManagerCommand::Reconnect) => {
                        info!("[cache {}] Manual reconnect", self.config.endpoint);
                        self.enter_connecting();
                        self.release_connection().await;
                        return Some(Phase::Connect);
                    }
                    Some(ManagerCommand::Close) | None => return None,
                },
                Some((generation, event)) = self.events_rx.recv() => {
                    if generation != self.generation {
                        self.discard_stale(generation, &event);
                        continue;
                    }

                    let cause = match event {
                        TransportEvent::Connect => {
                            trace!("[cache {}] Duplicate connect event", self.config.endpoint);
                            continue;
                        }
                        TransportEvent::Error(e) => e,
                        TransportEvent::Reconnecting => {
                            TransportError::reset("transport lost the connection")
                        }
                        TransportEvent::Close => TransportError::closed("connection closed by peer"),
                    };

                    let next = self.on_failure(cause);
                    self.release_connection().await;
                    return next;
                }
            }
        }
    }

    /// Bump the attempt counter and enter `Reconnecting`. Returns the
    /// backoff phase holding the deadline of the next attempt.
    fn schedule_retry(&mut self, cause: TransportError) -> Phase {
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = self.config.backoff.delay_for_attempt(self.reconnect_attempt);
        self.shared.metrics.record_reconnect_attempt();

        debug!(
            "[cache {}] Reconnecting in {:?} (attempt {})",
            self.config.endpoint, delay, self.reconnect_attempt
        );
        self.shared.transition(
            &self.config.endpoint,
            ConnectionState::Reconnecting,
            self.reconnect_attempt,
            Some(delay),
            Some(&Error::Transport(cause)),
        );
        // A transient first failure still hands the caller the shared handle
        self.signal_ready(Ok(()));

        Phase::Backoff(Instant::now() + delay)
    }

    /// Wait until `deadline`, or until a command cuts the wait short.
    async fn backoff(&mut self, deadline: Instant) -> Option<Phase> {
        let sleep = sleep_until(deadline);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Some(Phase::Connect),
                cmd = self.commands.recv() => match cmd {
                    Some(ManagerCommand::Reconnect) => {
                        info!("[cache {}] Manual reconnect, skipping backoff", self.config.endpoint);
                        self.enter_connecting();
                        return Some(Phase::Connect);
                    }
                    Some(ManagerCommand::Close) | None => return None,
                },
                Some((generation, event)) = self.events_rx.recv() => {
                    self.discard_stale(generation, &event);
                }
            }
        }
    }

    fn enter_connecting(&mut self) {
        self.shared.transition(
            &self.config.endpoint,
            ConnectionState::Connecting,
            self.reconnect_attempt,
            None,
            None,
        );
    }

    fn discard_stale(&self, generation: u64, event: &TransportEvent) {
        trace!(
            "[cache {}] Ignoring {:?} from replaced connection (generation {}, current {})",
            self.config.endpoint,
            event,
            generation,
            self.generation
        );
        self.shared.metrics.record_stale_event();
    }

    /// Take the connection out of the shared handle and close it.
    async fn release_connection(&mut self) {
        let Some(connection) = self.shared.handle.take() else {
            return;
        };
        self.shared.metrics.record_disconnected();

        if timeout(self.config.connect_timeout, self.transport.close(&connection))
            .await
            .is_err()
        {
            warn!(
                "[cache {}] Transport close timed out after {:?}",
                self.config.endpoint, self.config.connect_timeout
            );
        }
    }

    fn signal_ready(&mut self, result: Result<(), Error>) {
        if let Some(ready_tx) = self.ready_tx.take() {
            // initialize may have given up waiting; nothing to do then
            let _ = ready_tx.send(result);
        }
    }
}
