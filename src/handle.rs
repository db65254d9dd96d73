use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of the shared connection.
///
/// Exactly one state is active at any instant. Transitions are driven only
/// by transport events, manual reconnects and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not yet initialized
    Disconnected,
    /// First attempt (or a manual reconnect) in flight
    Connecting,
    /// Live connection available
    Connected,
    /// Connection lost; waiting out the backoff or retrying
    Reconnecting,
    /// Non-retryable configuration error; needs re-initialization
    Failed,
    /// Shut down; the manager cannot be used again
    Closed,
}

impl ConnectionState {
    /// Whether no further transitions happen without outside intervention.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The single connection shared by every caller in the process.
///
/// Callers only read from it: all accessors are non-blocking and return the
/// best-effort current view. During reconnection [`connection`](Self::connection)
/// returns `None`; higher-level cache operations decide whether to retry.
/// Only the manager mutates it.
pub struct SharedHandle<C> {
    state_tx: watch::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<C>>>,
    reconnect_attempt: AtomicU32,
}

impl<C> SharedHandle<C> {
    pub(crate) fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            connection: RwLock::new(None),
            reconnect_attempt: AtomicU32::new(0),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Whether a live connection is currently installed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The live connection, if any
    pub fn connection(&self) -> Option<Arc<C>> {
        self.connection.read().clone()
    }

    /// Current reconnect attempt counter (0 while connected)
    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt.load(Ordering::Acquire)
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the state satisfies `predicate` and return that state.
    ///
    /// Returns immediately if the current state already matches.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = self.state_tx.subscribe();
        let result = rx.wait_for(|s| predicate(*s)).await.map(|s| *s);
        result.unwrap_or_else(|_| self.state())
    }

    /// Set the state, returning the previous one
    pub(crate) fn set_state(&self, state: ConnectionState) -> ConnectionState {
        self.state_tx.send_replace(state)
    }

    pub(crate) fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::Release);
    }

    /// Install a freshly established connection
    pub(crate) fn install(&self, connection: Arc<C>) -> Option<Arc<C>> {
        self.connection.write().replace(connection)
    }

    /// Remove the live connection so it can be closed
    pub(crate) fn take(&self) -> Option<Arc<C>> {
        self.connection.write().take()
    }
}

impl<C> fmt::Debug for SharedHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("state", &self.state())
            .field("has_connection", &self.connection.read().is_some())
            .field("reconnect_attempt", &self.reconnect_attempt())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_is_disconnected() {
        let handle: SharedHandle<()> = SharedHandle::new();

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(!handle.is_connected());
        assert!(handle.connection().is_none());
        assert_eq!(handle.reconnect_attempt(), 0);
    }

    #[test]
    fn test_install_and_take() {
        let handle = SharedHandle::new();

        assert!(handle.install(Arc::new(7u8)).is_none());
        assert_eq!(handle.connection().as_deref(), Some(&7));

        let old = handle.install(Arc::new(8u8));
        assert_eq!(old.as_deref(), Some(&7));

        assert_eq!(handle.take().as_deref(), Some(&8));
        assert!(handle.connection().is_none());
    }

    #[test]
    fn test_set_state_returns_previous() {
        let handle: SharedHandle<()> = SharedHandle::new();

        let previous = handle.set_state(ConnectionState::Connecting);
        assert_eq!(previous, ConnectionState::Disconnected);
        assert_eq!(handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_wait_for_observes_later_change() {
        let handle: Arc<SharedHandle<()>> = Arc::new(SharedHandle::new());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for(|s| s == ConnectionState::Connected).await })
        };

        handle.set_state(ConnectionState::Connecting);
        handle.set_state(ConnectionState::Connected);

        let state = waiter.await.expect("waiter task");
        assert_eq!(state, ConnectionState::Connected);
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Reconnecting.is_terminal());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
