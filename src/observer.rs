use crate::config::Endpoint;
use crate::error::Error;
use crate::handle::ConnectionState;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

/// Boxed error an observer may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by observer callbacks
pub type ObserverResult = Result<(), BoxError>;

/// Describes one state transition, passed to every observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Endpoint the manager is connecting to
    pub endpoint: Endpoint,
    /// State before the transition
    pub previous: ConnectionState,
    /// State after the transition
    pub current: ConnectionState,
    /// Reconnect attempt counter after the transition
    pub attempt: u32,
    /// Backoff delay before the next attempt (only when entering `Reconnecting`)
    pub delay: Option<Duration>,
}

/// Trait for logging/metrics collaborators that want lifecycle events.
///
/// Observers are called synchronously, in registration order, before the
/// manager processes its next transition. They must not block. A callback
/// that returns `Err` or panics is isolated: the failure is logged and
/// reported through [`ConnectionManager::observer_errors`](crate::ConnectionManager::observer_errors),
/// the remaining observers still run, and the state machine is unaffected.
///
/// # Example
///
/// ```ignore
/// use cache_conn_manager::{ConnectionObserver, ObserverResult, StateChange};
///
/// struct Audit;
///
/// impl ConnectionObserver for Audit {
///     fn on_connected(&self, change: &StateChange) -> ObserverResult {
///         println!("cache up at {}", change.endpoint);
///         Ok(())
///     }
/// }
/// ```
pub trait ConnectionObserver: Send + Sync + 'static {
    /// Called for every transition, before the more specific callbacks.
    fn on_state_change(&self, _change: &StateChange) -> ObserverResult {
        Ok(())
    }

    /// Called after a connection is established.
    fn on_connected(&self, _change: &StateChange) -> ObserverResult {
        Ok(())
    }

    /// Called when a failure drives a transition (to `Reconnecting` or `Failed`).
    fn on_error(&self, _cause: &Error, _change: &StateChange) -> ObserverResult {
        Ok(())
    }

    /// Called when a reconnect has been scheduled.
    fn on_reconnecting(&self, _change: &StateChange) -> ObserverResult {
        Ok(())
    }
}

/// Observer built from a closure, see
/// [`ConnectionManager::on_state_change`](crate::ConnectionManager::on_state_change).
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&StateChange) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ConnectionObserver for FnObserver<F>
where
    F: Fn(&StateChange) + Send + Sync + 'static,
{
    fn on_state_change(&self, change: &StateChange) -> ObserverResult {
        (self.0)(change);
        Ok(())
    }
}

/// Which observer callback failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    StateChange,
    Connected,
    Error,
    Reconnecting,
}

impl fmt::Display for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Callback::StateChange => "on_state_change",
            Callback::Connected => "on_connected",
            Callback::Error => "on_error",
            Callback::Reconnecting => "on_reconnecting",
        };
        f.write_str(name)
    }
}

/// A failure raised by an observer, isolated from the state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("observer #{index} failed in {callback} during {transition}: {message}")]
pub struct ObserverError {
    /// Registration index of the failing observer
    pub index: usize,
    /// Callback that failed
    pub callback: Callback,
    /// State entered by the transition being delivered
    pub transition: ConnectionState,
    /// Error or panic message
    pub message: String,
    /// Whether the observer panicked (as opposed to returning `Err`)
    pub panicked: bool,
}

/// Registered observers plus the side channel for their failures.
///
/// The channel only exists once a receiver has been handed out; until then
/// failures are logged and dropped.
pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<ObserverError>>>,
    receiver_taken: AtomicBool,
}

impl Observers {
    pub(crate) fn new() -> Self {
        Self {
            list: RwLock::new(Vec::new()),
            errors_tx: Mutex::new(None),
            receiver_taken: AtomicBool::new(false),
        }
    }

    /// Register an observer, returning its index
    pub(crate) fn register(&self, observer: Arc<dyn ConnectionObserver>) -> usize {
        let mut list = self.list.write();
        list.push(observer);
        list.len() - 1
    }

    pub(crate) fn len(&self) -> usize {
        self.list.read().len()
    }

    /// Hand out the failure receiver (only once). Failures raised before
    /// this call are not delivered.
    pub(crate) fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<ObserverError>> {
        if self.receiver_taken.swap(true, Ordering::AcqRel) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.errors_tx.lock() = Some(tx);
        Some(rx)
    }

    /// Deliver one transition to every observer, in registration order.
    ///
    /// Returns the number of callbacks that failed.
    pub(crate) fn notify(&self, change: &StateChange, cause: Option<&Error>) -> usize {
        // Snapshot so observers may register further observers without deadlocking
        let observers: Vec<Arc<dyn ConnectionObserver>> = self.list.read().clone();
        let mut failures = 0;

        for (index, observer) in observers.iter().enumerate() {
            let mut deliver = |callback: Callback, f: &dyn Fn() -> ObserverResult| {
                if let Some(err) = invoke(index, callback, change.current, f) {
                    failures += 1;
                    self.report(&change.endpoint, err);
                }
            };

            deliver(Callback::StateChange, &|| observer.on_state_change(change));

            if let Some(cause) = cause {
                deliver(Callback::Error, &|| observer.on_error(cause, change));
            }

            match change.current {
                ConnectionState::Connected => {
                    deliver(Callback::Connected, &|| observer.on_connected(change));
                }
                ConnectionState::Reconnecting => {
                    deliver(Callback::Reconnecting, &|| observer.on_reconnecting(change));
                }
                _ => {}
            }
        }

        failures
    }

    fn report(&self, endpoint: &Endpoint, err: ObserverError) {
        error!("[cache {}] {}", endpoint, err);

        let mut errors_tx = self.errors_tx.lock();
        if let Some(tx) = errors_tx.as_ref() {
            if tx.send(err).is_err() {
                // Receiver dropped; stop sending
                *errors_tx = None;
            }
        }
    }
}

fn invoke(
    index: usize,
    callback: Callback,
    transition: ConnectionState,
    f: &dyn Fn() -> ObserverResult,
) -> Option<ObserverError> {
    let (message, panicked) = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return None,
        Ok(Err(e)) => (e.to_string(), false),
        Err(panic) => (panic_message(panic.as_ref()), true),
    };

    Some(ObserverError {
        index,
        callback,
        transition,
        message,
        panicked,
    })
}

/// Extract a panic message if possible
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn change(current: ConnectionState) -> StateChange {
        StateChange {
            endpoint: Endpoint::default(),
            previous: ConnectionState::Connecting,
            current,
            attempt: 0,
            delay: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_state_change(&self, _change: &StateChange) -> ObserverResult {
            self.calls.lock().push("state");
            Ok(())
        }

        fn on_connected(&self, _change: &StateChange) -> ObserverResult {
            self.calls.lock().push("connected");
            Ok(())
        }

        fn on_error(&self, _cause: &Error, _change: &StateChange) -> ObserverResult {
            self.calls.lock().push("error");
            Ok(())
        }

        fn on_reconnecting(&self, _change: &StateChange) -> ObserverResult {
            self.calls.lock().push("reconnecting");
            Ok(())
        }
    }

    struct Panicker;

    impl ConnectionObserver for Panicker {
        fn on_connected(&self, _change: &StateChange) -> ObserverResult {
            panic!("observer blew up");
        }
    }

    struct Failer;

    impl ConnectionObserver for Failer {
        fn on_state_change(&self, _change: &StateChange) -> ObserverResult {
            Err("metrics sink unavailable".into())
        }
    }

    #[test]
    fn test_callbacks_per_transition() {
        let observers = Observers::new();
        let recorder = Arc::new(Recorder::default());
        observers.register(recorder.clone());

        observers.notify(&change(ConnectionState::Connected), None);
        let cause = Error::from(TransportError::reset("peer reset"));
        observers.notify(&change(ConnectionState::Reconnecting), Some(&cause));

        assert_eq!(
            *recorder.calls.lock(),
            vec!["state", "connected", "state", "error", "reconnecting"]
        );
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let observers = Observers::new();
        let mut errors = observers.take_error_receiver().expect("first take");
        let recorder = Arc::new(Recorder::default());

        observers.register(Arc::new(Panicker));
        observers.register(recorder.clone());

        let failures = observers.notify(&change(ConnectionState::Connected), None);

        assert_eq!(failures, 1);
        assert_eq!(*recorder.calls.lock(), vec!["state", "connected"]);

        let err = errors.try_recv().expect("reported failure");
        assert_eq!(err.index, 0);
        assert_eq!(err.callback, Callback::Connected);
        assert!(err.panicked);
        assert_eq!(err.message, "observer blew up");
    }

    #[test]
    fn test_returned_error_is_reported() {
        let observers = Observers::new();
        let mut errors = observers.take_error_receiver().expect("first take");
        observers.register(Arc::new(Failer));

        assert_eq!(observers.notify(&change(ConnectionState::Connecting), None), 1);

        let err = errors.try_recv().expect("reported failure");
        assert!(!err.panicked);
        assert_eq!(err.callback, Callback::StateChange);
        assert_eq!(err.transition, ConnectionState::Connecting);
    }

    #[test]
    fn test_failures_without_receiver_are_not_buffered() {
        let observers = Observers::new();
        observers.register(Arc::new(Failer));

        for _ in 0..1_000 {
            observers.notify(&change(ConnectionState::Reconnecting), None);
        }

        let mut errors = observers.take_error_receiver().expect("first take");
        assert!(matches!(
            errors.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        observers.notify(&change(ConnectionState::Connected), None);
        let err = errors.try_recv().expect("failure after take");
        assert_eq!(err.transition, ConnectionState::Connected);
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_stops_delivery() {
        let observers = Observers::new();
        observers.register(Arc::new(Failer));

        drop(observers.take_error_receiver().expect("first take"));
        assert_eq!(observers.notify(&change(ConnectionState::Connected), None), 1);
        assert!(observers.errors_tx.lock().is_none());
    }

    #[test]
    fn test_error_receiver_taken_once() {
        let observers = Observers::new();
        assert!(observers.take_error_receiver().is_some());
        assert!(observers.take_error_receiver().is_none());
    }

    #[test]
    fn test_fn_observer() {
        let observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        observers.register(Arc::new(FnObserver::new(move |c: &StateChange| {
            sink.lock().push(c.current)
        })));

        observers.notify(&change(ConnectionState::Connected), None);
        assert_eq!(*seen.lock(), vec![ConnectionState::Connected]);
        assert_eq!(observers.len(), 1);
    }
}
