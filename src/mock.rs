//! Scripted transport for tests.

use crate::config::Endpoint;
use crate::error::TransportError;
use crate::transport::{Transport, TransportEvents};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// What the next connect call does
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Succeed,
    Fail(TransportError),
    /// Never completes
    Hang,
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    pub(crate) id: usize,
    pub(crate) generation: u64,
}

pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    connect_delay: Duration,
    close_delay: Duration,
    connects: AtomicUsize,
    closes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connect_times: Mutex<Vec<Instant>>,
    sinks: Mutex<Vec<TransportEvents>>,
}

impl MockTransport {
    /// Every connect succeeds
    pub(crate) fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Outcome::Succeed,
            connect_delay: Duration::ZERO,
            close_delay: Duration::ZERO,
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            connect_times: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes for the first connects, in order
    pub(crate) fn script(self, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Outcome once the script is exhausted
    pub(crate) fn fallback(mut self, outcome: Outcome) -> Self {
        self.fallback = outcome;
        self
    }

    pub(crate) fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// How long each close takes
    pub(crate) fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_times(&self) -> Vec<Instant> {
        self.connect_times.lock().clone()
    }

    /// Event sink of the most recent successful connection
    pub(crate) fn last_events(&self) -> TransportEvents {
        self.sinks
            .lock()
            .last()
            .cloned()
            .expect("no successful connection yet")
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(
        &self,
        _endpoint: &Endpoint,
        events: TransportEvents,
    ) -> Result<MockConnection, TransportError> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.connect_times.lock().push(Instant::now());
        let _guard = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let outcome = self.script.lock().pop_front();
        let outcome = outcome.unwrap_or_else(|| self.fallback.clone());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        match outcome {
            Outcome::Succeed => {
                self.sinks.lock().push(events.clone());
                Ok(MockConnection {
                    id,
                    generation: events.generation(),
                })
            }
            Outcome::Fail(err) => Err(err),
            Outcome::Hang => std::future::pending().await,
        }
    }

    async fn close(&self, _connection: &MockConnection) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
    }
}
