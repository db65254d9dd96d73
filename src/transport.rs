use crate::config::Endpoint;
use crate::error::TransportError;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Events a transport reports about an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is (still) up
    Connect,
    /// The connection failed
    Error(TransportError),
    /// The underlying client lost the connection and is trying to recover it
    Reconnecting,
    /// The peer closed the connection
    Close,
}

pub(crate) type EventSender = mpsc::UnboundedSender<(u64, TransportEvent)>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

/// Sink through which a transport reports events for one connection.
///
/// Each sink is bound to the connection attempt it was handed to. Events
/// emitted after the manager has replaced that connection are discarded.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: EventSender,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: EventSender) -> Self {
        Self { generation, tx }
    }

    /// Report an event. Returns `false` if the manager is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Report a failure of the connection
    pub fn error(&self, err: TransportError) -> bool {
        self.emit(TransportEvent::Error(err))
    }

    /// Report that the peer closed the connection
    pub fn closed(&self) -> bool {
        self.emit(TransportEvent::Close)
    }

    /// Connection attempt this sink belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// The cache-client capability the manager wraps.
///
/// The manager only governs the lifecycle: it calls `connect`, keeps the
/// returned connection in the shared handle, and calls `close` when the
/// connection is replaced or the manager shuts down. After `connect`
/// succeeds the transport reports later failures through `events`.
///
/// Errors whose kind is not retryable (invalid address, rejected
/// credentials) stop the manager in the `Failed` state.
pub trait Transport: Send + Sync + 'static {
    /// The live connection object shared with callers
    type Connection: Send + Sync + 'static;

    /// Open a connection to `endpoint`.
    fn connect(
        &self,
        endpoint: &Endpoint,
        events: TransportEvents,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Release a connection. Called at most once per connection.
    fn close(&self, _connection: &Self::Connection) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Plain TCP transport.
///
/// Opens a TCP stream to the endpoint with `TCP_NODELAY` set. The wire
/// protocol spoken over the stream is up to the caller.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    _private: (),
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A TCP connection managed by [`TcpTransport`].
#[derive(Debug)]
pub struct TcpConnection {
    stream: Mutex<TcpStream>,
    peer: SocketAddr,
    events: TransportEvents,
}

impl TcpConnection {
    /// Address of the cache server
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Exclusive access to the stream for one request/response exchange
    pub async fn stream(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock().await
    }

    /// Report an I/O failure seen by higher-level cache code so the manager
    /// reconnects.
    pub fn report_failure(&self, err: io::Error) {
        debug!("Connection to {} reported failure: {}", self.peer, err);
        if err.kind() == io::ErrorKind::UnexpectedEof {
            self.events.closed();
        } else {
            self.events.error(err.into());
        }
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: TransportEvents,
    ) -> Result<TcpConnection, TransportError> {
        let stream = connect_direct(&endpoint.host, endpoint.port).await?;
        set_tcp_options(&stream);
        let peer = stream.peer_addr()?;

        Ok(TcpConnection {
            stream: Mutex::new(stream),
            peer,
            events,
        })
    }

    async fn close(&self, connection: &TcpConnection) {
        let mut stream = connection.stream.lock().await;
        if let Err(e) = stream.shutdown().await {
            trace!("Shutdown of {} failed: {}", connection.peer, e);
        }
    }
}

/// Resolve the host and try each address in turn
async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();

    let mut last_error = TransportError::invalid_address(format!("{} resolved to no addresses", host));
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = e.into();
            }
        }
    }

    Err(last_error)
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn sink(generation: u64) -> (TransportEvents, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportEvents::new(generation, tx), rx)
    }

    #[test]
    fn test_events_are_tagged_with_generation() {
        let (events, mut rx) = sink(3);

        assert!(events.error(TransportError::reset("gone")));
        assert!(events.closed());

        assert_eq!(
            rx.try_recv().ok(),
            Some((3, TransportEvent::Error(TransportError::reset("gone"))))
        );
        assert_eq!(rx.try_recv().ok(), Some((3, TransportEvent::Close)));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (events, rx) = sink(0);
        drop(rx);
        assert!(!events.emit(TransportEvent::Connect));
    }

    #[tokio::test]
    async fn test_tcp_connect_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept = tokio::spawn(async move { listener.accept().await });

        let transport = TcpTransport::new();
        let (events, _rx) = sink(1);
        let connection = transport
            .connect(&Endpoint::new("127.0.0.1", addr.port()), events)
            .await
            .expect("connect");
        assert_eq!(connection.peer_addr(), addr);

        let (mut server_side, _) = accept.await.expect("accept task").expect("accept");
        transport.close(&connection).await;

        let mut buf = [0u8; 1];
        let read = server_side.read(&mut buf).await.expect("read");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        drop(listener);

        let (events, _rx) = sink(1);
        let err = TcpTransport::new()
            .connect(&Endpoint::new("127.0.0.1", port), events)
            .await
            .expect_err("nothing listening");
        assert_eq!(err.kind(), TransportErrorKind::Refused);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_report_failure_emits_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let _accept = tokio::spawn(async move { listener.accept().await });

        let (events, mut rx) = sink(9);
        let connection = TcpTransport::new()
            .connect(&Endpoint::new("127.0.0.1", port), events)
            .await
            .expect("connect");

        connection.report_failure(io::Error::from(io::ErrorKind::ConnectionReset));
        connection.report_failure(io::Error::from(io::ErrorKind::UnexpectedEof));

        match rx.recv().await {
            Some((9, TransportEvent::Error(err))) => {
                assert_eq!(err.kind(), TransportErrorKind::Reset)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(rx.recv().await, Some((9, TransportEvent::Close)));
    }
}
