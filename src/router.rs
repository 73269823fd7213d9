//! Protocol detection for a single listening socket.
//!
//! [`ProtocolRouter`] owns the raw listener. Every accepted connection is classified by sniffing
//! its first bytes and handed to one of two [`VirtualListener`]s. The sniffed bytes are replayed
//! through [`Rewind`], so downstream consumers see the stream from its first byte.

use crate::{
    rewind::Rewind,
    service::lifecycle::{Lifecycle, Phase},
};
use bytes::BytesMut;
use std::{future::Future, io, net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinSet,
};
use tracing::{Instrument, debug, error, info_span};

/// Request methods that start an HTTP/1.x request line, including the trailing space.
const HTTP1_METHODS: [&[u8]; 9] = [
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"PATCH ",
    b"CONNECT ",
    b"TRACE ",
];

const BACKLOG: usize = 128;

/// Pause after an accept error caused by resource exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Connection yielded by a [`VirtualListener`].
pub type RoutedStream = Rewind<TcpStream>;

/// Classification of an accepted connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    /// Starts with an HTTP/1.x request line.
    Http,
    /// Anything else, TLS handshakes included.
    Default,
}

/// Classifies the first bytes of a connection.
///
/// Returns `None` while `prefix` could still become an HTTP/1.x request line.
pub fn classify(prefix: &[u8]) -> Option<Protocol> {
    if HTTP1_METHODS.iter().any(|method| prefix.starts_with(method)) {
        Some(Protocol::Http)
    } else if HTTP1_METHODS.iter().any(|method| method.starts_with(prefix)) {
        None
    } else {
        Some(Protocol::Default)
    }
}

/// Reads from `io` until the connection can be classified.
///
/// Returns the protocol together with every byte that was read.
pub async fn sniff<I>(io: &mut I) -> io::Result<(Protocol, BytesMut)>
where
    I: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(16);

    loop {
        if let Some(protocol) = classify(&buf) {
            return Ok((protocol, buf));
        }

        if io.read_buf(&mut buf).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before it could be classified",
            ));
        }
    }
}

/// A listener fed by a [`ProtocolRouter`].
#[derive(Debug)]
pub struct VirtualListener {
    protocol: Protocol,
    rx: mpsc::Receiver<(RoutedStream, SocketAddr)>,
}

impl VirtualListener {
    /// Waits for the next connection routed to this listener.
    ///
    /// Returns `None` once the router has stopped and every routed connection has been accepted.
    pub async fn accept(&mut self) -> Option<(RoutedStream, SocketAddr)> {
        self.rx.recv().await
    }

    /// The protocol of the connections this listener yields.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// The two listeners produced by [`ProtocolRouter::new`].
#[derive(Debug)]
pub struct RoutedListeners {
    /// Connections that start with an HTTP/1.x request line.
    pub plain: VirtualListener,
    /// Every other connection.
    pub default: VirtualListener,
}

/// Accepts connections on one socket and routes them by protocol.
#[derive(Debug)]
pub struct ProtocolRouter {
    listener: TcpListener,
    sniff_timeout: Duration,
    plain: mpsc::Sender<(RoutedStream, SocketAddr)>,
    default: mpsc::Sender<(RoutedStream, SocketAddr)>,
}

impl ProtocolRouter {
    /// Creates a router over `listener`.
    ///
    /// Connections that cannot be classified within `sniff_timeout` are dropped.
    pub fn new(listener: TcpListener, sniff_timeout: Duration) -> (Self, RoutedListeners) {
        let (plain, plain_rx) = mpsc::channel(BACKLOG);
        let (default, default_rx) = mpsc::channel(BACKLOG);

        let router = Self {
            listener,
            sniff_timeout,
            plain,
            default,
        };

        let listeners = RoutedListeners {
            plain: VirtualListener {
                protocol: Protocol::Http,
                rx: plain_rx,
            },
            default: VirtualListener {
                protocol: Protocol::Default,
                rx: default_rx,
            },
        };

        (router, listeners)
    }

    /// Address of the underlying listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener itself can no longer accept connections. Failures of a
    /// single connection are skipped, and resource exhaustion is retried after a pause. The
    /// listener is closed when this returns, in either case.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        self.serve_with(shutdown, &Lifecycle::detached("router")).await
    }

    pub(crate) async fn serve_with(
        self,
        shutdown: impl Future<Output = ()>,
        lifecycle: &Lifecycle,
    ) -> io::Result<()> {
        let Self {
            listener,
            sniff_timeout,
            plain,
            default,
        } = self;

        let mut classifying = JoinSet::new();
        tokio::pin!(shutdown);
        lifecycle.set(Phase::Running);

        let result = loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, client_addr)) => {
                        let tx = RouteTx {
                            plain: plain.clone(),
                            default: default.clone(),
                        };
                        classifying.spawn(
                            route(stream, client_addr, sniff_timeout, tx)
                                .instrument(info_span!("route", %client_addr)),
                        );
                    }
                    Err(e) => match AcceptError::classify(&e) {
                        AcceptError::Connection => {
                            debug!("Failed to accept incoming connection: {}", e);
                        }
                        AcceptError::Listener => {
                            error!("Listener can no longer accept connections: {}", e);
                            break Err(e);
                        }
                        AcceptError::Resource => {
                            // Pending connections stay queued until resources free up.
                            error!("Failed to accept incoming connection: {}", e);
                            tokio::select! {
                                _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                                _ = &mut shutdown => break Ok(()),
                            }
                        }
                    },
                },
                Some(_) = classifying.join_next(), if !classifying.is_empty() => {}
                _ = &mut shutdown => break Ok(()),
            }
        };

        lifecycle.set(Phase::Draining);
        drop(listener);
        classifying.shutdown().await;
        lifecycle.set(Phase::Stopped);

        result
    }
}

struct RouteTx {
    plain: mpsc::Sender<(RoutedStream, SocketAddr)>,
    default: mpsc::Sender<(RoutedStream, SocketAddr)>,
}

async fn route(mut stream: TcpStream, client_addr: SocketAddr, timeout: Duration, tx: RouteTx) {
    let (protocol, prefix) = match tokio::time::timeout(timeout, sniff(&mut stream)).await {
        Ok(Ok(sniffed)) => sniffed,
        Ok(Err(e)) => {
            debug!("Dropping connection that could not be classified: {}", e);
            return;
        }
        Err(_) => {
            debug!("Dropping connection that was not classified within {:?}", timeout);
            return;
        }
    };

    debug!(?protocol, "Classified connection");

    let tx = match protocol {
        Protocol::Http => tx.plain,
        Protocol::Default => tx.default,
    };

    let stream = Rewind::new_buffered(stream, prefix.freeze());
    if tx.send((stream, client_addr)).await.is_err() {
        debug!(?protocol, "Listener closed, dropping connection");
    }
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum AcceptError {
    /// A single connection broke before it was accepted.
    Connection,
    /// The listener itself is unusable.
    Listener,
    /// Anything else, such as running out of file descriptors or memory. Retried after a pause.
    Resource,
}

impl AcceptError {
    fn classify(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => Self::Connection,
            io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => Self::Listener,
            _ => Self::Resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{io::AsyncWriteExt, sync::oneshot};

    const CLIENT_HELLO_START: [u8; 6] = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01];

    mod classify {
        use super::*;

        #[test]
        fn http_methods() {
            for method in HTTP1_METHODS {
                let mut line = method.to_vec();
                line.extend_from_slice(b"/ HTTP/1.1\r\n");
                assert_eq!(classify(&line), Some(Protocol::Http));
            }
        }

        #[test]
        fn tls_client_hello() {
            assert_eq!(classify(&CLIENT_HELLO_START), Some(Protocol::Default));
            assert_eq!(classify(&CLIENT_HELLO_START[..1]), Some(Protocol::Default));
        }

        #[test]
        fn undecided_prefixes() {
            assert_eq!(classify(b""), None);
            assert_eq!(classify(b"G"), None);
            assert_eq!(classify(b"GET"), None);
            assert_eq!(classify(b"OPTIONS"), None);
        }

        #[test]
        fn lookalikes() {
            assert_eq!(classify(b"GETS"), Some(Protocol::Default));
            assert_eq!(classify(b"get / HTTP/1.1"), Some(Protocol::Default));
            assert_eq!(classify(b"PRI * HTTP/2.0"), Some(Protocol::Default));
        }
    }

    #[test]
    fn accept_errors() {
        let classify = |kind| AcceptError::classify(&io::Error::from(kind));

        assert_eq!(classify(io::ErrorKind::ConnectionAborted), AcceptError::Connection);
        assert_eq!(classify(io::ErrorKind::ConnectionReset), AcceptError::Connection);
        assert_eq!(classify(io::ErrorKind::InvalidInput), AcceptError::Listener);
        assert_eq!(classify(io::ErrorKind::OutOfMemory), AcceptError::Resource);
        assert_eq!(classify(io::ErrorKind::Other), AcceptError::Resource);

        #[cfg(unix)]
        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let e = io::Error::from_raw_os_error(errno);
            assert_eq!(AcceptError::classify(&e), AcceptError::Resource, "{e}");
        }
    }

    mod sniff {
        use super::*;

        #[tokio::test]
        async fn keeps_every_byte_read() {
            let mut io: &[u8] = b"POST /echo HTTP/1.1\r\n\r\n";
            let (protocol, prefix) = sniff(&mut io).await.unwrap();

            assert_eq!(protocol, Protocol::Http);
            assert!(b"POST /echo HTTP/1.1\r\n\r\n".starts_with(&prefix));
            assert!(prefix.len() >= 5);
        }

        #[tokio::test]
        async fn eof_before_decision_is_an_error() {
            let mut io: &[u8] = b"GE";
            let err = sniff(&mut io).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

            let mut io: &[u8] = b"";
            assert!(sniff(&mut io).await.is_err());
        }
    }

    async fn start_router(
        sniff_timeout: Duration,
    ) -> (SocketAddr, RoutedListeners, oneshot::Sender<()>) {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let (router, listeners) = ProtocolRouter::new(listener, sniff_timeout);
        let addr = router.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(router.serve(async {
            rx.await.unwrap_or_default();
        }));

        (addr, listeners, tx)
    }

    #[tokio::test]
    async fn routes_http_to_plain_listener_with_bytes_replayed() {
        let (addr, mut listeners, stop) = start_router(Duration::from_secs(5)).await;
        let request = b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n";

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();

        let (mut stream, client_addr) = listeners.plain.accept().await.unwrap();
        assert_eq!(client_addr, client.local_addr().unwrap());

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request);

        stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn routes_tls_to_default_listener() {
        let (addr, mut listeners, stop) = start_router(Duration::from_secs(5)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&CLIENT_HELLO_START).await.unwrap();

        let (mut stream, _) = listeners.default.accept().await.unwrap();
        let mut received = [0; CLIENT_HELLO_START.len()];
        stream.read_exact(&mut received).await.unwrap();
        assert_eq!(received, CLIENT_HELLO_START);
        assert_eq!(listeners.default.protocol(), Protocol::Default);

        stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn unclassifiable_connections_do_not_stop_the_router() {
        let (addr, mut listeners, stop) = start_router(Duration::from_millis(200)).await;

        // Closes before a decision can be made.
        let mut early = TcpStream::connect(addr).await.unwrap();
        early.write_all(b"GE").await.unwrap();
        drop(early);

        // Never sends anything.
        let _silent = TcpStream::connect(addr).await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"HEAD / HTTP/1.1\r\n\r\n").await.unwrap();

        let (_, client_addr) = listeners.plain.accept().await.unwrap();
        assert_eq!(client_addr, client.local_addr().unwrap());

        stop.send(()).unwrap();
    }

    #[tokio::test]
    async fn listeners_close_after_shutdown() {
        let (addr, mut listeners, stop) = start_router(Duration::from_secs(5)).await;

        stop.send(()).unwrap();

        assert!(listeners.plain.accept().await.is_none());
        assert!(listeners.default.accept().await.is_none());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
