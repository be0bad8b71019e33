//! Listener, accept loop and per-connection request loop.
//!
//! Every accepted connection gets its own task that reads one request at a
//! time, dispatches it through the registry and writes the reply before
//! reading the next. Shutdown stops the accept loop and then waits, bounded
//! by the caller's timeout, for the connection tasks to finish on their own.

use crate::checker::{CheckerFactory, StandardCheckers};
use crate::drain::DrainManager;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::registry::Registry;
use crate::reply::{write_frame, Reply};
use crate::resp::{Frame, RequestReader};
use crate::session::Session;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Listen backlog for TCP sockets.
const BACKLOG: i32 = 1024;

/// A bound listening socket.
///
/// Addresses containing a `:` are TCP `host:port`, anything else is a Unix
/// socket path.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Listener {
    pub async fn bind(addr: &str) -> Result<Listener> {
        let listen_error = |source: io::Error| Error::Listen {
            addr: addr.to_string(),
            source,
        };

        if addr.contains(':') {
            let resolved = tokio::net::lookup_host(addr)
                .await
                .map_err(listen_error)?
                .next()
                .ok_or_else(|| {
                    listen_error(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "address resolved to nothing",
                    ))
                })?;
            let listener = tcp_listener(resolved).map_err(listen_error)?;
            Ok(Listener::Tcp(listener))
        } else {
            let listener = UnixListener::bind(addr).map_err(listen_error)?;
            Ok(Listener::Unix {
                listener,
                path: PathBuf::from(addr),
            })
        }
    }

    /// Bound TCP address, `None` for Unix sockets.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    async fn accept(&self) -> io::Result<(Stream, Option<String>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Stream::Tcp(stream), Some(peer.to_string())))
            }
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), None))
            }
        }
    }

    fn close(self) {
        if let Listener::Unix { listener, path } = self {
            drop(listener);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove socket file");
            }
        }
    }
}

fn tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Server instance
pub struct Server {
    addr: String,
    registry: Arc<Registry>,
    handler: Arc<dyn Handler>,
    drain: DrainManager,
    /// Accept loops still running; `stop` waits for these before draining.
    accepting: DrainManager,
    shutdown: CancellationToken,
    next_local: AtomicU64,
}

impl Server {
    /// Build a server for `handler` with the standard argument checkers.
    ///
    /// Fails if any of the handler's commands cannot be registered.
    pub fn new<H: Handler>(addr: impl Into<String>, handler: Arc<H>) -> Result<Self> {
        Self::with_checkers(addr, handler, &StandardCheckers::new())
    }

    pub fn with_checkers<H: Handler>(
        addr: impl Into<String>,
        handler: Arc<H>,
        factory: &dyn CheckerFactory,
    ) -> Result<Self> {
        let registry = Registry::build(&handler, factory)?;
        let addr = addr.into();
        info!(address = %addr, commands = registry.len(), "Server created");

        Ok(Server {
            addr,
            registry: Arc::new(registry),
            handler,
            drain: DrainManager::new(),
            accepting: DrainManager::new(),
            shutdown: CancellationToken::new(),
            next_local: AtomicU64::new(0),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of connection handlers still running.
    pub fn active_connections(&self) -> usize {
        self.drain.active()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<Listener> {
        Listener::bind(&self.addr).await
    }

    /// Bind and serve until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`stop`](Self::stop) is called.
    ///
    /// Accept failures are logged and do not end the loop.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        let _accepting = self.accepting.add();
        match listener.local_addr() {
            Some(local) => info!(address = %local, "Server listening"),
            None => info!(address = %self.addr, "Server listening"),
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((Stream::Tcp(stream), host)) => self.spawn_connection(stream, host),
                Ok((Stream::Unix(stream), host)) => self.spawn_connection(stream, host),
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }

        info!(address = %self.addr, "Stopped accepting connections");
        listener.close();
        Ok(())
    }

    /// Stop accepting and wait up to `timeout` for open connections to end.
    ///
    /// Every running accept loop has exited before the connection count is
    /// read, so no connection is spawned after the drain starts.
    /// Connections are not interrupted; a client that never finishes its
    /// current request makes this fail with [`Error::StopTimeout`].
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.shutdown.cancel();
        self.accepting.wait_timeout(timeout).await?;

        let timeout = deadline.saturating_duration_since(Instant::now());
        let active = self.drain.active();
        if active > 0 {
            info!(active, "Waiting for connections to drain");
        }
        self.drain.wait_timeout(timeout).await
    }

    fn spawn_connection<S>(&self, stream: S, host: Option<String>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let host = host.unwrap_or_else(|| {
            let seq = self.next_local.fetch_add(1, Ordering::Relaxed);
            format!("unix:{}#{}", self.addr, seq)
        });
        debug!(peer = %host, "New connection");

        let guard = self.drain.add();
        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            handle_connection(stream, host, &registry, handler).await;
            drop(guard);
        });
    }
}

/// Serve one client until it disconnects, sends a malformed request, or a
/// reply cannot be written.
pub async fn handle_connection<S>(
    stream: S,
    host: String,
    registry: &Registry,
    handler: Arc<dyn Handler>,
) where
    S: AsyncRead + AsyncWrite,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = RequestReader::new(read);
    let mut session = Session::new(host.clone(), handler);
    let teardown = CancellationToken::new();

    loop {
        let request = match reader.next_request().await {
            Ok(Some(request)) => request.from_connection(&host, &teardown),
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %host, error = %e, "Read failed");
                let _ = write_frame(&mut write, &Frame::Error(format!("ERR {e}"))).await;
                break;
            }
        };
        trace!(peer = %host, command = %request.name, "Processing command");

        let reply = registry
            .apply(&request, &mut session)
            .unwrap_or_else(|e| Reply::error(e.to_string()));

        let written = if reply.is_streaming() {
            // The reader keeps watching the socket so a peer that goes away
            // mid-stream tears the sink down.
            tokio::select! {
                result = reply.write_to(&mut write, &teardown) => result,
                () = reader.closed() => {
                    trace!(peer = %host, "Peer closed or flooded while streaming");
                    break;
                }
            }
        } else {
            reply.write_to(&mut write, &teardown).await
        };

        if let Err(e) = written {
            debug!(peer = %host, error = %e, "Write failed");
            break;
        }
    }

    session.close();
    teardown.cancel();
    let _ = write.shutdown().await;
    debug!(peer = %host, "Connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::KvHandler;
    use crate::pubsub::Hub;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    fn kv() -> (Arc<Hub>, Arc<KvHandler>) {
        let hub = Arc::new(Hub::default());
        let handler = Arc::new(KvHandler::new(Arc::clone(&hub), 16));
        (hub, handler)
    }

    fn registry(handler: &Arc<KvHandler>) -> Registry {
        Registry::build(handler, &StandardCheckers::new()).unwrap()
    }

    #[tokio::test]
    async fn test_ping_over_mock_stream() {
        let (_, handler) = kv();
        let registry = registry(&handler);
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nPING\r\n")
            .write(b"+PONG\r\n")
            .read(b"ECHO hi\r\n")
            .write(b"$2\r\nhi\r\n")
            .build();

        handle_connection(mock, "peer".to_string(), &registry, handler).await;
    }

    #[tokio::test]
    async fn test_dispatch_errors_keep_connection_open() {
        let (_, handler) = kv();
        let registry = registry(&handler);
        let mock = Builder::new()
            .read(b"*1\r\n$4\r\nNOPE\r\n")
            .write(b"-ERR method not supported\r\n")
            .read(b"*3\r\n$3\r\nGET\r\n$1\r\na\r\n$1\r\nb\r\n")
            .write(b"-ERR wrong number of arguments\r\n")
            .read(b"*3\r\n$3\r\nsEt\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .write(b"+OK\r\n")
            .read(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .write(b"$1\r\nv\r\n")
            .build();

        handle_connection(mock, "peer".to_string(), &registry, handler).await;
    }

    #[tokio::test]
    async fn test_parse_error_terminates_connection() {
        let (_, handler) = kv();
        let registry = registry(&handler);
        let (mut client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move {
            handle_connection(server, "peer".to_string(), &registry, handler).await;
        });

        client.write_all(b"*1\r\n$x\r\nPING\r\n").await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("-ERR Protocol error"), "got {out:?}");
        assert!(out.ends_with("\r\n"));
    }

    async fn started(server: &Arc<Server>) -> (SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(server);
        let task = tokio::spawn(async move { serving.serve(listener).await });
        (addr, task)
    }

    async fn wait_for_connections(server: &Server, n: usize) {
        for _ in 0..200 {
            if server.active_connections() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {n} connections, have {}",
            server.active_connections()
        );
    }

    #[tokio::test]
    async fn test_tcp_round_trip_and_idle_stop() {
        let (_, handler) = kv();
        let server = Arc::new(Server::new("127.0.0.1:0", handler).unwrap());
        let (addr, task) = started(&server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\nv1\r\n*2\r\n$3\r\nget\r\n$1\r\nk\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 13];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+OK\r\n$2\r\nv1\r\n");
        drop(client);

        wait_for_connections(&server, 0).await;
        server.stop(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_times_out_on_stalled_client() {
        let (_, handler) = kv();
        let server = Arc::new(Server::new("127.0.0.1:0", handler).unwrap());
        let (addr, task) = started(&server).await;

        let client = TcpStream::connect(addr).await.unwrap();
        wait_for_connections(&server, 1).await;

        assert!(matches!(
            server.stop(Duration::from_millis(50)).await,
            Err(Error::StopTimeout)
        ));
        task.await.unwrap().unwrap();

        drop(client);
        server.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_returns_after_accept_loop_exits() {
        let (_, handler) = kv();
        let server = Arc::new(Server::new("127.0.0.1:0", handler).unwrap());
        let (addr, task) = started(&server).await;
        for _ in 0..200 {
            if server.accepting.active() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(server.accepting.active(), 1);

        server.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(server.accepting.active(), 0);
        // The listening socket is already gone.
        assert!(TcpStream::connect(addr).await.is_err());
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_after_stop_accepts_nothing() {
        let (_, handler) = kv();
        let server = Server::new("127.0.0.1:0", handler).unwrap();
        server.stop(Duration::from_millis(50)).await.unwrap();

        let listener = server.bind().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), server.serve(listener))
            .await
            .expect("serve should return at once")
            .unwrap();
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_subscriber_disconnects() {
        let (hub, handler) = kv();
        let server = Arc::new(Server::new("127.0.0.1:0", handler).unwrap());
        let (addr, task) = started(&server).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n")
            .await
            .unwrap();
        let expected = b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n";
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        let news = Bytes::from_static(b"news");
        assert_eq!(hub.publish(&news, Bytes::from_static(b"hello")), 1);
        let expected = b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nhello\r\n";
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);

        drop(client);
        wait_for_connections(&server, 0).await;

        assert_eq!(hub.numsub(b"news"), 0);
        assert_eq!(hub.publish(&news, Bytes::from_static(b"late")), 0);

        server.stop(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unix_socket() {
        let path = std::env::temp_dir().join(format!("switchboard-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let addr = path.to_string_lossy().into_owned();

        let (_, handler) = kv();
        let server = Arc::new(Server::new(addr.clone(), handler).unwrap());
        let listener = server.bind().await.unwrap();
        assert!(listener.local_addr().is_none());
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(listener).await });

        let mut client = UnixStream::connect(&path).await.unwrap();
        client.write_all(b"PING\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");
        drop(client);

        wait_for_connections(&server, 0).await;
        server.stop(Duration::from_secs(1)).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_listen_error_names_address() {
        let err = Listener::bind("/nonexistent-dir/switchboard.sock")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Listen { ref addr, .. } if addr == "/nonexistent-dir/switchboard.sock"));
    }
}
