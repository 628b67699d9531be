//! Byte stream transports
//!
//! The client drives any stream through two small traits: a [`Connector`]
//! opens one [`Transport`] per connection attempt, and the transport moves
//! bytes without ever blocking once it is open. [`TcpConnector`] provides
//! plain `ws://` connections on the tokio reactor.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::handshake::Endpoint;

/// Callback invoked when the transport may have bytes to read
pub type ReadableCallback = Box<dyn FnMut()>;

/// A connected byte stream
pub trait Transport {
    /// Write as much of `data` as possible without blocking
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()`. `WouldBlock` means nothing could be written right now.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Read into `buf` without blocking
    ///
    /// `WouldBlock` and `Ok(0)` both mean "nothing right now". A peer that
    /// shut the stream down is reported as `UnexpectedEof` by the transports
    /// in this crate.
    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Switch between blocking and non-blocking operation
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Register the readiness callback, replacing any previous one
    fn on_readable(&mut self, callback: ReadableCallback);

    /// Stop notifications and release the stream
    fn close(&mut self);
}

/// Opens transports for connection attempts
pub trait Connector: 'static {
    /// Transport type produced
    type Transport: Transport + 'static;

    /// Connect to `endpoint`, giving up after `timeout`
    fn open(&mut self, endpoint: &Endpoint, timeout: Duration) -> io::Result<Self::Transport>;
}

/// Resolve and connect, trying each resolved address in turn
///
/// The connect itself blocks the event thread for at most `timeout` per
/// address; the returned stream is non-blocking.
pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let mut last_err = None;

    for addr in (host, port).to_socket_addrs()? {
        match std::net::TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                return Ok(stream);
            }
            Err(err) => {
                trace!(%addr, error = %err, "connect failed");
                last_err = Some(err);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
    }))
}

/// Plain TCP connector for `ws://` endpoints
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Transport = TcpTransport;

    fn open(&mut self, endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpTransport> {
        if endpoint.secure {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "wss:// endpoints need a TLS connector",
            ));
        }
        let stream = connect_tcp(&endpoint.host, endpoint.port, timeout)?;
        TcpTransport::from_std(stream)
    }
}

/// Non-blocking TCP stream registered with the tokio reactor
pub struct TcpTransport {
    stream: Option<Rc<tokio::net::TcpStream>>,
    // Reactor write readiness is unknown until the loop turns once
    writer: Option<std::net::TcpStream>,
    watcher: Option<AbortHandle>,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap a connected, non-blocking std stream
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr().ok();
        let writer = stream.try_clone()?;
        let stream = tokio::net::TcpStream::from_std(stream)?;
        debug!(peer = ?peer, "tcp connected");
        Ok(Self {
            stream: Some(Rc::new(stream)),
            writer: Some(writer),
            watcher: None,
            peer,
        })
    }

    /// Remote address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn stream(&self) -> io::Result<&Rc<tokio::net::TcpStream>> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.writer.as_mut() {
            Some(writer) => writer.write(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed")),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream()?.try_read(buf)? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
            n => Ok(n),
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        if nonblocking {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "reactor-registered streams are always non-blocking",
            ))
        }
    }

    fn on_readable(&mut self, mut callback: ReadableCallback) {
        self.stop_watcher();
        let Some(stream) = self.stream.clone() else {
            return;
        };

        let handle = tokio::task::spawn_local(async move {
            loop {
                let ready = stream.readable().await;
                callback();
                if ready.is_err() {
                    break;
                }
                // Let timers and other callbacks run between reads
                tokio::task::yield_now().await;
            }
        });
        self.watcher = Some(handle.abort_handle());
    }

    fn close(&mut self) {
        self.stop_watcher();
        self.writer = None;
        if self.stream.take().is_some() {
            debug!(peer = ?self.peer, "tcp closed");
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.stop_watcher();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_tcp_transport_roundtrip_and_eof() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();

                let mut transport = TcpConnector
                    .open(&endpoint, Duration::from_secs(1))
                    .unwrap();
                let (mut server, _) = listener.accept().await.unwrap();

                let readable = Rc::new(RefCell::new(0u32));
                let r = readable.clone();
                transport.on_readable(Box::new(move || *r.borrow_mut() += 1));

                let mut buf = [0u8; 16];
                let err = transport.receive(&mut buf).unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

                assert_eq!(transport.send(b"ping").unwrap(), 4);
                let mut got = [0u8; 4];
                server.read_exact(&mut got).await.unwrap();
                assert_eq!(&got, b"ping");

                server.write_all(b"pong").await.unwrap();
                while *readable.borrow() == 0 {
                    tokio::task::yield_now().await;
                }
                let mut n = 0;
                while n < 4 {
                    match transport.receive(&mut buf[n..]) {
                        Ok(read) => n += read,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            tokio::task::yield_now().await
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                assert_eq!(&buf[..4], b"pong");

                drop(server);
                let eof = loop {
                    match transport.receive(&mut buf) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            tokio::task::yield_now().await
                        }
                        other => break other,
                    }
                };
                assert_eq!(eof.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);

                transport.close();
                assert_eq!(
                    transport.send(b"x").unwrap_err().kind(),
                    io::ErrorKind::NotConnected
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_send_before_reactor_turn() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();

        // Upgrade requests go out right after open, with no await in between
        let mut transport = TcpConnector
            .open(&endpoint, Duration::from_secs(1))
            .unwrap();
        assert_eq!(transport.send(b"GET / HTTP/1.1\r\n").unwrap(), 16);

        let (mut server, _) = listener.accept().await.unwrap();
        let mut got = [0u8; 16];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_tcp_connector_rejects_wss() {
        let endpoint = Endpoint::parse("wss://example.com/").unwrap();
        let err = TcpConnector
            .open(&endpoint, Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
