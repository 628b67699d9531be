//! TLS transport for `wss://` endpoints
//!
//! A rustls client session layered over the non-blocking [`TcpTransport`].
//! Trust anchors come from a caller-supplied PEM bundle; plain `ws://`
//! endpoints pass straight through to TCP so one connector serves both.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handshake::Endpoint;
use crate::transport::{Connector, ReadableCallback, TcpTransport, Transport, connect_tcp};

/// Connector for `wss://` (and `ws://`) endpoints
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Use an existing rustls client configuration
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// Trust the CA certificates in a PEM bundle
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(pem) {
            let cert = cert.map_err(|e| Error::Tls(format!("invalid PEM: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("rejected CA certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::Tls("no certificates in PEM bundle".into()));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self::new(Arc::new(config)))
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish_non_exhaustive()
    }
}

impl Connector for TlsConnector {
    type Transport = TlsTransport;

    fn open(&mut self, endpoint: &Endpoint, timeout: Duration) -> io::Result<TlsTransport> {
        let tcp = TcpTransport::from_std(connect_tcp(&endpoint.host, endpoint.port, timeout)?)?;
        if !endpoint.secure {
            return Ok(TlsTransport { tcp, session: None });
        }

        let name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let session = ClientConnection::new(self.config.clone(), name)
            .map_err(io::Error::other)?;
        debug!(host = %endpoint.host, "tls session started");

        let mut transport = TlsTransport {
            tcp,
            session: Some(session),
        };
        // ClientHello
        transport.flush_tls()?;
        Ok(transport)
    }
}

/// Non-blocking reads and writes for rustls over the TCP transport
struct TryIo<'a>(&'a mut TcpTransport);

impl Read for TryIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.receive(buf)
    }
}

impl Write for TryIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// TCP stream with an optional TLS session on top
pub struct TlsTransport {
    tcp: TcpTransport,
    session: Option<ClientConnection>,
}

impl TlsTransport {
    /// Write out as much queued ciphertext as the socket takes
    fn flush_tls(&mut self) -> io::Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        while session.wants_write() {
            match session.write_tls(&mut TryIo(&mut self.tcp)) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Whether the TLS handshake is still running
    pub fn is_handshaking(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_handshaking())
    }
}

impl fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsTransport")
            .field("tcp", &self.tcp)
            .field("tls", &self.session.is_some())
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "tls session closed by peer")
}

impl Transport for TlsTransport {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return self.tcp.send(data);
        };
        // Plaintext written before the handshake completes is buffered by rustls
        let n = session.writer().write(data)?;
        self.flush_tls()?;
        Ok(n)
    }

    fn receive(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(session) = self.session.as_mut() else {
            return self.tcp.receive(buf);
        };

        match session.reader().read(buf) {
            Ok(0) if !buf.is_empty() => return Err(closed()),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        if session.read_tls(&mut TryIo(&mut self.tcp))? == 0 {
            return Err(closed());
        }
        session
            .process_new_packets()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.flush_tls()?;

        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        match session.reader().read(buf) {
            Ok(0) if !buf.is_empty() => Err(closed()),
            Ok(n) => Ok(n),
            // Only handshake or alert records so far
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.tcp.set_nonblocking(nonblocking)
    }

    fn on_readable(&mut self, callback: ReadableCallback) {
        self.tcp.on_readable(callback);
    }

    fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.send_close_notify();
            if let Err(e) = self.flush_tls() {
                warn!(error = %e, "failed to send close_notify");
            }
        }
        self.session = None;
        self.tcp.close();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::{ServerConfig, ServerConnection, StreamOwned};

    use super::*;

    /// Self-signed certificate for `localhost` and a server config using it
    fn localhost_server() -> (String, ServerConfig) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        (cert.pem(), config)
    }

    #[tokio::test]
    async fn test_wss_loopback() {
        let (pem, server_config) = localhost_server();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let session = ServerConnection::new(Arc::new(server_config)).unwrap();
            let mut tls = StreamOwned::new(session, tcp);

            let mut got = [0u8; 5];
            tls.read_exact(&mut got).unwrap();
            assert_eq!(&got, b"hello");
            tls.write_all(b"world").unwrap();
            tls.conn.send_close_notify();
            tls.flush().unwrap();
        });

        let mut connector = TlsConnector::from_pem(pem.as_bytes()).unwrap();
        let endpoint = Endpoint::parse(&format!("wss://localhost:{port}/")).unwrap();
        let mut transport = connector.open(&endpoint, Duration::from_secs(5)).unwrap();
        assert!(transport.is_handshaking());

        // Buffered by the session until the handshake completes
        assert_eq!(transport.send(b"hello").unwrap(), 5);

        let mut received = Vec::new();
        let mut handshake_only = false;
        let mut buf = [0u8; 64];
        let mut result = None;
        for _ in 0..2000 {
            match transport.receive(&mut buf) {
                Ok(0) => handshake_only = true,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    assert!(!transport.is_handshaking());
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    result = Some(e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(handshake_only);
        assert_eq!(received, b"world");
        let err = result.expect("close_notify never arrived");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        server.join().unwrap();

        transport.close();
        assert!(format!("{transport:?}").contains("tls: false"));
    }

    #[tokio::test]
    async fn test_plain_endpoint_skips_tls() {
        let (pem, _) = localhost_server();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut connector = TlsConnector::from_pem(pem.as_bytes()).unwrap();
        let endpoint = Endpoint::parse(&format!("ws://127.0.0.1:{port}/")).unwrap();
        let mut transport = connector.open(&endpoint, Duration::from_secs(1)).unwrap();
        assert!(!transport.is_handshaking());
        assert_eq!(transport.send(b"plain").unwrap(), 5);

        let (mut server, _) = listener.accept().await.unwrap();
        let mut got = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut got).await.unwrap();
        assert_eq!(&got, b"plain");
    }

    #[test]
    fn test_from_pem_rejects_empty_bundle() {
        let err = TlsConnector::from_pem(b"").unwrap_err();
        assert!(matches!(err, Error::Tls(_)));
    }

    #[test]
    fn test_from_pem_rejects_garbage() {
        let pem = b"-----BEGIN CERTIFICATE-----\nnot base64!!\n-----END CERTIFICATE-----\n";
        assert!(TlsConnector::from_pem(pem).is_err());
    }
}
