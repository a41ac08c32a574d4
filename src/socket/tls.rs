//! TLS overlay for established sockets.

use crate::error::Error;
use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;

/// Peer certificate chain of an encrypted connection, end-entity first.
///
/// Shared between the socket and whoever asks for it through
/// [`Socket::certificate`](crate::Socket::certificate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    chain: Vec<CertificateDer<'static>>,
}

impl Certificate {
    pub fn new(chain: Vec<CertificateDer<'static>>) -> Self {
        Self { chain }
    }

    pub fn end_entity(&self) -> Option<&CertificateDer<'static>> {
        self.chain.first()
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

/// Whether the next TLS session on this socket should try session resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsSessionReuse {
    #[default]
    Try,
    Reused,
    Disabled,
}

/// Client-side rustls session driven over a non-blocking stream.
pub(crate) struct TlsSession {
    conn: ClientConnection,
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsSession {
    pub(crate) fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, Error> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;
        let conn =
            ClientConnection::new(config, name).map_err(|e| Error::TlsHandshake(e.to_string()))?;
        Ok(Self { conn })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub(crate) fn peer_certificate(&self) -> Option<Certificate> {
        let chain = self.conn.peer_certificates()?;
        Some(Certificate::new(
            chain.iter().map(|c| c.clone().into_owned()).collect(),
        ))
    }

    /// Reads decrypted bytes. `Ok(0)` means the peer sent close_notify.
    pub(crate) fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }

            match self.conn.read_tls(stream) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
                    self.flush(stream)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Buffers plaintext in the session and pushes as many records as the
    /// socket accepts.
    pub(crate) fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        self.flush(stream)?;
        Ok(n)
    }

    /// Writes pending TLS records until done or the socket would block.
    pub(crate) fn flush(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(stream) {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Queues close_notify and makes a best-effort attempt to send it.
    pub(crate) fn close_notify(&mut self, stream: &mut TcpStream) {
        self.conn.send_close_notify();
        // The connection is going away; a failed alert is not worth reporting.
        let _ = self.flush(stream);
    }
}
