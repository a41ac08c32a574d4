use std::fmt;
use std::io;
use thiserror::Error;

/// The error type for sockengine operations.
///
/// Returned by the public operations on [`Socket`](crate::Socket) and
/// [`SocketEngine`](crate::SocketEngine). Failures that happen later on the
/// dispatch thread (a refused connect, a proxy rejecting the request) are not
/// errors of this type; they are reported through
/// [`SocketEvent`](crate::SocketEvent)s carrying an [`OsErrorCode`].
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The host string is empty or otherwise unusable.
    #[error("Invalid host address '{0}'")]
    InvalidHost(String),

    // ============================================================================
    // Socket Contract Errors
    // ============================================================================

    /// The socket already has an OS handle or is in the middle of a proxy
    /// negotiation.
    #[error("Socket {uid} is already open")]
    AlreadyOpen {
        /// Unique ID of the socket.
        uid: u64,
    },

    /// The socket has no OS handle.
    #[error("Socket {uid} is not open")]
    NotOpen {
        /// Unique ID of the socket.
        uid: u64,
    },

    /// The socket is not registered in the socket table.
    #[error("Socket {uid} is not registered")]
    NotRegistered {
        /// Unique ID of the socket.
        uid: u64,
    },

    // ============================================================================
    // Engine Errors
    // ============================================================================

    /// Every slot of the socket table is in use.
    #[error("Socket table is full ({max} sockets)")]
    TableFull {
        /// Configured table limit.
        max: usize,
    },

    /// The dispatch thread has stopped accepting work.
    #[error("Socket engine is terminated")]
    EngineTerminated,

    /// A worker thread could not be started.
    #[error("Failed to start thread '{0}'")]
    ThreadSpawn(String),

    /// Growing an internal queue or table failed.
    #[error("Out of memory while growing {0}")]
    OutOfMemory(&'static str),

    // ============================================================================
    // TLS Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad { path: String, source: io::Error },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// TLS session setup or handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Attempted to encrypt a socket but no client configuration is known.
    #[error("TLS client configuration not provided - required for encrypt_socket()")]
    TlsClientConfigMissing,
}

// ============================================================================
// OS Error Codes
// ============================================================================

/// Transport error code carried inside socket events.
///
/// Unlike [`std::io::Error`] this is `Copy`, so the same code can be stored in
/// the socket, handed to a callback and compared in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsErrorCode {
    raw: Option<i32>,
    kind: io::ErrorKind,
    origin: Origin,
}

/// Codes made up by the engine rather than reported by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Os,
    ProxyFailure,
    HostNotFound,
}

impl OsErrorCode {
    /// Fabricated non-success code reported with `ConnectDone` when the proxy
    /// negotiation failed. The details are available from
    /// [`Socket::proxy_error`](crate::Socket::proxy_error).
    pub const PROXY_FAILURE: OsErrorCode = OsErrorCode {
        raw: None,
        kind: io::ErrorKind::Other,
        origin: Origin::ProxyFailure,
    };

    /// Reported when the proxy connection closes while waiting for DNS.
    pub const CONNECTION_ABORTED: OsErrorCode = OsErrorCode {
        raw: None,
        kind: io::ErrorKind::ConnectionAborted,
        origin: Origin::Os,
    };

    /// The resolver could not find the host name.
    pub const HOST_NOT_FOUND: OsErrorCode = OsErrorCode {
        raw: None,
        kind: io::ErrorKind::NotFound,
        origin: Origin::HostNotFound,
    };

    pub fn from_kind(kind: io::ErrorKind) -> Self {
        Self {
            raw: None,
            kind,
            origin: Origin::Os,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Human readable description, as the OS reports it when the raw code is
    /// known.
    pub fn text(&self) -> String {
        match (self.origin, self.raw) {
            (Origin::ProxyFailure, _) => "proxy negotiation failed".to_string(),
            (Origin::HostNotFound, _) => "host not found".to_string(),
            (Origin::Os, Some(code)) => io::Error::from_raw_os_error(code).to_string(),
            (Origin::Os, None) => io::Error::from(self.kind).to_string(),
        }
    }
}

impl From<&io::Error> for OsErrorCode {
    fn from(err: &io::Error) -> Self {
        Self {
            raw: err.raw_os_error(),
            kind: err.kind(),
            origin: Origin::Os,
        }
    }
}

impl From<io::Error> for OsErrorCode {
    fn from(err: io::Error) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for OsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}
