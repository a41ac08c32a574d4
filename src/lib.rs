//! sockengine - a single-threaded socket dispatch engine
//!
//! One dispatch thread multiplexes many non-blocking TCP sockets with mio and
//! turns readiness into ordered callbacks on a per-socket
//! [`SocketEventSink`]. Sockets can connect and listen directly or through
//! SOCKS4, SOCKS4A, SOCKS5 and HTTP/1.1 CONNECT proxies. The engine also
//! owns per-socket timers, posted messages and background host lookups.
//!
//! Configuration comes from the `config` crate, see [`EngineConfig`] for the
//! recognised keys.

pub(crate) mod config;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod event;
pub(crate) mod socket;
pub(crate) mod supervisor;
pub(crate) mod tls_config;

// These are the intended public API
pub use crate::config::{EngineConfig, MAX_SOCKETS};
pub use engine::{SocketEngine, SocketsLock};
pub use error::{Error, OsErrorCode};
pub use event::{ChannelSink, Param, SocketEvent, SocketEventSink};
pub use socket::{
    Certificate, ListenMode, ProxyError, ProxyErrorText, ProxyRoute, ProxyState, ProxyType,
    Socket, SocketRef, SocketUid, TlsSessionReuse,
};
pub use supervisor::{ThreadKey, ThreadQueue};
pub use tls_config::load_tls_client_config;

/// Proxy request builders and reply parsers.
pub mod wire {
    pub use crate::socket::wire::*;
}

/// Timer registry used by the dispatch thread.
pub mod timers {
    pub use crate::engine::timers::*;
}

/// Blocking IPv4 lookup as performed by the resolver threads.
pub use engine::resolver::resolve_ipv4;

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::timers::Tick;
    pub use crate::engine::SocketEngine;
    pub use crate::error::{Error, OsErrorCode};
    pub use crate::event::{ChannelSink, SocketEvent, SocketEventSink};
    pub use crate::socket::{ListenMode, ProxyRoute, ProxyState, ProxyType, Socket, SocketRef};
}
