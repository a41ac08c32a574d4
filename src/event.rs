//! Events delivered to socket owners.
//!
//! Every socket carries a [`SocketEventSink`] supplied by its owner when the
//! socket is created. The dispatch thread calls the sink for connect, accept,
//! listen and close completions, readiness, DNS results, timers and posted
//! messages. Callbacks always run on the dispatch thread, one at a time, with
//! no engine or socket lock held, so a sink may call back into any socket or
//! engine operation.

use crate::error::OsErrorCode;
use crate::socket::Socket;
use std::any::Any;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

/// Opaque payload attached to timers and posted messages.
pub type Param = Box<dyn Any + Send>;

/// A notification for the owner of a socket.
#[derive(Debug)]
pub enum SocketEvent {
    /// An outgoing connection finished, directly or through a proxy.
    ///
    /// `error` is `None` on success. A failed proxy negotiation reports
    /// [`OsErrorCode::PROXY_FAILURE`]; see
    /// [`Socket::proxy_error`](crate::Socket::proxy_error) for details.
    ConnectDone { error: Option<OsErrorCode> },

    /// A listening socket accepted its connection. The socket now carries the
    /// accepted connection in place of the listener.
    AcceptDone {
        success: bool,
        error: Option<OsErrorCode>,
        proxy_error: bool,
    },

    /// The endpoint where the peer should connect is known (or the proxy
    /// failed to provide one).
    ListenEstablished {
        addr: Option<SocketAddrV4>,
        proxy_error: bool,
    },

    /// Bytes can be read with [`Socket::recv`](crate::Socket::recv).
    Readable,

    /// Bytes can be written with [`Socket::send`](crate::Socket::send).
    Writable,

    /// The socket was closed, gracefully when `error` is `None`.
    Closed { error: Option<OsErrorCode> },

    /// Result of [`Socket::get_host_by_address`](crate::Socket::get_host_by_address).
    HostResolved {
        host_uid: u32,
        result: Result<Ipv4Addr, OsErrorCode>,
    },

    /// A timer registered with
    /// [`SocketEngine::add_timer`](crate::SocketEngine::add_timer) fired.
    Timer { id: u32, param: Option<Param> },

    /// A message posted with
    /// [`SocketEngine::post_socket_message`](crate::SocketEngine::post_socket_message).
    Message { id: u32, param: Option<Param> },
}

/// Receiver of [`SocketEvent`]s, implemented by the protocol layer that owns
/// a socket.
pub trait SocketEventSink: Send + Sync {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent);
}

impl<F> SocketEventSink for F
where
    F: Fn(&Arc<Socket>, SocketEvent) + Send + Sync,
{
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        self(socket, event)
    }
}

/// Sink forwarding `(socket uid, event)` pairs into an mpsc channel.
///
/// Useful when the owner wants to consume events on its own thread instead
/// of reacting inside the callback.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Mutex<Sender<(u64, SocketEvent)>>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, Receiver<(u64, SocketEvent)>) {
        let (sender, receiver) = channel();
        (
            Arc::new(Self {
                sender: Mutex::new(sender),
            }),
            receiver,
        )
    }
}

impl SocketEventSink for ChannelSink {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // The receiver may be gone during shutdown; nothing left to notify.
        let _ = sender.send((socket.uid(), event));
    }
}

// ============================================================================
// Internal Readiness Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NetEventKind {
    Connect,
    Accept,
    Read,
    Write,
    Close,
}

/// Readiness notification as seen by a socket, modelled on the
/// connect/accept/read/write/close event set with an attached error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NetEvent {
    pub(crate) kind: NetEventKind,
    pub(crate) error: Option<OsErrorCode>,
}

impl NetEvent {
    pub(crate) fn new(kind: NetEventKind) -> Self {
        Self { kind, error: None }
    }

    pub(crate) fn with_error(kind: NetEventKind, error: Option<OsErrorCode>) -> Self {
        Self { kind, error }
    }
}
