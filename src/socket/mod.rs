//! Non-blocking sockets driven by the dispatch thread.
//!
//! A [`Socket`] is created by [`SocketEngine::create_socket`] with the sink
//! that receives its events. Operations may be called from any thread; the
//! resulting connect/accept/close/readiness notifications arrive on the
//! dispatch thread.
//!
//! Operations that touch the socket table take the engine lock first and the
//! socket lock second. Operations must not be called while holding a
//! [`SocketsLock`](crate::SocketsLock) on the same thread.
//!
//! [`SocketEngine::create_socket`]: crate::SocketEngine::create_socket

mod proxy;
mod tls;
pub mod wire;

pub use proxy::{ProxyError, ProxyErrorText, ProxyRoute, ProxyState, ProxyType};
pub use tls::{Certificate, TlsSessionReuse};

use crate::config::EngineConfig;
use crate::engine::{resolver, token_for, EngineState, Request, Shared};
use crate::error::{Error, OsErrorCode};
use crate::event::{NetEvent, NetEventKind, SocketEvent, SocketEventSink};
use proxy::{Followup, ProxyTarget};
use tls::TlsSession;
use wire::HttpReplyReader;

use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use rustls::ClientConfig;
use socket2::{Domain, Protocol, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Unique ID of a socket, never reused within an engine.
pub type SocketUid = u64;

/// Weak reference to a socket: the table slot it was registered under plus
/// its unique ID. A stale slot is resolved by searching the table for the ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketRef {
    pub slot: Option<usize>,
    pub uid: SocketUid,
}

/// How [`Socket::open_for_listening_with_proxy`] was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// A local listener was opened. Listen errors are the caller's to handle.
    Direct(SocketAddrV4),
    /// The proxy negotiation started; the endpoint arrives with
    /// [`SocketEvent::ListenEstablished`].
    Proxy,
}

#[derive(Debug)]
pub(crate) enum Handle {
    Stream(TcpStream),
    Listener(TcpListener),
}

/// Readiness flags of one poll event.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) error: bool,
    pub(crate) read_closed: bool,
}

/// Fields that travel with the connection when two sockets are swapped.
#[derive(Debug, Default)]
struct Endpoint {
    slot: Option<usize>,
    handle: Option<Handle>,
    handle_serial: usize,
    connect_pending: bool,
    tls: Option<TlsSession>,
    tls_reuse: TlsSessionReuse,
    tls_reuse_failed: bool,
    certificate: Option<Arc<Certificate>>,
    our_shutdown: bool,
    state: ProxyState,
    target: ProxyTarget,
    proxy_error: ProxyError,
}

impl Endpoint {
    fn stream(&mut self) -> Option<&mut TcpStream> {
        match self.handle.as_mut() {
            Some(Handle::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    fn capture_certificate(&mut self) {
        if self.certificate.is_some() {
            return;
        }
        if let Some(tls) = self.tls.as_ref().filter(|tls| !tls.is_handshaking()) {
            self.certificate = tls.peer_certificate().map(Arc::new);
        }
    }

    /// Reads and discards whatever is still buffered; returns the byte count.
    fn drain_input(&mut self) -> usize {
        let Some(Handle::Stream(stream)) = self.handle.as_mut() else {
            return 0;
        };
        let mut buf = [0u8; 500];
        let mut total = 0;
        loop {
            let read = match self.tls.as_mut() {
                Some(tls) => tls.read(stream, &mut buf),
                None => stream.read(&mut buf),
            };
            match read {
                Ok(0) | Err(_) => return total,
                Ok(n) => total += n,
            }
        }
    }
}

pub(crate) struct SocketInner {
    uid: SocketUid,
    endpoint: Endpoint,
    is_data_connection: bool,
    should_post_write: bool,
    http_reply: HttpReplyReader,
    last_connected_query: Option<Instant>,
}

/// One non-blocking TCP endpoint with optional proxy traversal and TLS.
pub struct Socket {
    uid: SocketUid,
    engine: Weak<Shared>,
    sink: Arc<dyn SocketEventSink>,
    inner: Mutex<SocketInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Constructors and Accessors
// ============================================================================

impl Socket {
    pub(crate) fn new(
        uid: SocketUid,
        engine: Weak<Shared>,
        sink: Arc<dyn SocketEventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            engine,
            sink,
            inner: Mutex::new(SocketInner {
                uid,
                endpoint: Endpoint::default(),
                is_data_connection: false,
                should_post_write: false,
                http_reply: HttpReplyReader::new(),
                last_connected_query: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SocketInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shared(&self) -> Result<Arc<Shared>, Error> {
        self.engine.upgrade().ok_or(Error::EngineTerminated)
    }

    pub fn uid(&self) -> SocketUid {
        self.uid
    }

    /// Slot in the socket table, `None` while not registered.
    pub fn msg_index(&self) -> Option<usize> {
        self.lock().endpoint.slot
    }

    pub fn socket_ref(&self) -> SocketRef {
        SocketRef {
            slot: self.msg_index(),
            uid: self.uid,
        }
    }

    /// Whether an OS handle is open.
    pub fn is_connected(&self) -> bool {
        self.lock().endpoint.handle.is_some()
    }

    pub fn proxy_state(&self) -> ProxyState {
        self.lock().endpoint.state
    }

    pub fn host(&self) -> Option<String> {
        self.lock().endpoint.target.host.clone()
    }

    pub fn host_port(&self) -> u16 {
        self.lock().endpoint.target.host_port
    }

    pub fn host_ip(&self) -> Option<Ipv4Addr> {
        self.lock().endpoint.target.host_ip
    }

    pub fn proxy_user(&self) -> Option<String> {
        self.lock().endpoint.target.user.clone()
    }

    /// Local IPv4 address of the connection. Fails when bound to ANY.
    pub fn local_ip(&self) -> Result<Ipv4Addr, Error> {
        let inner = self.lock();
        let addr = match inner.endpoint.handle.as_ref() {
            Some(Handle::Stream(stream)) => stream.local_addr()?,
            Some(Handle::Listener(listener)) => listener.local_addr()?,
            None => return Err(Error::NotOpen { uid: self.uid }),
        };
        match addr {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
            _ => Err(io::Error::from(ErrorKind::AddrNotAvailable).into()),
        }
    }

    /// Marks the socket as a bulk data connection; its buffers are raised to
    /// the configured minimum when the OS socket is created.
    pub fn set_data_connection(&self, data: bool) {
        self.lock().is_data_connection = data;
    }

    pub fn is_data_connection(&self) -> bool {
        self.lock().is_data_connection
    }

    /// When [`SocketEngine::is_socket_connected`](crate::SocketEngine::is_socket_connected)
    /// last asked about this socket.
    pub fn last_connected_query(&self) -> Option<Instant> {
        self.lock().last_connected_query
    }

    pub(crate) fn stamp_connected_query(&self) -> bool {
        let mut inner = self.lock();
        inner.last_connected_query = Some(Instant::now());
        inner.endpoint.handle.is_some()
    }

    pub fn certificate(&self) -> Option<Arc<Certificate>> {
        self.lock().endpoint.certificate.clone()
    }

    pub fn set_certificate(&self, certificate: Option<Arc<Certificate>>) {
        self.lock().endpoint.certificate = certificate;
    }

    pub fn is_encrypted(&self) -> bool {
        self.lock().endpoint.tls.is_some()
    }

    pub fn tls_session_reuse(&self) -> TlsSessionReuse {
        self.lock().endpoint.tls_reuse
    }

    pub fn set_tls_session_reuse(&self, reuse: TlsSessionReuse) {
        self.lock().endpoint.tls_reuse = reuse;
    }

    pub fn tls_session_reuse_failed(&self) -> bool {
        self.lock().endpoint.tls_reuse_failed
    }

    pub fn set_tls_session_reuse_failed(&self, failed: bool) {
        self.lock().endpoint.tls_reuse_failed = failed;
    }

    pub fn proxy_error_code(&self) -> ProxyError {
        self.lock().endpoint.proxy_error.clone()
    }

    /// Describes the last proxy failure, `None` if there was none.
    pub fn proxy_error(&self, one_line: bool) -> Option<ProxyErrorText> {
        self.lock().proxy_error_text(one_line)
    }

    /// What a timeout in the current proxy state means, if anything.
    pub fn proxy_timeout_description(&self) -> Option<&'static str> {
        self.lock().proxy_timeout_description()
    }
}

// ============================================================================
// Connection Lifecycle
// ============================================================================

impl Socket {
    /// Starts a non-blocking connect. Completion is reported with
    /// [`SocketEvent::ConnectDone`].
    #[instrument(skip(self), fields(uid = self.uid))]
    pub fn connect(self: &Arc<Self>, addr: SocketAddrV4) -> Result<(), Error> {
        self.begin_connect(addr, ProxyState::NoProxyOrConnected, None)
    }

    /// Connects to `host:port`, through the proxy described by `route`.
    ///
    /// `host_ip` is the already known address of `host`; SOCKS4 resolves the
    /// host locally when it is missing.
    #[instrument(skip(self, route), fields(uid = self.uid, proxy = ?route.proxy_type))]
    pub fn connect_with_proxy(
        self: &Arc<Self>,
        route: &ProxyRoute,
        host: &str,
        port: u16,
        host_ip: Option<Ipv4Addr>,
    ) -> Result<(), Error> {
        let Some(start) = ProxyState::connect_start(route.proxy_type) else {
            let target = ProxyTarget {
                host: Some(host.to_string()),
                host_ip,
                host_port: port,
                ..ProxyTarget::default()
            };
            return self.begin_connect(route.server, ProxyState::NoProxyOrConnected, Some(target));
        };

        let target = proxy_target(route, host, port, host_ip, None)?;
        self.begin_connect(route.server, start, Some(target))
    }

    /// Opens a local listener on `port` (0 for ephemeral) and returns the
    /// endpoint peers should connect to.
    #[instrument(skip(self), fields(uid = self.uid))]
    pub fn open_for_listening(
        self: &Arc<Self>,
        listen_ip: Ipv4Addr,
        port: u16,
    ) -> Result<SocketAddrV4, Error> {
        let shared = self.shared()?;
        let mut state = shared.lock_state();
        let mut inner = self.lock();
        self.check_not_open(&inner)?;

        let added = self.register_slot(&mut state, &mut inner)?;
        inner.endpoint.state = ProxyState::NoProxyOrConnected;
        inner.endpoint.proxy_error = ProxyError::None;

        match open_listener(&shared, &mut inner, listen_ip, port) {
            Ok(addr) => {
                info!(uid = self.uid, %addr, "Listening for connections");
                Ok(addr)
            }
            Err(err) => {
                debug!(uid = self.uid, %err, "Failed to open listener");
                inner.endpoint.state = ProxyState::NotOpened;
                if added {
                    unregister_slot(&mut state, &mut inner);
                }
                Err(err)
            }
        }
    }

    /// Waits for one incoming connection from `host`, either on a local
    /// listener or through a proxy BIND request.
    ///
    /// The endpoint is always reported with
    /// [`SocketEvent::ListenEstablished`]; the accepted connection with
    /// [`SocketEvent::AcceptDone`].
    #[instrument(skip(self, route), fields(uid = self.uid, proxy = ?route.proxy_type))]
    pub fn open_for_listening_with_proxy(
        self: &Arc<Self>,
        listen_on: SocketAddrV4,
        host: &str,
        host_ip: Option<Ipv4Addr>,
        host_port: u16,
        route: &ProxyRoute,
    ) -> Result<ListenMode, Error> {
        let Some(start) = ProxyState::listen_start(route.proxy_type) else {
            let was_registered = self.msg_index().is_some();
            let addr = self.open_for_listening(*listen_on.ip(), listen_on.port())?;
            let target = self.socket_ref();
            let posted = self.shared().and_then(|shared| {
                shared.post(Request::Event {
                    target,
                    event: SocketEvent::ListenEstablished {
                        addr: Some(addr),
                        proxy_error: false,
                    },
                })
            });
            if let Err(err) = posted {
                debug!(uid = self.uid, %err, "Unable to report listening endpoint");
                // Undo what open_for_listening did
                let _ = self.close_socket();
                if !was_registered {
                    self.rollback_registration();
                }
                return Err(err);
            }
            return Ok(ListenMode::Direct(addr));
        };

        let target = proxy_target(route, host, host_port, host_ip, Some(*route.server.ip()))?;
        self.begin_connect(route.server, start, Some(target))?;
        Ok(ListenMode::Proxy)
    }

    /// Half-closes the send direction, after TLS close_notify if encrypted.
    #[instrument(skip(self), fields(uid = self.uid))]
    pub fn shutdown(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        let stream = match endpoint.handle.as_mut() {
            Some(Handle::Stream(stream)) => stream,
            Some(Handle::Listener(_)) => return Err(io::Error::from(ErrorKind::NotConnected).into()),
            None => {
                info!(uid = self.uid, "Shutdown of a socket that is not open");
                return Err(Error::NotOpen { uid: self.uid });
            }
        };
        if let Some(tls) = endpoint.tls.as_mut() {
            tls.close_notify(stream);
        }
        stream.shutdown(Shutdown::Write)?;
        endpoint.our_shutdown = true;
        debug!(uid = self.uid, "Send direction shut down");
        Ok(())
    }

    /// Closes the OS handle and TLS session and resets the proxy state.
    #[instrument(skip(self), fields(uid = self.uid))]
    pub fn close_socket(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        let Some(mut handle) = endpoint.handle.take() else {
            info!(uid = self.uid, "Close of a socket that is not open");
            return Err(Error::NotOpen { uid: self.uid });
        };

        let tls = endpoint.tls.take();
        if let (Handle::Stream(stream), Some(mut tls)) = (&mut handle, tls) {
            tls.close_notify(stream);
        }
        if let Some(shared) = self.engine.upgrade() {
            let deregistered = match &mut handle {
                Handle::Stream(stream) => shared.registry.deregister(stream),
                Handle::Listener(listener) => shared.registry.deregister(listener),
            };
            if let Err(err) = deregistered {
                debug!(uid = self.uid, %err, "Failed to deregister handle");
            }
        }
        drop(handle);

        endpoint.state = ProxyState::NotOpened;
        endpoint.connect_pending = false;
        endpoint.our_shutdown = false;
        endpoint.tls_reuse = TlsSessionReuse::Try;
        endpoint.tls_reuse_failed = false;
        debug!(uid = self.uid, "Socket closed");
        Ok(())
    }

    /// Resolves `address` to an IPv4 address. The result arrives as
    /// [`SocketEvent::HostResolved`] tagged with `host_uid`.
    ///
    /// Literal addresses are answered without starting a lookup thread, but
    /// still through the dispatch thread.
    #[instrument(skip(self), fields(uid = self.uid))]
    pub fn get_host_by_address(self: &Arc<Self>, address: &str, host_uid: u32) -> Result<(), Error> {
        let shared = self.shared()?;
        let (target, added) = {
            let mut state = shared.lock_state();
            let mut inner = self.lock();
            let added = self.register_slot(&mut state, &mut inner)?;
            let target = SocketRef {
                slot: inner.endpoint.slot,
                uid: self.uid,
            };
            (target, added)
        };

        let started = match address.parse::<Ipv4Addr>() {
            Ok(ip) => {
                trace!(uid = self.uid, %ip, host_uid, "Literal address, no lookup needed");
                shared.post(Request::HostResolved {
                    target,
                    host_uid,
                    result: Ok(ip),
                })
            }
            Err(_) => resolver::spawn_lookup(&shared, target, address.to_string(), host_uid),
        };

        if let Err(err) = started {
            error!(uid = self.uid, %err, "Unable to start host lookup");
            if added {
                self.rollback_registration();
            }
            return Err(err);
        }
        Ok(())
    }

    /// Removes the socket from the table after an operation that registered
    /// it failed.
    fn rollback_registration(&self) {
        if let Some(shared) = self.engine.upgrade() {
            let mut state = shared.lock_state();
            unregister_slot(&mut state, &mut self.lock());
        }
    }

    /// Installs a rustls client session on an established connection.
    ///
    /// `server_name` defaults to the host given to
    /// [`connect_with_proxy`](Self::connect_with_proxy); `config` defaults to
    /// the engine's `tls_ca_cert` configuration.
    #[instrument(skip(self, config), fields(uid = self.uid))]
    pub fn encrypt_socket(
        &self,
        server_name: Option<&str>,
        config: Option<Arc<ClientConfig>>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        if endpoint.state != ProxyState::NoProxyOrConnected || endpoint.stream().is_none() {
            return Err(Error::NotOpen { uid: self.uid });
        }
        if endpoint.tls.is_some() {
            return Err(Error::TlsHandshake("socket is already encrypted".to_string()));
        }

        let config = match config {
            Some(config) => config,
            None => self
                .shared()?
                .config
                .tls_client_config
                .clone()
                .ok_or(Error::TlsClientConfigMissing)?,
        };
        let name = server_name
            .map(str::to_string)
            .or_else(|| endpoint.target.host.clone())
            .ok_or_else(|| Error::TlsInvalidServerName(String::new()))?;

        let mut session = TlsSession::new(config, &name)?;
        if let Some(stream) = endpoint.stream() {
            session.flush(stream)?;
        }
        endpoint.tls = Some(session);
        endpoint.certificate = None;
        debug!(uid = self.uid, server_name = %name, "TLS session started");
        Ok(())
    }

    /// Reads available bytes, decrypting when a TLS session is installed.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        let Some(Handle::Stream(stream)) = endpoint.handle.as_mut() else {
            return Err(ErrorKind::NotConnected.into());
        };
        let result = match endpoint.tls.as_mut() {
            Some(tls) => tls.read(stream, buf),
            None => stream.read(buf),
        };
        endpoint.capture_certificate();
        result
    }

    /// Writes as much of `buf` as the socket accepts.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        let Some(Handle::Stream(stream)) = endpoint.handle.as_mut() else {
            return Err(ErrorKind::NotConnected.into());
        };
        let result = match endpoint.tls.as_mut() {
            Some(tls) => tls.write(stream, buf),
            None => stream.write(buf),
        };
        endpoint.capture_certificate();
        result
    }

    fn check_not_open(&self, inner: &SocketInner) -> Result<(), Error> {
        if inner.endpoint.state != ProxyState::NotOpened || inner.endpoint.handle.is_some() {
            error!(uid = self.uid, state = ?inner.endpoint.state, "Socket is already open");
            return Err(Error::AlreadyOpen { uid: self.uid });
        }
        Ok(())
    }

    fn begin_connect(
        self: &Arc<Self>,
        addr: SocketAddrV4,
        start: ProxyState,
        target: Option<ProxyTarget>,
    ) -> Result<(), Error> {
        let shared = self.shared()?;
        let mut state = shared.lock_state();
        let mut inner = self.lock();
        self.check_not_open(&inner)?;

        let previous = target.map(|target| std::mem::replace(&mut inner.endpoint.target, target));
        inner.endpoint.state = start;
        inner.endpoint.proxy_error = ProxyError::None;
        inner.should_post_write = false;

        let result = self
            .register_slot(&mut state, &mut inner)
            .and_then(|added| match open_stream(&shared, &mut inner, addr) {
                Ok(()) => Ok(()),
                Err(err) => {
                    if added {
                        unregister_slot(&mut state, &mut inner);
                    }
                    Err(err)
                }
            });

        match result {
            Ok(()) => {
                debug!(uid = self.uid, %addr, ?start, "Connecting");
                Ok(())
            }
            Err(err) => {
                debug!(uid = self.uid, %addr, %err, "Connect failed");
                inner.endpoint.state = ProxyState::NotOpened;
                if let Some(previous) = previous {
                    inner.endpoint.target = previous;
                }
                Err(err)
            }
        }
    }

    fn register_slot(
        self: &Arc<Self>,
        state: &mut EngineState,
        inner: &mut SocketInner,
    ) -> Result<bool, Error> {
        if inner.endpoint.slot.is_some() {
            return Ok(false);
        }
        let slot = state.table.insert(Arc::clone(self))?;
        inner.endpoint.slot = Some(slot);
        debug!(uid = self.uid, slot, "Socket registered");
        Ok(true)
    }
}

pub(crate) fn unregister_slot(state: &mut EngineState, inner: &mut SocketInner) {
    if let Some(slot) = inner.endpoint.slot.take() {
        state.table.remove(slot, inner.uid);
        debug!(uid = inner.uid, slot, "Socket detached");
    }
}

/// Exchanges the connections of two sockets. Unique IDs and the per-object
/// settings stay where they are.
pub(crate) fn swap_endpoints(a: &Socket, b: &Socket) {
    if a.uid == b.uid {
        return;
    }
    let (first, second) = if a.uid < b.uid { (a, b) } else { (b, a) };
    let mut first = first.lock();
    let mut second = second.lock();
    std::mem::swap(&mut first.endpoint, &mut second.endpoint);
}

pub(crate) fn detach(socket: &Socket, state: &mut EngineState) -> Result<(), Error> {
    let mut inner = socket.lock();
    if inner.endpoint.slot.is_none() {
        error!(uid = socket.uid, "Detaching a socket that is not registered");
        return Err(Error::NotRegistered { uid: socket.uid });
    }
    unregister_slot(state, &mut inner);
    Ok(())
}

fn proxy_target(
    route: &ProxyRoute,
    host: &str,
    port: u16,
    host_ip: Option<Ipv4Addr>,
    proxy_ip: Option<Ipv4Addr>,
) -> Result<ProxyTarget, Error> {
    if host.is_empty() {
        error!("Proxy target host is empty");
        return Err(Error::InvalidHost(host.to_string()));
    }
    Ok(ProxyTarget {
        host: Some(host.to_string()),
        host_ip,
        host_port: port,
        user: route.user.clone(),
        password: route.password.clone(),
        proxy_ip,
    })
}

// ============================================================================
// OS Socket Setup
// ============================================================================

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == ErrorKind::WouldBlock
}

fn tune_buffers(socket: &socket2::Socket, config: &EngineConfig, uid: SocketUid) {
    match socket.send_buffer_size() {
        Ok(size) if size < config.data_sndbuf_size => {
            if let Err(err) = socket.set_send_buffer_size(config.data_sndbuf_size) {
                warn!(uid, %err, "Unable to raise send buffer size");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(uid, %err, "Unable to read send buffer size"),
    }
    match socket.recv_buffer_size() {
        Ok(size) if size < config.data_rcvbuf_size => {
            if let Err(err) = socket.set_recv_buffer_size(config.data_rcvbuf_size) {
                warn!(uid, %err, "Unable to raise receive buffer size");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(uid, %err, "Unable to read receive buffer size"),
    }
}

fn new_os_socket(shared: &Shared, inner: &SocketInner) -> Result<socket2::Socket, Error> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    if inner.is_data_connection {
        tune_buffers(&socket, &shared.config, inner.uid);
    }
    Ok(socket)
}

fn open_stream(shared: &Shared, inner: &mut SocketInner, addr: SocketAddrV4) -> Result<(), Error> {
    let slot = inner
        .endpoint
        .slot
        .ok_or(Error::NotRegistered { uid: inner.uid })?;

    let socket = new_os_socket(shared, inner)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&SocketAddr::V4(addr).into()) {
        Ok(()) => trace!(uid = inner.uid, %addr, "Connected immediately"),
        Err(err) if connect_in_progress(&err) => {}
        Err(err) => return Err(err.into()),
    }

    let mut stream = TcpStream::from_std(socket.into());
    let serial = shared.next_serial();
    shared.registry.register(
        &mut stream,
        token_for(slot, serial),
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let endpoint = &mut inner.endpoint;
    endpoint.handle = Some(Handle::Stream(stream));
    endpoint.handle_serial = serial;
    endpoint.connect_pending = true;
    endpoint.our_shutdown = false;
    Ok(())
}

fn open_listener(
    shared: &Shared,
    inner: &mut SocketInner,
    listen_ip: Ipv4Addr,
    port: u16,
) -> Result<SocketAddrV4, Error> {
    let slot = inner
        .endpoint
        .slot
        .ok_or(Error::NotRegistered { uid: inner.uid })?;

    let socket = new_os_socket(shared, inner)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.listen(shared.config.listen_backlog)?;
    socket.set_nonblocking(true)?;
    let bound = socket.local_addr()?.as_socket_ipv4();

    let mut listener = TcpListener::from_std(socket.into());
    let serial = shared.next_serial();
    shared
        .registry
        .register(&mut listener, token_for(slot, serial), Interest::READABLE)?;

    let endpoint = &mut inner.endpoint;
    endpoint.handle = Some(Handle::Listener(listener));
    endpoint.handle_serial = serial;
    endpoint.connect_pending = false;
    endpoint.our_shutdown = false;

    Ok(match bound {
        Some(addr) if !addr.ip().is_unspecified() => addr,
        Some(addr) => SocketAddrV4::new(listen_ip, addr.port()),
        None => SocketAddrV4::new(listen_ip, port),
    })
}

// ============================================================================
// Event Handling (dispatch thread)
// ============================================================================

impl Socket {
    pub(crate) fn notify(self: &Arc<Self>, event: SocketEvent) {
        trace!(uid = self.uid, ?event, "Delivering event");
        self.sink.on_event(self, event);
    }

    /// Translates poll readiness on the handle with `serial` into events.
    pub(crate) fn readiness_events(&self, serial: usize, readiness: Readiness) -> Vec<NetEvent> {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        let mut events = Vec::new();
        if endpoint.handle_serial != serial {
            trace!(uid = self.uid, serial, "Readiness for a replaced handle");
            return events;
        }

        match endpoint.handle.as_mut() {
            None => {}
            Some(Handle::Listener(listener)) => {
                if readiness.error {
                    let error = listener.take_error().ok().flatten().map(OsErrorCode::from);
                    events.push(NetEvent::with_error(NetEventKind::Accept, error));
                } else if readiness.readable {
                    events.push(NetEvent::new(NetEventKind::Accept));
                }
            }
            Some(Handle::Stream(stream)) => {
                if endpoint.connect_pending {
                    if !(readiness.writable || readiness.error || readiness.read_closed) {
                        return events;
                    }
                    let error = match stream.take_error() {
                        Ok(Some(err)) | Err(err) => Some(err),
                        Ok(None) => match stream.peer_addr() {
                            Ok(_) => None,
                            Err(err)
                                if err.kind() == ErrorKind::NotConnected
                                    && !(readiness.error || readiness.read_closed) =>
                            {
                                return events;
                            }
                            Err(err) => Some(err),
                        },
                    };
                    endpoint.connect_pending = false;
                    let failed = error.is_some();
                    events.push(NetEvent::with_error(
                        NetEventKind::Connect,
                        error.map(OsErrorCode::from),
                    ));
                    if failed {
                        return events;
                    }
                }

                if readiness.readable {
                    events.push(NetEvent::new(NetEventKind::Read));
                }
                if readiness.writable {
                    events.push(NetEvent::new(NetEventKind::Write));
                }
                if readiness.error {
                    let error = stream.take_error().ok().flatten().map(OsErrorCode::from);
                    events.push(NetEvent::with_error(NetEventKind::Close, error));
                } else if readiness.read_closed {
                    events.push(NetEvent::new(NetEventKind::Close));
                }
            }
        }
        events
    }

    /// Entry point for readiness and re-posted events. Events for a handle
    /// other than `serial` are dropped.
    pub(crate) fn deliver_net_event(self: &Arc<Self>, serial: usize, event: NetEvent) {
        let mut inner = self.lock();
        if inner.endpoint.handle.is_none() || inner.endpoint.handle_serial != serial {
            trace!(uid = self.uid, serial, ?event, "Event for a closed or replaced handle");
            return;
        }
        if inner.endpoint.state == ProxyState::NoProxyOrConnected {
            drop(inner);
            self.handle_event(event);
            return;
        }
        let followups = inner.proxy_step(event);
        drop(inner);
        self.run_followups(followups);
    }

    pub(crate) fn deliver_host_resolved(
        self: &Arc<Self>,
        host_uid: u32,
        result: Result<Ipv4Addr, OsErrorCode>,
    ) {
        let followups = self.lock().host_resolved(host_uid, result);
        self.run_followups(followups);
    }

    fn run_followups(self: &Arc<Self>, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::Notify(event) => self.notify(event),
                Followup::Repost {
                    slot,
                    serial,
                    event,
                } => {
                    let posted = self.shared().and_then(|shared| {
                        shared.post(Request::Net {
                            slot,
                            serial,
                            event,
                        })
                    });
                    if let Err(err) = posted {
                        warn!(uid = self.uid, ?event, %err, "Unable to re-post event");
                    }
                }
                Followup::Resolve(host) => {
                    if let Err(err) = self.get_host_by_address(&host, 0) {
                        debug!(uid = self.uid, %host, %err, "Proxy target lookup failed to start");
                        let followups = self.lock().resolve_failed();
                        self.run_followups(followups);
                    }
                }
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: NetEvent) {
        match event.kind {
            NetEventKind::Connect => self.notify(SocketEvent::ConnectDone { error: event.error }),
            NetEventKind::Accept => self.accept_connection(event.error),
            NetEventKind::Read => self.notify(SocketEvent::Readable),
            NetEventKind::Write => {
                self.flush_tls();
                self.notify(SocketEvent::Writable);
            }
            NetEventKind::Close => self.connection_closed(event.error),
        }
    }

    fn flush_tls(&self) {
        let mut inner = self.lock();
        let endpoint = &mut inner.endpoint;
        if let (Some(Handle::Stream(stream)), Some(tls)) =
            (endpoint.handle.as_mut(), endpoint.tls.as_mut())
        {
            if let Err(err) = tls.flush(stream) {
                debug!(uid = self.uid, %err, "Failed to flush TLS records");
            }
        }
    }

    fn connection_closed(self: &Arc<Self>, error: Option<OsErrorCode>) {
        let mut error = error;
        if error.is_none() {
            let our_shutdown = {
                let mut inner = self.lock();
                let discarded = inner.endpoint.drain_input();
                if discarded > 0 {
                    warn!(uid = self.uid, bytes = discarded, "Unread data discarded on close");
                }
                inner.endpoint.our_shutdown
            };
            if !our_shutdown {
                if let Err(err) = self.shutdown() {
                    error = os_error_code(&err);
                }
            }
        }
        if let Err(err) = self.close_socket() {
            error = error.or(os_error_code(&err));
        }
        self.notify(SocketEvent::Closed { error });
    }

    fn accept_connection(self: &Arc<Self>, error: Option<OsErrorCode>) {
        if error.is_some() {
            self.notify(SocketEvent::AcceptDone {
                success: false,
                error,
                proxy_error: false,
            });
            return;
        }

        let event = {
            let mut inner = self.lock();
            let endpoint = &mut inner.endpoint;
            let (Some(slot), Some(Handle::Listener(listener))) =
                (endpoint.slot, endpoint.handle.as_ref())
            else {
                return;
            };

            match listener.accept() {
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => SocketEvent::AcceptDone {
                    success: false,
                    error: Some(err.into()),
                    proxy_error: false,
                },
                Ok((mut stream, peer)) => {
                    let Ok(shared) = self.shared() else {
                        return;
                    };
                    let serial = shared.next_serial();
                    let interest = Interest::READABLE | Interest::WRITABLE;
                    match shared
                        .registry
                        .register(&mut stream, token_for(slot, serial), interest)
                    {
                        Err(err) => SocketEvent::AcceptDone {
                            success: false,
                            error: Some(err.into()),
                            proxy_error: false,
                        },
                        Ok(()) => {
                            if let Some(Handle::Listener(mut listener)) = endpoint.handle.take() {
                                if let Err(err) = shared.registry.deregister(&mut listener) {
                                    debug!(uid = self.uid, %err, "Failed to deregister listener");
                                }
                            }
                            endpoint.handle = Some(Handle::Stream(stream));
                            endpoint.handle_serial = serial;
                            endpoint.connect_pending = false;
                            endpoint.our_shutdown = false;
                            info!(uid = self.uid, %peer, "Connection accepted");
                            SocketEvent::AcceptDone {
                                success: true,
                                error: None,
                                proxy_error: false,
                            }
                        }
                    }
                }
            }
        };
        self.notify(event);
    }
}

fn os_error_code(err: &Error) -> Option<OsErrorCode> {
    match err {
        Error::Io(err) => Some(OsErrorCode::from(err)),
        _ => None,
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.endpoint.handle.is_some() {
            error!(uid = self.uid, "Socket dropped while its handle is still open");
        }
    }
}
