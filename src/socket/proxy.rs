//! Proxy traversal state machine.
//!
//! A socket that connects or listens through a proxy starts in one of the
//! `*Connect` / `*Listen` states. Every readiness event is fed to
//! [`SocketInner::proxy_step`] while the socket lock is held. The step never
//! calls out of the socket: it returns a list of [`Followup`]s which the
//! caller runs after releasing the lock. Once the negotiation reaches
//! [`ProxyState::NoProxyOrConnected`] the machine is transparent and events go
//! straight to the regular handler.

use super::wire::{
    self, HttpReplyReader, HttpReplyStatus, ProxyCommand, Socks4Address, Socks4Reply,
    Socks5Address, Socks5Method, Socks5Reply,
};
use super::{Handle, SocketInner};
use crate::error::OsErrorCode;
use crate::event::{NetEvent, NetEventKind, SocketEvent};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{debug, info, trace};

/// Kind of proxy a socket traverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
    #[default]
    None,
    Socks4,
    Socks4A,
    Socks5,
    Http11,
}

/// Where a socket currently is in its proxy negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyState {
    #[default]
    NotOpened,
    NoProxyOrConnected,

    Socks4Connect,
    Socks4WaitForIp,
    Socks4WaitForCon,
    Socks4AConnect,
    Socks4AWaitForCon,
    Socks5Connect,
    Socks5WaitForMeth,
    Socks5WaitForLogin,
    Socks5WaitForCon,
    Http11Connect,
    Http11WaitForCon,
    ConnectFailed,

    Socks4Listen,
    Socks4WaitForListenRes,
    Socks4WaitForAccept,
    Socks4AListen,
    Socks4AWaitForListenRes,
    Socks4AWaitForAccept,
    Socks5Listen,
    Socks5ListenWaitForMeth,
    Socks5ListenWaitForLogin,
    Socks5WaitForListenRes,
    Socks5WaitForAccept,
    Http11Listen,
    ListenFailed,
}

impl ProxyState {
    pub(crate) fn connect_start(proxy: ProxyType) -> Option<Self> {
        match proxy {
            ProxyType::None => None,
            ProxyType::Socks4 => Some(Self::Socks4Connect),
            ProxyType::Socks4A => Some(Self::Socks4AConnect),
            ProxyType::Socks5 => Some(Self::Socks5Connect),
            ProxyType::Http11 => Some(Self::Http11Connect),
        }
    }

    pub(crate) fn listen_start(proxy: ProxyType) -> Option<Self> {
        match proxy {
            ProxyType::None => None,
            ProxyType::Socks4 => Some(Self::Socks4Listen),
            ProxyType::Socks4A => Some(Self::Socks4AListen),
            ProxyType::Socks5 => Some(Self::Socks5Listen),
            ProxyType::Http11 => Some(Self::Http11Listen),
        }
    }
}

/// Last proxy-level failure of a socket.
///
/// Variants carrying an `Option<OsErrorCode>` hold the transport error that
/// caused them; `None` means the proxy connection was lost without one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyError {
    #[default]
    None,
    GettingHostIp(Option<OsErrorCode>),
    SendingBytes(Option<OsErrorCode>),
    ReceivingBytes(Option<OsErrorCode>),
    UnexpectedReply,
    /// SOCKS reply code translated to text.
    ProxyServer(&'static str),
    NoAuthUnsupported,
    UserPassAuthUnsupported,
    UserPassAuthFailed,
    ConnectToProxy(Option<OsErrorCode>),
    ListenUnsupported,
    /// Status line of a refused HTTP CONNECT.
    HttpProxyServer(String),
}

/// Formatted proxy error, see [`Socket::proxy_error`](crate::Socket::proxy_error).
///
/// `format` has the host and port already filled in and contains a `%s`
/// marker where `detail` belongs. For one-line messages `format` is empty and
/// `detail` is the whole message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyErrorText {
    pub format: String,
    pub detail: String,
}

impl ProxyErrorText {
    pub fn render(&self) -> String {
        if self.format.is_empty() {
            self.detail.clone()
        } else {
            self.format.replacen("%s", &self.detail, 1)
        }
    }
}

/// How to reach a host: directly, or through a proxy server.
///
/// For [`ProxyType::None`] `server` is the host's own address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub proxy_type: ProxyType,
    pub server: SocketAddrV4,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyRoute {
    pub fn direct(server: SocketAddrV4) -> Self {
        Self::new(ProxyType::None, server)
    }

    pub fn new(proxy_type: ProxyType, server: SocketAddrV4) -> Self {
        Self {
            proxy_type,
            server,
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = Some(user.to_string());
        self.password = Some(password.to_string());
        self
    }
}

/// Destination and credentials of a proxied connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ProxyTarget {
    pub(crate) host: Option<String>,
    pub(crate) host_ip: Option<Ipv4Addr>,
    pub(crate) host_port: u16,
    pub(crate) user: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) proxy_ip: Option<Ipv4Addr>,
}

/// Work the caller performs once the socket lock is released.
#[derive(Debug)]
pub(crate) enum Followup {
    Notify(SocketEvent),
    /// Queue the event again through the dispatch thread.
    Repost {
        slot: usize,
        serial: usize,
        event: NetEvent,
    },
    /// Start a lookup whose result comes back as host UID 0.
    Resolve(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    Listen,
    Accept,
}

enum Received {
    Bytes(Vec<u8>),
    Nothing,
    Failed(Vec<Followup>),
}

// ============================================================================
// State Machine
// ============================================================================

impl SocketInner {
    pub(super) fn proxy_step(&mut self, event: NetEvent) -> Vec<Followup> {
        if event.kind == NetEventKind::Write {
            self.should_post_write = true;
        }

        let state = self.endpoint.state;
        trace!(uid = self.uid, ?state, ?event, "Proxy event");

        use ProxyState::*;
        match state {
            NotOpened | NoProxyOrConnected | ConnectFailed | ListenFailed => Vec::new(),

            Socks4Connect | Socks4AConnect | Socks5Connect | Http11Connect => {
                self.proxy_connected(state, event)
            }
            Socks4WaitForIp => self.waiting_for_ip(event),
            Socks4WaitForCon | Socks4AWaitForCon => self.socks4_reply(event, Phase::Connect),
            Socks5WaitForMeth => self.socks5_method(event, Phase::Connect),
            Socks5WaitForLogin => self.socks5_login(event, Phase::Connect),
            Socks5WaitForCon => self.socks5_reply(event, Phase::Connect),
            Http11WaitForCon => self.http_reply(event),

            Socks4Listen | Socks4AListen | Socks5Listen | Http11Listen => {
                self.proxy_connected_for_listen(state, event)
            }
            Socks5ListenWaitForMeth => self.socks5_method(event, Phase::Listen),
            Socks5ListenWaitForLogin => self.socks5_login(event, Phase::Listen),
            Socks4WaitForListenRes | Socks4AWaitForListenRes => {
                self.socks4_reply(event, Phase::Listen)
            }
            Socks5WaitForListenRes => self.socks5_reply(event, Phase::Listen),
            Socks4WaitForAccept | Socks4AWaitForAccept => self.socks4_reply(event, Phase::Accept),
            Socks5WaitForAccept => self.socks5_reply(event, Phase::Accept),
        }
    }

    /// Result of the lookup started from `Socks4WaitForIp`, or of a lookup
    /// the owner asked for.
    pub(super) fn host_resolved(
        &mut self,
        host_uid: u32,
        result: Result<Ipv4Addr, OsErrorCode>,
    ) -> Vec<Followup> {
        if self.endpoint.state != ProxyState::Socks4WaitForIp {
            return vec![Followup::Notify(SocketEvent::HostResolved { host_uid, result })];
        }

        match result {
            Ok(ip) => {
                debug!(uid = self.uid, %ip, "Proxy target resolved");
                self.endpoint.target.host_ip = Some(ip);
                self.set_state(ProxyState::Socks4WaitForCon);
                self.send_socks4(ProxyCommand::Connect, false, Phase::Connect)
            }
            Err(err) => self.fail(Phase::Connect, ProxyError::GettingHostIp(Some(err))),
        }
    }

    /// The lookup for `Socks4WaitForIp` could not be started.
    pub(super) fn resolve_failed(&mut self) -> Vec<Followup> {
        if self.endpoint.state != ProxyState::Socks4WaitForIp {
            return Vec::new();
        }
        self.fail(Phase::Connect, ProxyError::GettingHostIp(None))
    }

    fn set_state(&mut self, state: ProxyState) {
        debug!(uid = self.uid, from = ?self.endpoint.state, to = ?state, "Proxy state");
        self.endpoint.state = state;
    }

    fn fail(&mut self, phase: Phase, error: ProxyError) -> Vec<Followup> {
        debug!(uid = self.uid, ?phase, ?error, "Proxy negotiation failed");
        self.endpoint.proxy_error = error;
        match phase {
            Phase::Connect => {
                self.set_state(ProxyState::ConnectFailed);
                vec![Followup::Notify(SocketEvent::ConnectDone {
                    error: Some(OsErrorCode::PROXY_FAILURE),
                })]
            }
            Phase::Listen => {
                self.set_state(ProxyState::ListenFailed);
                vec![Followup::Notify(SocketEvent::ListenEstablished {
                    addr: None,
                    proxy_error: true,
                })]
            }
            Phase::Accept => {
                self.set_state(ProxyState::ListenFailed);
                vec![Followup::Notify(SocketEvent::AcceptDone {
                    success: false,
                    error: None,
                    proxy_error: true,
                })]
            }
        }
    }

    /// Switches to `NoProxyOrConnected` and re-posts the readiness that was
    /// consumed or swallowed during the negotiation.
    fn finish(&mut self, trigger: NetEvent, done: SocketEvent) -> Vec<Followup> {
        self.set_state(ProxyState::NoProxyOrConnected);

        let mut followups = Vec::new();
        if let Some(slot) = self.endpoint.slot {
            let serial = self.endpoint.handle_serial;
            let mut repost = |event| {
                followups.push(Followup::Repost {
                    slot,
                    serial,
                    event,
                })
            };
            if self.should_post_write {
                repost(NetEvent::new(NetEventKind::Write));
            }
            if self.has_pending_input() {
                repost(NetEvent::new(NetEventKind::Read));
            }
            if trigger.kind == NetEventKind::Close {
                repost(trigger);
            }
        }
        followups.push(Followup::Notify(done));
        followups
    }

    fn has_pending_input(&self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            &self.endpoint.handle,
            Some(Handle::Stream(stream)) if matches!(stream.peek(&mut byte), Ok(n) if n > 0)
        )
    }

    // ------------------------------------------------------------------------
    // Connection to the proxy server
    // ------------------------------------------------------------------------

    fn proxy_connected(&mut self, state: ProxyState, event: NetEvent) -> Vec<Followup> {
        if event.kind != NetEventKind::Connect {
            return Vec::new();
        }
        if let Some(error) = event.error {
            self.set_state(ProxyState::ConnectFailed);
            return vec![Followup::Notify(SocketEvent::ConnectDone { error: Some(error) })];
        }

        match state {
            ProxyState::Socks5Connect => {
                self.set_state(ProxyState::Socks5WaitForMeth);
                let request = wire::socks5_methods(self.endpoint.target.user.is_some());
                self.send_request(&request, Phase::Connect)
            }
            ProxyState::Socks4AConnect => {
                self.set_state(ProxyState::Socks4AWaitForCon);
                self.send_socks4(ProxyCommand::Connect, true, Phase::Connect)
            }
            ProxyState::Socks4Connect => {
                if self.endpoint.target.host_ip.is_some() {
                    self.set_state(ProxyState::Socks4WaitForCon);
                    self.send_socks4(ProxyCommand::Connect, false, Phase::Connect)
                } else {
                    self.set_state(ProxyState::Socks4WaitForIp);
                    let host = self.endpoint.target.host.clone().unwrap_or_default();
                    vec![Followup::Resolve(host)]
                }
            }
            ProxyState::Http11Connect => {
                self.set_state(ProxyState::Http11WaitForCon);
                self.http_reply = HttpReplyReader::new();
                let target = &self.endpoint.target;
                let request = wire::http_connect_request(
                    target.host.as_deref().unwrap_or_default(),
                    target.host_port,
                    target.user.as_deref(),
                    target.password.as_deref(),
                );
                self.send_request(&request, Phase::Connect)
            }
            _ => Vec::new(),
        }
    }

    fn proxy_connected_for_listen(&mut self, state: ProxyState, event: NetEvent) -> Vec<Followup> {
        if event.kind != NetEventKind::Connect {
            return Vec::new();
        }
        if state == ProxyState::Http11Listen {
            return self.fail(Phase::Listen, ProxyError::ListenUnsupported);
        }
        if let Some(error) = event.error {
            return self.fail(Phase::Listen, ProxyError::ConnectToProxy(Some(error)));
        }

        match state {
            ProxyState::Socks5Listen => {
                self.set_state(ProxyState::Socks5ListenWaitForMeth);
                let request = wire::socks5_methods(self.endpoint.target.user.is_some());
                self.send_request(&request, Phase::Listen)
            }
            ProxyState::Socks4AListen => {
                self.set_state(ProxyState::Socks4AWaitForListenRes);
                self.send_socks4(ProxyCommand::Bind, true, Phase::Listen)
            }
            ProxyState::Socks4Listen => {
                self.set_state(ProxyState::Socks4WaitForListenRes);
                self.send_socks4(ProxyCommand::Bind, false, Phase::Listen)
            }
            _ => Vec::new(),
        }
    }

    fn waiting_for_ip(&mut self, event: NetEvent) -> Vec<Followup> {
        if event.kind != NetEventKind::Close {
            return Vec::new();
        }
        self.set_state(ProxyState::ConnectFailed);
        vec![Followup::Notify(SocketEvent::ConnectDone {
            error: Some(event.error.unwrap_or(OsErrorCode::CONNECTION_ABORTED)),
        })]
    }

    // ------------------------------------------------------------------------
    // SOCKS4 / SOCKS4A
    // ------------------------------------------------------------------------

    fn send_socks4(&mut self, command: ProxyCommand, socks4a: bool, phase: Phase) -> Vec<Followup> {
        let target = &self.endpoint.target;
        let host = target.host.as_deref().unwrap_or_default();
        let addr = match target.host_ip {
            Some(ip) => Socks4Address::Ip(ip),
            None if socks4a => match host.parse::<Ipv4Addr>() {
                Ok(ip) => Socks4Address::Ip(ip),
                Err(_) => Socks4Address::Host(host),
            },
            None => Socks4Address::Ip(Ipv4Addr::BROADCAST),
        };
        let request = wire::socks4_request(command, target.host_port, addr, target.user.as_deref());
        self.send_request(&request, phase)
    }

    fn socks4_reply(&mut self, event: NetEvent, phase: Phase) -> Vec<Followup> {
        let reply = match self.receive_reply(event, wire::SOCKS4_REPLY_LEN, phase) {
            Received::Bytes(reply) => reply,
            Received::Nothing => return Vec::new(),
            Received::Failed(followups) => return followups,
        };

        match wire::parse_socks4_reply(&reply) {
            None => self.fail(phase, ProxyError::UnexpectedReply),
            Some(Socks4Reply::Rejected(_)) if phase == Phase::Accept => self.fail(
                phase,
                ProxyError::ProxyServer(wire::SOCKS4_INVALID_HOST_TEXT),
            ),
            Some(Socks4Reply::Rejected(code)) => {
                self.fail(phase, ProxyError::ProxyServer(wire::socks4_error_text(code)))
            }
            Some(Socks4Reply::Granted { ip, port }) => self.granted(event, phase, ip, port),
        }
    }

    // ------------------------------------------------------------------------
    // SOCKS5
    // ------------------------------------------------------------------------

    fn socks5_method(&mut self, event: NetEvent, phase: Phase) -> Vec<Followup> {
        let reply = match self.receive_reply(event, wire::SOCKS5_SHORT_REPLY_LEN, phase) {
            Received::Bytes(reply) => reply,
            Received::Nothing => return Vec::new(),
            Received::Failed(followups) => return followups,
        };

        let has_user = self.endpoint.target.user.is_some();
        let auth_error = if has_user {
            ProxyError::UserPassAuthUnsupported
        } else {
            ProxyError::NoAuthUnsupported
        };

        match wire::parse_socks5_method_reply(&reply) {
            Some(Socks5Method::Anonymous) => self.send_socks5_request(phase),
            Some(Socks5Method::UserPassword) if has_user => {
                self.set_state(match phase {
                    Phase::Connect => ProxyState::Socks5WaitForLogin,
                    _ => ProxyState::Socks5ListenWaitForLogin,
                });
                let target = &self.endpoint.target;
                let request = wire::socks5_login(
                    target.user.as_deref().unwrap_or_default(),
                    target.password.as_deref().unwrap_or_default(),
                );
                self.send_request(&request, phase)
            }
            None => self.fail(phase, ProxyError::UnexpectedReply),
            Some(_) if phase == Phase::Connect => self.fail(phase, auth_error),
            Some(Socks5Method::Other(0xFF)) => self.fail(phase, auth_error),
            Some(_) => self.fail(phase, ProxyError::UnexpectedReply),
        }
    }

    fn socks5_login(&mut self, event: NetEvent, phase: Phase) -> Vec<Followup> {
        let reply = match self.receive_reply(event, wire::SOCKS5_SHORT_REPLY_LEN, phase) {
            Received::Bytes(reply) => reply,
            Received::Nothing => return Vec::new(),
            Received::Failed(followups) => return followups,
        };

        match wire::parse_socks5_login_reply(&reply) {
            Some(true) => self.send_socks5_request(phase),
            Some(false) => self.fail(phase, ProxyError::UserPassAuthFailed),
            None => self.fail(phase, ProxyError::UnexpectedReply),
        }
    }

    fn send_socks5_request(&mut self, phase: Phase) -> Vec<Followup> {
        let (state, command) = match phase {
            Phase::Connect => (ProxyState::Socks5WaitForCon, ProxyCommand::Connect),
            _ => (ProxyState::Socks5WaitForListenRes, ProxyCommand::Bind),
        };
        self.set_state(state);

        let target = &self.endpoint.target;
        let host = target.host.as_deref().unwrap_or_default();
        let addr = match target.host_ip {
            Some(ip) => Socks5Address::Ip(ip),
            None => match host.parse::<Ipv4Addr>() {
                Ok(ip) => Socks5Address::Ip(ip),
                Err(_) => Socks5Address::Domain(host),
            },
        };
        let request = wire::socks5_request(command, addr, target.host_port);
        self.send_request(&request, phase)
    }

    fn socks5_reply(&mut self, event: NetEvent, phase: Phase) -> Vec<Followup> {
        let reply = match self.receive_reply(event, wire::SOCKS5_REPLY_LEN, phase) {
            Received::Bytes(reply) => reply,
            Received::Nothing => return Vec::new(),
            Received::Failed(followups) => return followups,
        };

        match wire::parse_socks5_reply(&reply) {
            None => self.fail(phase, ProxyError::UnexpectedReply),
            Some(Socks5Reply::Failed(code)) => {
                self.fail(phase, ProxyError::ProxyServer(wire::socks5_error_text(code)))
            }
            Some(Socks5Reply::Succeeded { ip, port }) => self.granted(event, phase, ip, port),
        }
    }

    fn granted(&mut self, event: NetEvent, phase: Phase, ip: Ipv4Addr, port: u16) -> Vec<Followup> {
        match phase {
            Phase::Connect => self.finish(event, SocketEvent::ConnectDone { error: None }),
            Phase::Accept => self.finish(
                event,
                SocketEvent::AcceptDone {
                    success: true,
                    error: None,
                    proxy_error: false,
                },
            ),
            Phase::Listen => {
                self.set_state(match self.endpoint.state {
                    ProxyState::Socks4AWaitForListenRes => ProxyState::Socks4AWaitForAccept,
                    ProxyState::Socks5WaitForListenRes => ProxyState::Socks5WaitForAccept,
                    _ => ProxyState::Socks4WaitForAccept,
                });
                let ip = if ip.is_unspecified() {
                    self.endpoint.target.proxy_ip.unwrap_or(ip)
                } else {
                    ip
                };
                let addr = SocketAddrV4::new(ip, port);
                info!(uid = self.uid, %addr, "Proxy server is listening");
                let mut followups = Vec::new();
                // The second reply may already sit behind the first one.
                if let (Some(slot), true) = (self.endpoint.slot, self.has_pending_input()) {
                    followups.push(Followup::Repost {
                        slot,
                        serial: self.endpoint.handle_serial,
                        event: NetEvent::new(NetEventKind::Read),
                    });
                }
                followups.push(Followup::Notify(SocketEvent::ListenEstablished {
                    addr: Some(addr),
                    proxy_error: false,
                }));
                followups
            }
        }
    }

    // ------------------------------------------------------------------------
    // HTTP/1.1 CONNECT
    // ------------------------------------------------------------------------

    fn http_reply(&mut self, event: NetEvent) -> Vec<Followup> {
        // Readiness is edge-triggered, so keep reading lines until the socket
        // runs dry or the reply is decided.
        loop {
            let line = match self.receive_line(event, wire::HTTP_REPLY_CHUNK) {
                Received::Bytes(line) => line,
                Received::Nothing => return Vec::new(),
                Received::Failed(followups) => return followups,
            };

            match self.http_reply.feed(&line) {
                HttpReplyStatus::Pending => continue,
                HttpReplyStatus::Connected => {
                    self.http_reply = HttpReplyReader::new();
                    return self.finish(event, SocketEvent::ConnectDone { error: None });
                }
                HttpReplyStatus::Refused => {
                    let status = self.http_reply.status_text();
                    return self.fail(Phase::Connect, ProxyError::HttpProxyServer(status));
                }
                HttpReplyStatus::Unexpected => {
                    return self.fail(Phase::Connect, ProxyError::UnexpectedReply)
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Raw I/O on the proxy connection
    // ------------------------------------------------------------------------

    /// Sends the whole request. A would-block is treated as a failure; the
    /// handshake messages are small enough to fit in an empty send buffer.
    fn send_request(&mut self, bytes: &[u8], phase: Phase) -> Vec<Followup> {
        let Some(Handle::Stream(stream)) = self.endpoint.handle.as_mut() else {
            return Vec::new();
        };

        let mut sent = 0;
        while sent < bytes.len() {
            match stream.write(&bytes[sent..]) {
                Ok(0) => {
                    let error = OsErrorCode::from_kind(ErrorKind::WriteZero);
                    return self.fail(phase, ProxyError::SendingBytes(Some(error)));
                }
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    return self.fail(phase, ProxyError::SendingBytes(Some(err.into())));
                }
            }
        }
        trace!(uid = self.uid, len = bytes.len(), "Proxy request sent");
        Vec::new()
    }

    fn receive_failure(&mut self, event: NetEvent, phase: Phase) -> Option<Vec<Followup>> {
        if !matches!(event.kind, NetEventKind::Read | NetEventKind::Close) {
            return Some(Vec::new());
        }
        event
            .error
            .map(|error| self.fail(phase, ProxyError::ReceivingBytes(Some(error))))
    }

    /// Reads at most `max` bytes of a fixed-size reply.
    fn receive_reply(&mut self, event: NetEvent, max: usize, phase: Phase) -> Received {
        if let Some(followups) = self.receive_failure(event, phase) {
            return Received::Failed(followups);
        }
        let Some(Handle::Stream(stream)) = self.endpoint.handle.as_mut() else {
            return Received::Nothing;
        };

        let mut buf = vec![0u8; max];
        match stream.read(&mut buf) {
            Ok(0) if event.kind == NetEventKind::Close => {
                Received::Failed(self.fail(phase, ProxyError::ReceivingBytes(None)))
            }
            Ok(0) => Received::Nothing,
            Ok(n) => {
                buf.truncate(n);
                Received::Bytes(buf)
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Received::Nothing,
            Err(err) => Received::Failed(self.fail(phase, ProxyError::ReceivingBytes(Some(err.into())))),
        }
    }

    /// Reads one byte at a time up to and including LF, at most `max` bytes.
    fn receive_line(&mut self, event: NetEvent, max: usize) -> Received {
        let phase = Phase::Connect;
        if let Some(followups) = self.receive_failure(event, phase) {
            return Received::Failed(followups);
        }
        let Some(Handle::Stream(stream)) = self.endpoint.handle.as_mut() else {
            return Received::Nothing;
        };

        let mut line = Vec::with_capacity(max);
        let mut byte = [0u8; 1];
        let mut failure = None;
        while line.len() < max {
            match stream.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    failure = Some(OsErrorCode::from(err));
                    break;
                }
            }
        }

        match failure {
            Some(error) => Received::Failed(self.fail(phase, ProxyError::ReceivingBytes(Some(error)))),
            None if !line.is_empty() => Received::Bytes(line),
            None if event.kind == NetEventKind::Close => {
                Received::Failed(self.fail(phase, ProxyError::ReceivingBytes(None)))
            }
            None => Received::Nothing,
        }
    }
}

// ============================================================================
// Error Texts
// ============================================================================

impl SocketInner {
    pub(super) fn proxy_error_text(&self, one_line: bool) -> Option<ProxyErrorText> {
        let target = &self.endpoint.target;
        let host = target.host.as_deref().unwrap_or_default();
        let port = target.host_port;

        let os_detail = |code: &Option<OsErrorCode>, lost: bool| match code {
            Some(code) => code.text().trim_end().to_string(),
            None if lost => "connection lost".to_string(),
            None => "unknown error".to_string(),
        };

        let (template, detail) = match &self.endpoint.proxy_error {
            ProxyError::None => return None,
            ProxyError::GettingHostIp(code) => (
                format!("unable to get IP address of {host}: %s"),
                os_detail(code, false),
            ),
            ProxyError::UnexpectedReply => (
                format!("unexpected reply from proxy server while connecting to {host}"),
                String::new(),
            ),
            ProxyError::SendingBytes(code) => (
                "error sending request to proxy server: %s".to_string(),
                os_detail(code, false),
            ),
            ProxyError::ReceivingBytes(code) => (
                "error receiving reply from proxy server: %s".to_string(),
                os_detail(code, true),
            ),
            ProxyError::ConnectToProxy(code) => (
                "unable to connect to proxy server: %s".to_string(),
                os_detail(code, false),
            ),
            ProxyError::NoAuthUnsupported => (
                "proxy server requires authentication".to_string(),
                String::new(),
            ),
            ProxyError::UserPassAuthUnsupported => (
                "proxy server does not support user/password authentication".to_string(),
                String::new(),
            ),
            ProxyError::UserPassAuthFailed => (
                "proxy server rejected user name or password".to_string(),
                String::new(),
            ),
            ProxyError::ListenUnsupported => (
                "proxy server does not support listen command".to_string(),
                String::new(),
            ),
            ProxyError::ProxyServer(reason) => (
                format!("unable to open connection to {host}:{port}: %s"),
                reason.to_string(),
            ),
            ProxyError::HttpProxyServer(status) => (
                format!("unable to open connection to {host}:{port}: %s"),
                status.clone(),
            ),
        };

        let text = ProxyErrorText {
            format: template,
            detail,
        };
        Some(if one_line {
            ProxyErrorText {
                format: String::new(),
                detail: text.render(),
            }
        } else {
            text
        })
    }

    pub(super) fn proxy_timeout_description(&self) -> Option<&'static str> {
        use ProxyState::*;
        match self.endpoint.state {
            Socks4Connect | Socks4AConnect | Socks5Connect | Http11Connect | Socks4Listen
            | Socks4AListen | Socks5Listen | Http11Listen | Socks5WaitForMeth
            | Socks5WaitForLogin | Socks5ListenWaitForMeth | Socks5ListenWaitForLogin => {
                Some("timeout opening connection to proxy server")
            }
            Socks4WaitForIp => Some("timeout getting IP"),
            _ => None,
        }
    }
}
