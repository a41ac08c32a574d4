//! Proxy wire formats: request builders and reply parsers for SOCKS4, SOCKS4A,
//! SOCKS5 and HTTP/1.1 CONNECT.
//!
//! Parsers return `None` when a reply deviates from the fixed format
//! (length, version byte, address type). The proxy state machine turns that
//! into an "unexpected reply" failure.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::net::Ipv4Addr;

/// Length of every SOCKS4 reply.
pub const SOCKS4_REPLY_LEN: usize = 8;
/// Length of a SOCKS5 reply carrying an IPv4 address.
pub const SOCKS5_REPLY_LEN: usize = 10;
/// Length of the SOCKS5 method selection and login replies.
pub const SOCKS5_SHORT_REPLY_LEN: usize = 2;
/// Per-step read limit for the HTTP CONNECT reply.
pub const HTTP_REPLY_CHUNK: usize = 200;

const SOCKS4_GRANTED: u8 = 90;
const SOCKS4_BASE_LIMIT: usize = 300;
const HOST_MAX_SIZE: usize = 256;
const SOCKS5_AUTH_NONE: u8 = 0;
const SOCKS5_AUTH_USER_PASS: u8 = 2;
const SOCKS5_ATYP_IPV4: u8 = 1;
const SOCKS5_ATYP_DOMAIN: u8 = 3;

/// SOCKS request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Connect,
    /// Ask the proxy to listen for one incoming connection.
    Bind,
}

impl ProxyCommand {
    fn code(self) -> u8 {
        match self {
            ProxyCommand::Connect => 1,
            ProxyCommand::Bind => 2,
        }
    }
}

/// Destination of a SOCKS4/4A request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Address<'a> {
    Ip(Ipv4Addr),
    /// SOCKS4A only: the proxy resolves the name.
    Host(&'a str),
}

/// Destination of a SOCKS5 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Address<'a> {
    Ip(Ipv4Addr),
    Domain(&'a str),
}

// ============================================================================
// SOCKS4 / SOCKS4A
// ============================================================================

pub fn socks4_request(
    command: ProxyCommand,
    port: u16,
    addr: Socks4Address<'_>,
    user: Option<&str>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SOCKS4_BASE_LIMIT);
    buf.push(4);
    buf.push(command.code());
    buf.extend_from_slice(&port.to_be_bytes());
    match addr {
        Socks4Address::Ip(ip) => buf.extend_from_slice(&ip.octets()),
        // 0.0.0.x with non-zero x marks a SOCKS4A request
        Socks4Address::Host(_) => buf.extend_from_slice(&[0, 0, 0, 1]),
    }
    if let Some(user) = user {
        if buf.len() + user.len() + 1 <= SOCKS4_BASE_LIMIT {
            buf.extend_from_slice(user.as_bytes());
        }
    }
    buf.push(0);
    if let Socks4Address::Host(host) = addr {
        if buf.len() + host.len() + 1 <= SOCKS4_BASE_LIMIT + HOST_MAX_SIZE {
            buf.extend_from_slice(host.as_bytes());
        }
        buf.push(0);
    }
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Reply {
    Granted { ip: Ipv4Addr, port: u16 },
    Rejected(u8),
}

pub fn parse_socks4_reply(buf: &[u8]) -> Option<Socks4Reply> {
    if buf.len() != SOCKS4_REPLY_LEN || buf[0] != 0 {
        return None;
    }
    if buf[1] != SOCKS4_GRANTED {
        return Some(Socks4Reply::Rejected(buf[1]));
    }
    Some(Socks4Reply::Granted {
        port: u16::from_be_bytes([buf[2], buf[3]]),
        ip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
    })
}

pub fn socks4_error_text(code: u8) -> &'static str {
    match code {
        92 => "request rejected because SOCKS server cannot connect to identd on the client",
        93 => "request rejected because the client program and identd report different user-ids",
        _ => "request rejected or failed",
    }
}

/// Reason reported when a SOCKS4 proxy refuses the incoming connection of a
/// BIND request.
pub const SOCKS4_INVALID_HOST_TEXT: &str = "connection from an invalid host";

// ============================================================================
// SOCKS5
// ============================================================================

pub fn socks5_methods(with_login: bool) -> Vec<u8> {
    if with_login {
        vec![5, 2, SOCKS5_AUTH_USER_PASS, SOCKS5_AUTH_NONE]
    } else {
        vec![5, 1, SOCKS5_AUTH_NONE]
    }
}

/// Method chosen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Method {
    Anonymous,
    UserPassword,
    Other(u8),
}

/// The first reply byte (version) is not checked; some servers send junk there.
pub fn parse_socks5_method_reply(buf: &[u8]) -> Option<Socks5Method> {
    if buf.len() != SOCKS5_SHORT_REPLY_LEN {
        return None;
    }
    Some(match buf[1] {
        SOCKS5_AUTH_NONE => Socks5Method::Anonymous,
        SOCKS5_AUTH_USER_PASS => Socks5Method::UserPassword,
        other => Socks5Method::Other(other),
    })
}

pub fn socks5_login(user: &str, password: &str) -> Vec<u8> {
    let user = truncate_255(user.as_bytes());
    let password = truncate_255(password.as_bytes());
    let mut buf = Vec::with_capacity(3 + user.len() + password.len());
    buf.push(1);
    buf.push(user.len() as u8);
    buf.extend_from_slice(user);
    buf.push(password.len() as u8);
    buf.extend_from_slice(password);
    buf
}

/// Returns whether the server accepted the credentials.
pub fn parse_socks5_login_reply(buf: &[u8]) -> Option<bool> {
    if buf.len() != SOCKS5_SHORT_REPLY_LEN {
        return None;
    }
    Some(buf[1] == 0)
}

pub fn socks5_request(command: ProxyCommand, addr: Socks5Address<'_>, port: u16) -> Vec<u8> {
    let mut buf = vec![5, command.code(), 0];
    match addr {
        Socks5Address::Ip(ip) => {
            buf.push(SOCKS5_ATYP_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Socks5Address::Domain(name) => {
            let name = truncate_255(name.as_bytes());
            buf.push(SOCKS5_ATYP_DOMAIN);
            buf.push(name.len() as u8);
            buf.extend_from_slice(name);
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Reply {
    Succeeded { ip: Ipv4Addr, port: u16 },
    Failed(u8),
}

/// Only IPv4 bound addresses are accepted.
pub fn parse_socks5_reply(buf: &[u8]) -> Option<Socks5Reply> {
    if buf.len() != SOCKS5_REPLY_LEN || buf[0] != 5 || buf[3] != SOCKS5_ATYP_IPV4 {
        return None;
    }
    if buf[1] != 0 {
        return Some(Socks5Reply::Failed(buf[1]));
    }
    Some(Socks5Reply::Succeeded {
        ip: Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]),
        port: u16::from_be_bytes([buf[8], buf[9]]),
    })
}

pub fn socks5_error_text(code: u8) -> &'static str {
    match code {
        2 => "connection not allowed by ruleset",
        3 => "network unreachable",
        4 => "host unreachable",
        5 => "connection refused",
        6 => "TTL expired",
        7 => "command not supported",
        8 => "address type not supported",
        _ => "general SOCKS server failure",
    }
}

fn truncate_255(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(255)]
}

// ============================================================================
// HTTP/1.1 CONNECT
// ============================================================================

/// Builds the CONNECT request. Credentials are sent when either half is
/// configured; the missing half is empty.
pub fn http_connect_request(
    host: &str,
    port: u16,
    user: Option<&str>,
    password: Option<&str>,
) -> Vec<u8> {
    let tail = if user.is_some() || password.is_some() {
        let login = STANDARD.encode(format!(
            "{}:{}",
            user.unwrap_or_default(),
            password.unwrap_or_default()
        ));
        format!("Authorization: Basic {login}\r\nProxy-Authorization: Basic {login}\r\n\r\n")
    } else {
        "\r\n".to_string()
    };
    format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n{tail}").into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpReplyStatus {
    /// Need more bytes.
    Pending,
    /// 2xx status line and the terminating blank line were received.
    Connected,
    /// Non-2xx status line.
    Refused,
    /// The first line is not an HTTP status line.
    Unexpected,
}

/// Incremental reader of the CONNECT reply.
///
/// It is fed chunks that end at LF (or at [`HTTP_REPLY_CHUNK`] bytes). It keeps
/// the first line and counts how many characters of the `\r\n\r\n` terminator
/// have been seen in a row.
#[derive(Debug, Clone, Default)]
pub struct HttpReplyReader {
    first_line: Vec<u8>,
    terminator_chars: usize,
}

impl HttpReplyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> HttpReplyStatus {
        if chunk.is_empty() {
            return HttpReplyStatus::Pending;
        }

        const TERMINATOR: &[u8] = b"\r\n\r\n";
        if self.terminator_chars > 0 && self.terminator_chars != TERMINATOR.len() {
            let start = self.terminator_chars;
            for (&expected, &got) in TERMINATOR[start..].iter().zip(chunk) {
                if expected == got {
                    self.terminator_chars += 1;
                    if self.terminator_chars == TERMINATOR.len() {
                        break;
                    }
                } else {
                    self.terminator_chars = 0;
                    break;
                }
            }
        }
        if self.terminator_chars == 0 {
            let n = chunk.len();
            if chunk[n - 1] == b'\r' {
                self.terminator_chars = 1;
            }
            if n > 1 && chunk[n - 2] == b'\r' && chunk[n - 1] == b'\n' {
                self.terminator_chars = 2;
            }
        }

        if !self.first_line_complete() {
            self.first_line.extend_from_slice(chunk);
        }
        if !self.first_line_complete() {
            return HttpReplyStatus::Pending;
        }

        if self.first_line.len() < 5 || !self.first_line[..5].eq_ignore_ascii_case(b"HTTP/") {
            return HttpReplyStatus::Unexpected;
        }
        match status_start(&self.first_line[5..]).first() {
            None => HttpReplyStatus::Unexpected,
            Some(b'2') if self.terminator_chars == TERMINATOR.len() => HttpReplyStatus::Connected,
            Some(b'2') => HttpReplyStatus::Pending,
            Some(_) => HttpReplyStatus::Refused,
        }
    }

    fn first_line_complete(&self) -> bool {
        self.first_line.last() == Some(&b'\n')
    }

    /// Status code and reason of the first line, without the line ending.
    pub fn status_text(&self) -> String {
        let mut text = status_start(&self.first_line);
        if let Some(rest) = text.strip_suffix(b"\n") {
            text = rest;
        }
        if let Some(rest) = text.strip_suffix(b"\r") {
            text = rest;
        }
        let text = &text[..text.len().min(299)];
        String::from_utf8_lossy(text).into_owned()
    }
}

/// Skips the leading token and the whitespace after it.
fn status_start(line: &[u8]) -> &[u8] {
    let token_end = line.iter().position(|&b| b <= b' ').unwrap_or(line.len());
    let rest = &line[token_end..];
    let ws_end = rest.iter().position(|&b| b > b' ').unwrap_or(rest.len());
    &rest[ws_end..]
}
