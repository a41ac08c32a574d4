//! Proxy traversal tests against scripted proxy servers on loopback.
//!
//! Each fake proxy accepts one connection, checks what the socket sends and
//! answers with canned replies.


use sockengine::prelude::*;
use sockengine::wire::{self, ProxyCommand, Socks5Address};
use sockengine::ProxyError;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::mpsc::{channel, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use test_support::*;

// ============================================================================
// Fake Proxy Server
// ============================================================================

enum Step {
    /// Read exactly this many bytes and report them.
    Expect(usize),
    /// Read until the blank line ending an HTTP request.
    ExpectHttp,
    Reply(Vec<u8>),
    /// Keep the connection open until the socket closes it.
    Hold,
    /// Wait for the test to signal, then hang up.
    CloseOn(Receiver<()>),
}

struct FakeProxy {
    addr: SocketAddrV4,
    received: Receiver<Vec<u8>>,
    handle: JoinHandle<()>,
}

impl FakeProxy {
    fn start(script: Vec<Step>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, received) = channel();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            for step in script {
                match step {
                    Step::Expect(len) => {
                        let mut buf = vec![0u8; len];
                        stream.read_exact(&mut buf).unwrap();
                        let _ = tx.send(buf);
                    }
                    Step::ExpectHttp => {
                        let _ = tx.send(read_http_request(&mut stream));
                    }
                    Step::Reply(bytes) => stream.write_all(&bytes).unwrap(),
                    Step::Hold => hold(&mut stream),
                    Step::CloseOn(signal) => {
                        let _ = signal.recv();
                        return;
                    }
                }
            }
        });

        Self {
            addr: loopback(port),
            received,
            handle,
        }
    }

    fn next_request(&self) -> Vec<u8> {
        self.received.recv_timeout(EVENT_TIMEOUT).unwrap()
    }

    fn join(self) {
        self.handle.join().unwrap();
    }
}

fn read_http_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        request.push(byte[0]);
    }
    request
}

fn hold(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

fn connect_done(rx: &Receiver<(u64, SocketEvent)>) -> Option<OsErrorCode> {
    match wait_for(rx, |_, e| matches!(e, SocketEvent::ConnectDone { .. })) {
        (_, SocketEvent::ConnectDone { error }) => error,
        (_, other) => panic!("unexpected event {other:?}"),
    }
}

fn finish(engine: &SocketEngine, socket: &Socket) {
    if socket.is_connected() {
        socket.close_socket().unwrap();
    }
    engine.delete_socket(socket).unwrap();
}

const TARGET_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);

// ============================================================================
// SOCKS4 / SOCKS4A
// ============================================================================

#[test]
fn socks4_connect_with_known_ip() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        Step::Reply(vec![0, 90, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "target.test", 80, Some(TARGET_IP))
        .unwrap();

    assert_eq!(proxy.next_request(), vec![4, 1, 0, 80, 10, 1, 2, 3, 0]);
    assert_eq!(connect_done(&rx), None);
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);
    assert_eq!(socket.host().as_deref(), Some("target.test"));
    assert_eq!(socket.host_port(), 80);
    assert_eq!(socket.proxy_error(false), None);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4_resolves_host_before_request() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        // Greeting right behind the reply, picked up after the handshake
        Step::Reply([&[0, 90, 0, 0, 0, 0, 0, 0][..], b"welcome"].concat()),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);
    let started = engine.threads().started_total();

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "localhost", 0x1f90, None)
        .unwrap();

    assert_eq!(proxy.next_request(), vec![4, 1, 0x1f, 0x90, 127, 0, 0, 1, 0]);
    assert_eq!(connect_done(&rx), None);
    assert_eq!(socket.host_ip(), Some(Ipv4Addr::LOCALHOST));
    assert_eq!(engine.threads().started_total(), started + 1);

    assert_eq!(read_bytes(&socket, &rx, 7), b"welcome");

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4a_sends_host_name() {
    init_tracing();
    let mut expected = vec![4, 1, 1, 187, 0, 0, 0, 1, b'u', b's', b'e', b'r', 0];
    expected.extend_from_slice(b"example.org\0");

    let proxy = FakeProxy::start(vec![
        Step::Expect(expected.len()),
        Step::Reply(vec![0, 90, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4A, proxy.addr).with_credentials("user", "");
    socket
        .connect_with_proxy(&route, "example.org", 443, None)
        .unwrap();

    assert_eq!(proxy.next_request(), expected);
    assert_eq!(connect_done(&rx), None);
    assert_eq!(socket.proxy_user().as_deref(), Some("user"));

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4_rejection_is_reported() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        Step::Reply(vec![0, 91, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "target.test", 80, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(socket.proxy_state(), ProxyState::ConnectFailed);
    assert_eq!(
        socket.proxy_error_code(),
        ProxyError::ProxyServer("request rejected or failed")
    );

    let text = socket.proxy_error(false).unwrap();
    assert_eq!(text.format, "unable to open connection to target.test:80: %s");
    assert_eq!(text.detail, "request rejected or failed");
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "unable to open connection to target.test:80: request rejected or failed"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn malformed_reply_fails_negotiation() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        Step::Reply(vec![5, 90, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "target.test", 80, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(socket.proxy_error_code(), ProxyError::UnexpectedReply);
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "unexpected reply from proxy server while connecting to target.test"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn proxy_closing_early_is_a_receive_error() {
    init_tracing();
    // Reads the request and hangs up without answering
    let proxy = FakeProxy::start(vec![Step::Expect(9)]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "target.test", 80, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert!(matches!(
        socket.proxy_error_code(),
        ProxyError::ReceivingBytes(_)
    ));
    assert!(socket
        .proxy_error(true)
        .unwrap()
        .render()
        .starts_with("error receiving reply from proxy server: "));

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4_unresolvable_host_fails_lookup() {
    init_tracing();
    let proxy = FakeProxy::start(vec![Step::Hold]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "no-such-host.invalid", 21, None)
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(socket.proxy_state(), ProxyState::ConnectFailed);
    assert_eq!(
        socket.proxy_error_code(),
        ProxyError::GettingHostIp(Some(OsErrorCode::HOST_NOT_FOUND))
    );
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "unable to get IP address of no-such-host.invalid: host not found"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn proxy_closing_while_resolving_aborts_connect() {
    init_tracing();
    let (close, signal) = channel();
    let proxy = FakeProxy::start(vec![Step::CloseOn(signal)]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .connect_with_proxy(&route, "no-such-host.invalid", 21, None)
        .unwrap();

    // Hold the dispatch thread so the hang-up is already queued when the
    // connect completes and the lookup starts.
    let guard = engine.lock_sockets_thread();
    close.send(()).unwrap();
    proxy.join();
    thread::sleep(Duration::from_millis(50));
    drop(guard);

    assert_eq!(connect_done(&rx), Some(OsErrorCode::CONNECTION_ABORTED));
    assert_eq!(socket.proxy_state(), ProxyState::ConnectFailed);

    finish(&engine, &socket);
}

// ============================================================================
// SOCKS5
// ============================================================================

#[test]
fn socks5_anonymous_connect() {
    init_tracing();
    let request = wire::socks5_request(
        ProxyCommand::Connect,
        Socks5Address::Domain("example.org"),
        443,
    );
    let proxy = FakeProxy::start(vec![
        Step::Expect(3),
        Step::Reply(vec![5, 0]),
        Step::Expect(request.len()),
        Step::Reply(vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    socket
        .connect_with_proxy(&route, "example.org", 443, None)
        .unwrap();

    assert_eq!(proxy.next_request(), vec![5, 1, 0]);
    assert_eq!(proxy.next_request(), request);
    assert_eq!(connect_done(&rx), None);
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_login_then_connect_by_ip() {
    init_tracing();
    let login = wire::socks5_login("user", "pass");
    let request = wire::socks5_request(ProxyCommand::Connect, Socks5Address::Ip(TARGET_IP), 22);
    let proxy = FakeProxy::start(vec![
        Step::Expect(4),
        Step::Reply(vec![5, 2]),
        Step::Expect(login.len()),
        Step::Reply(vec![1, 0]),
        Step::Expect(request.len()),
        Step::Reply(vec![5, 0, 0, 1, 10, 1, 2, 3, 0, 22]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr).with_credentials("user", "pass");
    socket
        .connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP))
        .unwrap();

    assert_eq!(proxy.next_request(), vec![5, 2, 2, 0]);
    assert_eq!(proxy.next_request(), login);
    assert_eq!(proxy.next_request(), request);
    assert_eq!(connect_done(&rx), None);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_bad_credentials() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(4),
        Step::Reply(vec![5, 2]),
        Step::Expect(wire::socks5_login("user", "wrong").len()),
        Step::Reply(vec![1, 1]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr).with_credentials("user", "wrong");
    socket
        .connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(socket.proxy_error_code(), ProxyError::UserPassAuthFailed);
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "proxy server rejected user name or password"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_requires_authentication() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(3),
        Step::Reply(vec![5, 0xff]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    socket
        .connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(socket.proxy_error_code(), ProxyError::NoAuthUnsupported);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_server_failure_code() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(3),
        Step::Reply(vec![5, 0]),
        Step::Expect(10),
        Step::Reply(vec![5, 5, 0, 1, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    socket
        .connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP))
        .unwrap();

    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "unable to open connection to ssh.test:22: connection refused"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn unreachable_proxy_reports_os_error() {
    init_tracing();
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, loopback(unused_port()));
    match socket.connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP)) {
        Err(Error::Io(err)) => {
            assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
            assert_eq!(socket.proxy_state(), ProxyState::NotOpened);
            return;
        }
        Err(err) => panic!("unexpected error {err}"),
        Ok(()) => {}
    }

    let error = connect_done(&rx).expect("connect must fail");
    assert_eq!(error.kind(), ErrorKind::ConnectionRefused);
    assert_eq!(socket.proxy_state(), ProxyState::ConnectFailed);

    finish(&engine, &socket);
}

#[test]
fn timeout_description_while_negotiating() {
    init_tracing();
    let proxy = FakeProxy::start(vec![Step::Hold]);
    let engine = new_engine();
    let (sink, _rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    socket
        .connect_with_proxy(&route, "ssh.test", 22, Some(TARGET_IP))
        .unwrap();
    assert_eq!(
        socket.proxy_timeout_description(),
        Some("timeout opening connection to proxy server")
    );

    finish(&engine, &socket);
    assert_eq!(socket.proxy_timeout_description(), None);
    proxy.join();
}

#[test]
fn empty_host_is_rejected() {
    init_tracing();
    let engine = new_engine();
    let (sink, _rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, loopback(1080));
    assert!(matches!(
        socket.connect_with_proxy(&route, "", 22, None),
        Err(Error::InvalidHost(_))
    ));
    assert!(socket.msg_index().is_none());
}

// ============================================================================
// HTTP/1.1 CONNECT
// ============================================================================

#[test]
fn http_connect_established() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::ExpectHttp,
        Step::Reply(b"HTTP/1.1 200 Connection established\r\nVia: fake\r\n\r\nhello".to_vec()),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Http11, proxy.addr);
    socket
        .connect_with_proxy(&route, "example.org", 443, None)
        .unwrap();

    assert_eq!(
        proxy.next_request(),
        wire::http_connect_request("example.org", 443, None, None)
    );
    assert_eq!(connect_done(&rx), None);
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);
    // Bytes behind the reply belong to the tunnel
    assert_eq!(read_bytes(&socket, &rx, 5), b"hello");

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn http_connect_refused() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::ExpectHttp,
        Step::Reply(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec()),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Http11, proxy.addr).with_credentials("user", "pass");
    socket
        .connect_with_proxy(&route, "example.org", 443, None)
        .unwrap();

    let request = String::from_utf8(proxy.next_request()).unwrap();
    assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    assert_eq!(connect_done(&rx), Some(OsErrorCode::PROXY_FAILURE));
    assert_eq!(
        socket.proxy_error_code(),
        ProxyError::HttpProxyServer("407 Proxy Authentication Required".to_string())
    );
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "unable to open connection to example.org:443: 407 Proxy Authentication Required"
    );

    finish(&engine, &socket);
    proxy.join();
}

// ============================================================================
// Listening Through a Proxy
// ============================================================================

#[test]
fn socks4_bind_reports_endpoint_then_accept() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        // Unspecified address: the proxy's own address is reported instead
        Step::Reply(vec![0, 90, 0x1f, 0x90, 0, 0, 0, 0]),
        Step::Reply(vec![0, 90, 0, 21, 10, 9, 8, 7]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    let mode = socket
        .open_for_listening_with_proxy(
            loopback(0),
            "peer.test",
            Some(Ipv4Addr::new(10, 9, 8, 7)),
            21,
            &route,
        )
        .unwrap();
    assert_eq!(mode, ListenMode::Proxy);
    assert_eq!(proxy.next_request(), vec![4, 2, 0, 21, 10, 9, 8, 7, 0]);

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: Some(addr), proxy_error: false }
            if addr == SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)
    ));

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::AcceptDone { .. }));
    assert!(matches!(
        event,
        SocketEvent::AcceptDone {
            success: true,
            error: None,
            proxy_error: false
        }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4_bind_rejected_incoming_connection() {
    init_tracing();
    let proxy = FakeProxy::start(vec![
        Step::Expect(9),
        Step::Reply(vec![0, 90, 0x1f, 0x90, 192, 0, 2, 1]),
        Step::Reply(vec![0, 91, 0, 0, 0, 0, 0, 0]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4, proxy.addr);
    socket
        .open_for_listening_with_proxy(
            loopback(0),
            "peer.test",
            Some(Ipv4Addr::new(10, 9, 8, 7)),
            21,
            &route,
        )
        .unwrap();

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: Some(addr), .. }
            if addr == SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 8080)
    ));

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::AcceptDone { .. }));
    assert!(matches!(
        event,
        SocketEvent::AcceptDone {
            success: false,
            proxy_error: true,
            ..
        }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::ListenFailed);
    assert_eq!(
        socket.proxy_error_code(),
        ProxyError::ProxyServer(wire::SOCKS4_INVALID_HOST_TEXT)
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn http_proxy_cannot_listen() {
    init_tracing();
    let proxy = FakeProxy::start(vec![Step::Hold]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Http11, proxy.addr);
    socket
        .open_for_listening_with_proxy(loopback(0), "peer.test", None, 21, &route)
        .unwrap();

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished {
            addr: None,
            proxy_error: true
        }
    ));
    assert_eq!(socket.proxy_error_code(), ProxyError::ListenUnsupported);
    assert_eq!(
        socket.proxy_error(true).unwrap().render(),
        "proxy server does not support listen command"
    );

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks4a_bind_sends_host_name() {
    init_tracing();
    let mut expected = vec![4, 2, 0, 21, 0, 0, 0, 1, 0];
    expected.extend_from_slice(b"peer.test\0");

    let proxy = FakeProxy::start(vec![
        Step::Expect(expected.len()),
        Step::Reply(vec![0, 90, 0x1f, 0x90, 192, 0, 2, 1]),
        Step::Reply(vec![0, 90, 0, 21, 10, 9, 8, 7]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks4A, proxy.addr);
    socket
        .open_for_listening_with_proxy(loopback(0), "peer.test", None, 21, &route)
        .unwrap();
    assert_eq!(proxy.next_request(), expected);

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: Some(addr), proxy_error: false }
            if addr == SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 8080)
    ));

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::AcceptDone { .. }));
    assert!(matches!(
        event,
        SocketEvent::AcceptDone { success: true, error: None, proxy_error: false }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_bind_with_both_replies_together() {
    init_tracing();
    let peer = Ipv4Addr::new(10, 9, 8, 7);
    let request = wire::socks5_request(ProxyCommand::Bind, Socks5Address::Ip(peer), 21);
    let mut replies = vec![5, 0, 0, 1, 0, 0, 0, 0, 0x1f, 0x90];
    replies.extend_from_slice(&[5, 0, 0, 1, 10, 9, 8, 7, 0, 21]);

    let proxy = FakeProxy::start(vec![
        Step::Expect(3),
        Step::Reply(vec![5, 0]),
        Step::Expect(request.len()),
        Step::Reply(replies),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    let mode = socket
        .open_for_listening_with_proxy(loopback(0), "peer.test", Some(peer), 21, &route)
        .unwrap();
    assert_eq!(mode, ListenMode::Proxy);
    assert_eq!(proxy.next_request(), vec![5, 1, 0]);
    assert_eq!(proxy.next_request(), request);

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: Some(addr), proxy_error: false }
            if addr == SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080)
    ));

    // Nothing else arrives from the proxy, so the buffered second reply has
    // to complete the accept on its own.
    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::AcceptDone { .. }));
    assert!(matches!(
        event,
        SocketEvent::AcceptDone { success: true, error: None, proxy_error: false }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);

    finish(&engine, &socket);
    proxy.join();
}

#[test]
fn socks5_bind_after_login() {
    init_tracing();
    let peer = Ipv4Addr::new(10, 9, 8, 7);
    let login = wire::socks5_login("user", "pass");
    let request = wire::socks5_request(ProxyCommand::Bind, Socks5Address::Ip(peer), 21);
    let proxy = FakeProxy::start(vec![
        Step::Expect(4),
        Step::Reply(vec![5, 2]),
        Step::Expect(login.len()),
        Step::Reply(vec![1, 0]),
        Step::Expect(request.len()),
        Step::Reply(vec![5, 0, 0, 1, 192, 0, 2, 1, 0x1f, 0x90]),
        Step::Reply(vec![5, 0, 0, 1, 10, 9, 8, 7, 0, 21]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, proxy.addr).with_credentials("user", "pass");
    socket
        .open_for_listening_with_proxy(loopback(0), "peer.test", Some(peer), 21, &route)
        .unwrap();
    assert_eq!(proxy.next_request(), vec![5, 2, 2, 0]);
    assert_eq!(proxy.next_request(), login);
    assert_eq!(proxy.next_request(), request);

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: Some(addr), proxy_error: false }
            if addr == SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 8080)
    ));

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::AcceptDone { .. }));
    assert!(matches!(event, SocketEvent::AcceptDone { success: true, .. }));
    assert_eq!(socket.proxy_state(), ProxyState::NoProxyOrConnected);

    finish(&engine, &socket);
    proxy.join();
}

/// Runs a SOCKS5 listen against a proxy that answers the method request with
/// `method` and returns the recorded proxy error.
fn socks5_listen_with_method(method: u8, credentials: bool) -> ProxyError {
    let request_len = if credentials { 4 } else { 3 };
    let proxy = FakeProxy::start(vec![
        Step::Expect(request_len),
        Step::Reply(vec![5, method]),
        Step::Hold,
    ]);
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let mut route = ProxyRoute::new(ProxyType::Socks5, proxy.addr);
    if credentials {
        route = route.with_credentials("user", "pass");
    }
    socket
        .open_for_listening_with_proxy(loopback(0), "peer.test", Some(TARGET_IP), 21, &route)
        .unwrap();

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: None, proxy_error: true }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::ListenFailed);
    let error = socket.proxy_error_code();

    finish(&engine, &socket);
    proxy.join();
    error
}

#[test]
fn socks5_listen_refused_methods_are_auth_errors() {
    init_tracing();
    assert_eq!(
        socks5_listen_with_method(0xff, false),
        ProxyError::NoAuthUnsupported
    );
    assert_eq!(
        socks5_listen_with_method(0xff, true),
        ProxyError::UserPassAuthUnsupported
    );
}

#[test]
fn socks5_listen_unknown_method_is_unexpected() {
    init_tracing();
    assert_eq!(
        socks5_listen_with_method(0x05, false),
        ProxyError::UnexpectedReply
    );
    // User/password offered without credentials
    assert_eq!(
        socks5_listen_with_method(0x02, false),
        ProxyError::UnexpectedReply
    );
}

#[test]
fn unreachable_proxy_fails_listen() {
    init_tracing();
    let engine = new_engine();
    let (sink, rx) = ChannelSink::new();
    let socket = engine.create_socket(sink);

    let route = ProxyRoute::new(ProxyType::Socks5, loopback(unused_port()));
    match socket.open_for_listening_with_proxy(loopback(0), "peer.test", None, 21, &route) {
        Err(Error::Io(err)) => {
            assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
            assert_eq!(socket.proxy_state(), ProxyState::NotOpened);
            return;
        }
        Err(err) => panic!("unexpected error {err}"),
        Ok(mode) => assert_eq!(mode, ListenMode::Proxy),
    }

    let (_, event) = wait_for(&rx, |_, e| matches!(e, SocketEvent::ListenEstablished { .. }));
    assert!(matches!(
        event,
        SocketEvent::ListenEstablished { addr: None, proxy_error: true }
    ));
    assert_eq!(socket.proxy_state(), ProxyState::ListenFailed);
    match socket.proxy_error_code() {
        ProxyError::ConnectToProxy(Some(code)) => {
            assert_eq!(code.kind(), ErrorKind::ConnectionRefused)
        }
        other => panic!("unexpected proxy error {other:?}"),
    }

    finish(&engine, &socket);
}
