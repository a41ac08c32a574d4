//! Blocking host lookups on short-lived worker threads.

use super::{Request, Shared};
use crate::error::{Error, OsErrorCode};
use crate::socket::SocketRef;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, trace};

/// Resolves `host` to its first IPv4 address.
///
/// Resolver failures without an OS error number (getaddrinfo's own codes)
/// are reported as [`OsErrorCode::HOST_NOT_FOUND`].
pub fn resolve_ipv4(host: &str) -> Result<Ipv4Addr, OsErrorCode> {
    let addrs = (host, 0).to_socket_addrs().map_err(|err| {
        debug!(%host, %err, "Host lookup failed");
        match err.raw_os_error() {
            Some(_) => OsErrorCode::from(&err),
            None => OsErrorCode::HOST_NOT_FOUND,
        }
    })?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or(OsErrorCode::from_kind(ErrorKind::AddrNotAvailable))
}

/// Starts a worker that resolves `host` and posts the result to `target`.
///
/// The worker only holds a weak reference to the engine; a result that
/// arrives after shutdown is dropped.
pub(crate) fn spawn_lookup(
    shared: &Arc<Shared>,
    target: SocketRef,
    host: String,
    host_uid: u32,
) -> Result<(), Error> {
    let engine = Arc::downgrade(shared);
    shared.threads.start_thread("sockengine-resolver", move || {
        trace!(%host, host_uid, "Resolving host");
        let result = resolve_ipv4(&host);
        debug!(%host, host_uid, ?result, "Host lookup finished");

        let Some(shared) = engine.upgrade() else {
            debug!(%host, "Engine gone before lookup finished");
            return;
        };
        let request = Request::HostResolved {
            target,
            host_uid,
            result,
        };
        if let Err(err) = shared.post(request) {
            debug!(%host, %err, "Unable to deliver lookup result");
        }
    })?;
    Ok(())
}
