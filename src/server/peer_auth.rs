//! Transport-binding layer for the local credential server (C12).
//!
//! Unix-socket peer credentials are read through `tokio::net::UnixStream::
//! peer_cred()` — a safe wrapper already present in tokio, so this crate
//! never needs its own `SO_PEERCRED`/`LOCAL_PEERCRED` FFI. Loopback TCP has
//! no equivalent; the server instead restricts to loopback addresses and
//! checks the `Host` header.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::Connected;
use tokio::net::UnixStream;
use tokio::net::unix::{SocketAddr as UnixSocketAddr, UCred};

/// Connection info captured at accept time for a Unix-socket peer.
///
/// Grounded on axum's documented unix-domain-socket example: a small
/// `Connected<&UnixStream>` impl that snapshots `peer_addr`/`peer_cred`
/// once, at accept, rather than re-deriving it per request.
#[derive(Debug, Clone)]
pub struct UdsConnectInfo {
    pub peer_addr: Arc<UnixSocketAddr>,
    pub peer_cred: UCred,
}

impl Connected<&UnixStream> for UdsConnectInfo {
    fn connect_info(target: &UnixStream) -> Self {
        // Both calls only fail on an already-torn-down socket; axum only
        // invokes `connect_info` on a freshly accepted, live connection.
        let peer_addr = target.peer_addr().expect("peer_addr on a freshly accepted socket");
        let peer_cred = target.peer_cred().expect("peer_cred on a freshly accepted socket");
        Self {
            peer_addr: Arc::new(peer_addr),
            peer_cred,
        }
    }
}

/// Whether `addr` is a loopback address (`127.0.0.0/8` or `::1`).
#[must_use]
pub fn is_loopback(addr: SocketAddr) -> bool {
    addr.ip().is_loopback()
}

/// Validate a `Host` header against an allowlist of hostnames, ignoring
/// any `:port` suffix. Guards against DNS-rebinding on the loopback-TCP
/// transport, where peer credentials are unavailable.
#[must_use]
pub fn host_header_is_allowed(host: &str, allowed: &[String]) -> bool {
    let host_only = host.split(':').next().unwrap_or(host);
    allowed.iter().any(|candidate| candidate == host_only)
}

/// The current process's own uid, for binding a freshly minted Unix-socket
/// token before the first peer connects (spec §4.11/§9: "before that first
/// request, tokens are UID-bound only" — the bound uid has to come from
/// somewhere other than `peer_cred`, which only exists once a peer has
/// connected). `rustix::process::getuid` is a safe wrapper around the
/// `getuid(2)` syscall, the same way `tokio::net::UnixStream::peer_cred()`
/// is a safe wrapper for the peer side — neither needs this crate to reach
/// for raw `libc` FFI or to carve out an exception to `#![forbid(unsafe_code)]`.
#[must_use]
pub fn own_uid() -> u32 {
    rustix::process::getuid().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_and_v6_are_recognized() {
        assert!(is_loopback("127.0.0.1:9000".parse().unwrap()));
        assert!(is_loopback("[::1]:9000".parse().unwrap()));
        assert!(!is_loopback("10.0.0.5:9000".parse().unwrap()));
    }

    #[test]
    fn host_header_strips_port_before_comparing() {
        let allowed = vec!["localhost".to_string()];
        assert!(host_header_is_allowed("localhost:9000", &allowed));
        assert!(!host_header_is_allowed("evil.example:9000", &allowed));
    }
}
