//! Listening-socket construction.
//!
//! Built via `socket2` so we can set options `std::net` doesn't expose
//! (`SO_REUSEADDR`, `IPV6_V6ONLY`) before handing the descriptor to `mio`.
//! Grounded in the teacher's `server.rs`, which owned listener setup for
//! the cache server; here it owns the SOCKS listener and the management
//! UDP socket instead.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket as StdUdpSocket};

use socket2::{Domain, Socket, Type};

/// Binds the SOCKS TCP listener. If `addr` resolves to the IPv6
/// unspecified address (`[::]:PORT`), attempts a dual-stack bind
/// (`IPV6_V6ONLY=0`) first and falls back to an IPv4-only bind on the same
/// port if that fails, per SPEC_FULL.md §6.
pub fn bind_tcp_listener(addr: &str, backlog: i32) -> io::Result<std::net::TcpListener> {
    let sock_addr: SocketAddr = addr.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid listen address '{addr}'"))
    })?;

    if sock_addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) {
        match bind_tcp_socket(sock_addr, true) {
            Ok(socket) => return finish_listener(socket, backlog),
            Err(e) => {
                tracing::warn!(error = %e, "dual-stack bind failed, falling back to IPv4-only");
                let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), sock_addr.port());
                let socket = bind_tcp_socket(v4, false)?;
                return finish_listener(socket, backlog);
            }
        }
    }

    let socket = bind_tcp_socket(sock_addr, false)?;
    finish_listener(socket, backlog)
}

fn bind_tcp_socket(addr: SocketAddr, dual_stack: bool) -> io::Result<Socket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if dual_stack {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn finish_listener(socket: Socket, backlog: i32) -> io::Result<std::net::TcpListener> {
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Binds the management UDP socket (plain, non-blocking).
pub fn bind_udp_socket(addr: &str) -> io::Result<StdUdpSocket> {
    let sock_addr: SocketAddr = addr.parse().map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid management address '{addr}'"))
    })?;
    let socket = StdUdpSocket::bind(sock_addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ipv4_listener() {
        let listener = bind_tcp_listener("127.0.0.1:0", 128).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_bind_dual_stack_listener_falls_back() {
        // Whether this host's network stack actually supports dual-stack
        // sockets varies; either the native path or the IPv4 fallback
        // must succeed in binding an ephemeral port.
        let listener = bind_tcp_listener("[::]:0", 128).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_bind_udp_socket() {
        let socket = bind_udp_socket("127.0.0.1:0").unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn test_invalid_address_rejected() {
        assert!(bind_tcp_listener("not-an-address", 128).is_err());
    }
}
