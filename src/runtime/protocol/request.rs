//! REQUEST: CONNECT parsing, resolution and non-blocking connect.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::TcpStream;
use mio::Interest;
use socket2::{Domain, Socket, Type};

use crate::access_log;
use crate::runtime::connection::{
    token_for, ConnState, Connection, RequestScratch, Scratch, Side, WriteReply,
};
use crate::runtime::resolver::Resolver;
use crate::runtime::selector::Selector;
use crate::wire;

enum DestHost {
    Ip(IpAddr),
    Name(String),
}

enum RequestParse {
    Incomplete,
    Invalid,
    UnsupportedCmd { consumed: usize },
    UnsupportedAtyp,
    Done {
        consumed: usize,
        cmd: u8,
        host: DestHost,
        port: u16,
    },
}

fn parse_request(buf: &[u8]) -> RequestParse {
    if buf.len() < 4 {
        return RequestParse::Incomplete;
    }
    if buf[0] != wire::SOCKS_VERSION {
        return RequestParse::Invalid;
    }
    let cmd = buf[1];
    let atyp = buf[3];
    let mut pos = 4;

    let host = match atyp {
        wire::atyp::IPV4 => {
            if buf.len() < pos + 4 {
                return RequestParse::Incomplete;
            }
            let ip = Ipv4Addr::new(buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]);
            pos += 4;
            DestHost::Ip(IpAddr::V4(ip))
        }
        wire::atyp::IPV6 => {
            if buf.len() < pos + 16 {
                return RequestParse::Incomplete;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[pos..pos + 16]);
            pos += 16;
            DestHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        wire::atyp::FQDN => {
            if buf.len() < pos + 1 {
                return RequestParse::Incomplete;
            }
            let len = buf[pos] as usize;
            pos += 1;
            if buf.len() < pos + len {
                return RequestParse::Incomplete;
            }
            let name = match std::str::from_utf8(&buf[pos..pos + len]) {
                Ok(s) => s.to_string(),
                Err(_) => return RequestParse::Invalid,
            };
            pos += len;
            DestHost::Name(name)
        }
        _ => return RequestParse::UnsupportedAtyp,
    };

    if buf.len() < pos + 2 {
        return RequestParse::Incomplete;
    }
    let port = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    pos += 2;

    if cmd != wire::cmd::CONNECT {
        return RequestParse::UnsupportedCmd { consumed: pos };
    }

    RequestParse::Done {
        consumed: pos,
        cmd,
        host,
        port,
    }
}

fn failure_reply(rep: u8) -> Vec<u8> {
    vec![wire::SOCKS_VERSION, rep, 0x00, wire::atyp::IPV4, 0, 0, 0, 0, 0, 0]
}

fn success_reply() -> Vec<u8> {
    vec![
        wire::SOCKS_VERSION,
        wire::reply::SUCCEEDED,
        0x00,
        wire::atyp::IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

fn reply_code_name(rep: u8) -> &'static str {
    match rep {
        wire::reply::SUCCEEDED => "SUCCEEDED",
        wire::reply::GENERAL_FAILURE => "GENERAL_FAILURE",
        wire::reply::CONNECTION_NOT_ALLOWED => "CONNECTION_NOT_ALLOWED",
        wire::reply::NETWORK_UNREACHABLE => "NETWORK_UNREACHABLE",
        wire::reply::HOST_UNREACHABLE => "HOST_UNREACHABLE",
        wire::reply::CONNECTION_REFUSED => "CONNECTION_REFUSED",
        wire::reply::TTL_EXPIRED => "TTL_EXPIRED",
        wire::reply::CMD_NOT_SUPPORTED => "CMD_NOT_SUPPORTED",
        wire::reply::ATYP_NOT_SUPPORTED => "ATYP_NOT_SUPPORTED",
        _ => "UNKNOWN",
    }
}

fn fail(conn: &mut Connection, rep: u8, dest: &str) -> ConnState {
    access_log::record(conn.username.as_deref(), conn.client_addr, dest, reply_code_name(rep));
    conn.scratch = Scratch::Reply(WriteReply::new(failure_reply(rep), ConnState::Error));
    ConnState::RequestWrite
}

pub fn handle_read(
    conn: &mut Connection,
    resolver: &dyn Resolver,
    selector: &mut Selector,
    id: usize,
) -> io::Result<ConnState> {
    let n = {
        let stream = conn.client.as_mut().expect("request read without client socket");
        match stream.read(conn.rb.writable()) {
            Ok(0) => return Ok(ConnState::Error),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ConnState::RequestRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ConnState::RequestRead),
            Err(_) => return Ok(ConnState::Error),
        }
    };
    conn.rb.advance_write(n);

    match parse_request(conn.rb.readable()) {
        RequestParse::Incomplete => Ok(ConnState::RequestRead),
        RequestParse::Invalid => Ok(fail(conn, wire::reply::GENERAL_FAILURE, "-")),
        RequestParse::UnsupportedAtyp => Ok(fail(conn, wire::reply::ATYP_NOT_SUPPORTED, "-")),
        RequestParse::UnsupportedCmd { consumed } => {
            conn.rb.advance_read(consumed);
            Ok(fail(conn, wire::reply::CMD_NOT_SUPPORTED, "-"))
        }
        RequestParse::Done {
            consumed,
            host,
            port,
            ..
        } => {
            conn.rb.advance_read(consumed);
            let (candidates, dest_display) = match host {
                DestHost::Ip(ip) => (vec![SocketAddr::new(ip, port)], format!("{ip}:{port}")),
                DestHost::Name(name) => {
                    let display = format!("{name}:{port}");
                    match resolver.resolve(&name, port) {
                        Ok(addrs) => (addrs, display),
                        Err(_) => return Ok(fail(conn, wire::reply::HOST_UNREACHABLE, &display)),
                    }
                }
            };
            conn.scratch = Scratch::Request(RequestScratch {
                candidates,
                cursor: 0,
                dest_display,
            });
            Ok(try_connect_next(conn, selector, id))
        }
    }
}

/// Creates a non-blocking socket and starts `connect()`. The socket is
/// handed back regardless of whether the connect completed immediately or
/// is still in progress — either way the caller registers it for WRITABLE
/// and lets the next readiness event (possibly firing right away) settle
/// the outcome via `take_error`.
fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(std_stream))
}

fn try_connect_next(conn: &mut Connection, selector: &mut Selector, id: usize) -> ConnState {
    loop {
        let addr = {
            let scratch = match &mut conn.scratch {
                Scratch::Request(r) => r,
                _ => unreachable!("try_connect_next without a request scratch"),
            };
            if scratch.cursor >= scratch.candidates.len() {
                let dest = scratch.dest_display.clone();
                return fail(conn, wire::reply::CONNECTION_REFUSED, &dest);
            }
            let addr = scratch.candidates[scratch.cursor];
            scratch.cursor += 1;
            addr
        };

        match start_connect(addr) {
            Ok(mut stream) => {
                if selector
                    .register(&mut stream, token_for(id, Side::Origin), Interest::WRITABLE)
                    .is_err()
                {
                    continue;
                }
                conn.origin = Some(stream);
                return ConnState::RequestConnecting;
            }
            Err(_) => continue,
        }
    }
}

pub fn handle_connecting(conn: &mut Connection, selector: &mut Selector, id: usize) -> ConnState {
    let mut stream = match conn.origin.take() {
        Some(s) => s,
        None => return ConnState::Error,
    };
    let outcome = stream.take_error();
    let _ = selector.unregister(&mut stream);

    match outcome {
        Ok(None) => {
            let dest_display = match &conn.scratch {
                Scratch::Request(r) => r.dest_display.clone(),
                _ => "-".to_string(),
            };
            access_log::record(conn.username.as_deref(), conn.client_addr, &dest_display, "SUCCEEDED");
            conn.origin = Some(stream);
            conn.scratch = Scratch::Reply(WriteReply::new(success_reply(), ConnState::Copy));
            ConnState::RequestWrite
        }
        _ => try_connect_next(conn, selector, id),
    }
}

pub fn handle_write(conn: &mut Connection) -> io::Result<ConnState> {
    super::drive_reply_write(
        conn.client.as_mut().expect("request write without client socket"),
        &mut conn.scratch,
        ConnState::RequestWrite,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_request_parses() {
        let buf = [0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        match parse_request(&buf) {
            RequestParse::Done { consumed, cmd, host, port } => {
                assert_eq!(consumed, 10);
                assert_eq!(cmd, wire::cmd::CONNECT);
                assert!(matches!(host, DestHost::Ip(IpAddr::V4(a)) if a == Ipv4Addr::new(127,0,0,1)));
                assert_eq!(port, 80);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn test_fqdn_request_parses() {
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());
        match parse_request(&buf) {
            RequestParse::Done { host, port, .. } => {
                assert!(matches!(host, DestHost::Name(ref n) if n == "example.com"));
                assert_eq!(port, 443);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn test_unsupported_cmd() {
        let buf = [0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(parse_request(&buf), RequestParse::UnsupportedCmd { consumed: 10 }));
    }

    #[test]
    fn test_unsupported_atyp() {
        let buf = [0x05, 0x01, 0x00, 0x7f];
        assert!(matches!(parse_request(&buf), RequestParse::UnsupportedAtyp));
    }

    #[test]
    fn test_incomplete_fqdn() {
        let buf = [0x05, 0x01, 0x00, 0x03, 11, b'e', b'x'];
        assert!(matches!(parse_request(&buf), RequestParse::Incomplete));
    }

    #[test]
    fn test_wrong_version_invalid() {
        let buf = [0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        assert!(matches!(parse_request(&buf), RequestParse::Invalid));
    }
}
