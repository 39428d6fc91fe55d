//! The single-threaded, readiness-driven event loop: accepts SOCKS
//! clients, dispatches readiness events to the per-connection protocol
//! engine, and services the management UDP socket on the same `mio::Poll`
//! instance so the user table and metrics never need locking.
//!
//! Grounded in the teacher's `runtime/mod.rs`, which dispatched a single
//! `run(config)` entry point to a platform-specific backend; this crate
//! needs neither io_uring nor a macOS/Linux split (no async runtime, no
//! completion-based I/O), so the platform backends collapse into the one
//! `mio`-based loop below.

mod connection;
mod protocol;
mod resolver;
mod selector;
mod signals;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, UdpSocket as MioUdpSocket};
use mio::{Interest, Token};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::mgmt;
use crate::server;
use crate::users::UserTable;

use connection::{decode_token, token_for, ConnState, Connection, ConnectionRegistry, Side};
use protocol::{auth, copy, hello, request};
use resolver::SystemResolver;
use selector::Selector;

/// `mio::Token` reserved for the SOCKS TCP listener. Connection tokens are
/// `slab` indices packed with a side bit (`connection::token_for`), so
/// `usize::MAX` and its neighbor are safe reservations: no slab will ever
/// grow that large.
const LISTENER_TOKEN: Token = Token(usize::MAX);
const MGMT_TOKEN: Token = Token(usize::MAX - 1);

/// Production entry point: installs OS signal handlers, then runs the
/// event loop until `SIGTERM`/`SIGINT`.
pub fn run(config: Config) -> io::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signals::install(shutdown.clone());
    serve(config, shutdown)
}

/// The event loop itself, parameterized over an externally-owned shutdown
/// flag so tests can drive it without touching real signals.
pub fn serve(config: Config, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    serve_reporting(config, shutdown, None)
}

/// Same loop as [`serve`], but if `ready` is given, sends the actual bound
/// `(socks_addr, mgmt_addr)` pair back once both listeners are up. Lets
/// tests bind to an OS-assigned ephemeral port (`"127.0.0.1:0"`) and learn
/// which port to connect to, without guessing or racing a pre-bind.
pub(crate) fn serve_reporting(
    config: Config,
    shutdown: Arc<AtomicBool>,
    ready: Option<Sender<(SocketAddr, SocketAddr)>>,
) -> io::Result<()> {
    let mut user_table = UserTable::new();
    for (name, password) in &config.users {
        let _ = user_table.add(name, password);
    }
    let metrics = Metrics::new();

    let std_listener = server::bind_tcp_listener(&config.listen, libc::SOMAXCONN)?;
    let mut listener = MioTcpListener::from_std(std_listener);
    let socks_addr = listener.local_addr()?;
    info!(addr = %socks_addr, "SOCKS listener bound");

    let std_mgmt = server::bind_udp_socket(&config.mgmt_listen)?;
    let mut mgmt_socket = MioUdpSocket::from_std(std_mgmt);
    let mgmt_addr = mgmt_socket.local_addr()?;
    info!(addr = %mgmt_addr, "management listener bound");

    if let Some(tx) = ready {
        let _ = tx.send((socks_addr, mgmt_addr));
    }

    let mut selector = Selector::new(1024)?;
    selector.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    selector.register(&mut mgmt_socket, MGMT_TOKEN, Interest::READABLE)?;

    let mut registry = ConnectionRegistry::new(config.buffer_size, config.pool_size);
    let resolver = SystemResolver;
    let timeout = Duration::from_secs(config.poll_timeout_secs);

    while !shutdown.load(Ordering::Relaxed) {
        if signals::DUMP_METRICS.swap(false, Ordering::Relaxed) {
            for (key, value) in metrics.snapshot() {
                info!(metric = key, value, "metrics snapshot");
            }
        }

        // Collect ready events into an owned `Vec` before dispatching:
        // `run_once` holds `&mut selector`, and dispatch needs its own
        // `&mut selector` to (re)register descriptors.
        let events: Vec<(Token, bool, bool)> = match selector.run_once(Some(timeout)) {
            Ok(events) => events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect(),
            Err(e) => return Err(e),
        };

        for (token, readable, writable) in events {
            match token {
                LISTENER_TOKEN => accept_loop(
                    &mut listener,
                    &mut registry,
                    &mut selector,
                    &metrics,
                    config.max_connections,
                ),
                MGMT_TOKEN => mgmt::handle_datagram(&mut mgmt_socket, &mut user_table, &metrics),
                _ => dispatch_connection(
                    token,
                    readable,
                    writable,
                    &mut registry,
                    &mut selector,
                    &resolver,
                    &user_table,
                    &metrics,
                ),
            }
        }
    }

    info!("shutdown requested, exiting event loop");
    Ok(())
}

/// Accepts every connection currently queued on the listener. `mio` is
/// edge-triggered, so a single readiness event can represent more than one
/// pending `accept()`.
fn accept_loop(
    listener: &mut MioTcpListener,
    registry: &mut ConnectionRegistry,
    selector: &mut Selector,
    metrics: &Metrics,
    max_connections: usize,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if registry.len() >= max_connections {
                    debug!(peer = %addr, "connection limit reached, dropping accepted socket");
                    continue;
                }
                let id = registry.insert(stream, addr);
                let registered = {
                    let conn = registry.get_mut(id).expect("just inserted");
                    selector
                        .register(
                            conn.client.as_mut().expect("client socket present after insert"),
                            token_for(id, Side::Client),
                            Interest::READABLE,
                        )
                        .is_ok()
                };
                if registered {
                    metrics.connection_opened();
                } else {
                    registry.remove(id);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Routes one readiness event to its connection's active-state handler,
/// applies the returned transition, then reconciles interest/teardown.
fn dispatch_connection(
    token: Token,
    readable: bool,
    writable: bool,
    registry: &mut ConnectionRegistry,
    selector: &mut Selector,
    resolver: &dyn resolver::Resolver,
    user_table: &UserTable,
    metrics: &Metrics,
) {
    let (id, side) = decode_token(token);
    let state = match registry.get(id) {
        Some(c) => c.state,
        None => return,
    };

    let outcome: io::Result<ConnState> = match (side, state) {
        (Side::Client, ConnState::HelloRead) => {
            let conn = registry.get_mut(id).unwrap();
            hello::handle_read(conn, user_table.auth_required())
        }
        (Side::Client, ConnState::HelloWrite) => {
            let conn = registry.get_mut(id).unwrap();
            hello::handle_write(conn)
        }
        (Side::Client, ConnState::AuthRead) => {
            let conn = registry.get_mut(id).unwrap();
            auth::handle_read(conn, user_table, metrics)
        }
        (Side::Client, ConnState::AuthWrite) => {
            let conn = registry.get_mut(id).unwrap();
            auth::handle_write(conn)
        }
        (Side::Client, ConnState::RequestRead) => {
            let conn = registry.get_mut(id).unwrap();
            request::handle_read(conn, resolver, selector, id)
        }
        (Side::Client, ConnState::RequestWrite) => {
            let conn = registry.get_mut(id).unwrap();
            request::handle_write(conn)
        }
        (Side::Origin, ConnState::RequestConnecting) if writable => {
            let conn = registry.get_mut(id).unwrap();
            Ok(request::handle_connecting(conn, selector, id))
        }
        (Side::Client, ConnState::Copy) => {
            let conn = registry.get_mut(id).unwrap();
            if writable {
                copy::on_client_writable(conn, metrics)
            } else {
                copy::on_client_readable(conn, metrics)
            }
        }
        (Side::Origin, ConnState::Copy) => {
            let conn = registry.get_mut(id).unwrap();
            if writable {
                copy::on_origin_writable(conn)
            } else {
                copy::on_origin_readable(conn)
            }
        }
        // Stale or spurious event for a (side, state) pair that isn't
        // expecting it (e.g. a leftover event on a descriptor that was
        // just unregistered) — nothing to do.
        _ => return,
    };

    let new_state = outcome.unwrap_or(ConnState::Error);
    if let Some(conn) = registry.get_mut(id) {
        conn.state = new_state;
    }
    reconcile(id, registry, selector, metrics);
}

/// Applies the interest mask (or teardown) that the connection's new
/// state implies — interest is always a pure function of state (and, for
/// Copy, of buffer/duplex too), never tracked independently.
fn reconcile(id: usize, registry: &mut ConnectionRegistry, selector: &mut Selector, metrics: &Metrics) {
    let state = match registry.get(id) {
        Some(c) => c.state,
        None => return,
    };

    match state {
        ConnState::Done | ConnState::Error => teardown(id, registry, selector, metrics),
        ConnState::HelloRead | ConnState::AuthRead | ConnState::RequestRead => {
            let conn = registry.get_mut(id).unwrap();
            set_client_interest(conn, selector, id, Some(Interest::READABLE));
        }
        ConnState::HelloWrite | ConnState::AuthWrite | ConnState::RequestWrite => {
            let conn = registry.get_mut(id).unwrap();
            set_client_interest(conn, selector, id, Some(Interest::WRITABLE));
        }
        ConnState::RequestConnecting => {
            // Client interest is NOOP while connecting (§4.6); the origin
            // descriptor's WRITABLE registration was already set up by
            // `request::try_connect_next`.
            let conn = registry.get_mut(id).unwrap();
            set_client_interest(conn, selector, id, None);
        }
        ConnState::Copy => {
            let conn = registry.get_mut(id).unwrap();
            let client_interest = copy::client_interest(conn);
            let origin_interest = copy::origin_interest(conn);
            set_client_interest(conn, selector, id, client_interest);
            let conn = registry.get_mut(id).unwrap();
            set_origin_interest(conn, selector, id, origin_interest);
        }
    }
}

fn set_client_interest(conn: &mut Connection, selector: &mut Selector, id: usize, interest: Option<Interest>) {
    if let Some(stream) = conn.client.as_mut() {
        let _ = selector::apply_interest(selector, stream, token_for(id, Side::Client), interest);
    }
}

fn set_origin_interest(conn: &mut Connection, selector: &mut Selector, id: usize, interest: Option<Interest>) {
    if let Some(stream) = conn.origin.as_mut() {
        let _ = selector::apply_interest(selector, stream, token_for(id, Side::Origin), interest);
    }
}

/// Unregisters and closes both descriptors, then recycles or frees the
/// record, per the Done/Error teardown rules in SPEC_FULL.md §4.8.
fn teardown(id: usize, registry: &mut ConnectionRegistry, selector: &mut Selector, metrics: &Metrics) {
    if let Some(conn) = registry.get_mut(id) {
        if let Some(mut stream) = conn.client.take() {
            let _ = selector.unregister(&mut stream);
        }
        if let Some(mut stream) = conn.origin.take() {
            let _ = selector.unregister(&mut stream);
        }
    }
    metrics.connection_closed();
    registry.remove(id);
}

/// End-to-end scenarios (S1-S6) driven against a real, running event loop:
/// the real server is bound on a loopback ephemeral port and exercised
/// with raw `TcpStream`s, the same way the unit tests on the individual
/// parsers can't — these are the only tests that exercise the full
/// accept -> negotiate -> connect -> copy -> teardown path together.
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener as StdTcpListener, TcpStream};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;

    fn spawn_server(users: Vec<(String, String)>) -> (SocketAddr, SocketAddr, Arc<AtomicBool>) {
        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            mgmt_listen: "127.0.0.1:0".to_string(),
            users,
            max_connections: 64,
            buffer_size: 4096,
            pool_size: 16,
            poll_timeout_secs: 1,
            log_level: "error".to_string(),
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let shutdown_for_thread = shutdown.clone();
        thread::spawn(move || {
            let _ = serve_reporting(config, shutdown_for_thread, Some(tx));
        });
        let (socks_addr, mgmt_addr) = rx.recv_timeout(StdDuration::from_secs(5)).expect("server did not report bound addresses");
        (socks_addr, mgmt_addr, shutdown)
    }

    /// A single-shot TCP echo listener for origin-side scenarios.
    fn spawn_echo() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    fn hello(stream: &mut TcpStream, methods: &[u8]) {
        let mut req = vec![0x05, methods.len() as u8];
        req.extend_from_slice(methods);
        stream.write_all(&req).unwrap();
    }

    fn read_exact_timeout(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        stream.set_read_timeout(Some(StdDuration::from_secs(5))).unwrap();
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn connect_request(stream: &mut TcpStream, addr: SocketAddr) {
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        match addr {
            SocketAddr::V4(v4) => req.extend_from_slice(&v4.ip().octets()),
            SocketAddr::V6(_) => panic!("test helper only supports IPv4 targets"),
        }
        req.extend_from_slice(&addr.port().to_be_bytes());
        stream.write_all(&req).unwrap();
    }

    #[test]
    fn s1_no_auth_connect_and_echo() {
        let (socks_addr, _mgmt_addr, shutdown) = spawn_server(vec![]);
        let echo_addr = spawn_echo();

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00]);
        let reply = read_exact_timeout(&mut client, 2);
        assert_eq!(reply, [0x05, 0x00]);

        connect_request(&mut client, echo_addr);
        let reply = read_exact_timeout(&mut client, 10);
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], 0x00, "expected SUCCEEDED reply");

        client.write_all(b"hello through proxy").unwrap();
        let echoed = read_exact_timeout(&mut client, b"hello through proxy".len());
        assert_eq!(&echoed, b"hello through proxy");

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn s2_userpass_auth_success() {
        let (socks_addr, _mgmt_addr, shutdown) =
            spawn_server(vec![("alice".to_string(), "wonderland".to_string())]);
        let echo_addr = spawn_echo();

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00, 0x02]);
        let reply = read_exact_timeout(&mut client, 2);
        assert_eq!(reply, [0x05, 0x02], "server must pick USERPASS when auth is configured");

        let mut auth_req = vec![0x01, 5];
        auth_req.extend_from_slice(b"alice");
        auth_req.push(10);
        auth_req.extend_from_slice(b"wonderland");
        client.write_all(&auth_req).unwrap();
        let reply = read_exact_timeout(&mut client, 2);
        assert_eq!(reply, [0x01, 0x00], "auth should succeed");

        connect_request(&mut client, echo_addr);
        let reply = read_exact_timeout(&mut client, 10);
        assert_eq!(reply[1], 0x00);

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn s3_userpass_auth_failure_closes_connection() {
        let (socks_addr, _mgmt_addr, shutdown) =
            spawn_server(vec![("alice".to_string(), "wonderland".to_string())]);

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00, 0x02]);
        let _ = read_exact_timeout(&mut client, 2);

        let mut auth_req = vec![0x01, 5];
        auth_req.extend_from_slice(b"alice");
        auth_req.push(5);
        auth_req.extend_from_slice(b"wrong");
        client.write_all(&auth_req).unwrap();
        let reply = read_exact_timeout(&mut client, 2);
        assert_eq!(reply[0], 0x01);
        assert_ne!(reply[1], 0x00, "auth should fail (non-zero status)");

        client.set_read_timeout(Some(StdDuration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "connection should be closed after auth failure");

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn s4_unsupported_command_rejected() {
        let (socks_addr, _mgmt_addr, shutdown) = spawn_server(vec![]);

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00]);
        let _ = read_exact_timeout(&mut client, 2);

        // BIND (0x02) instead of CONNECT.
        let req = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        client.write_all(&req).unwrap();
        let reply = read_exact_timeout(&mut client, 10);
        assert_eq!(reply[1], 0x07, "expected COMMAND_NOT_SUPPORTED");

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn s5_connect_to_closed_port_reports_failure() {
        let (socks_addr, _mgmt_addr, shutdown) = spawn_server(vec![]);

        // Reserve then drop a port so the origin connect fails fast.
        let reserved = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = reserved.local_addr().unwrap();
        drop(reserved);

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00]);
        let _ = read_exact_timeout(&mut client, 2);

        connect_request(&mut client, dead_addr);
        let reply = read_exact_timeout(&mut client, 10);
        assert_ne!(reply[1], 0x00, "connecting to a closed port must not report success");

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn s6_client_half_close_propagates_to_origin() {
        let (socks_addr, _mgmt_addr, shutdown) = spawn_server(vec![]);
        let echo_addr = spawn_echo();

        let mut client = TcpStream::connect(socks_addr).unwrap();
        hello(&mut client, &[0x00]);
        let _ = read_exact_timeout(&mut client, 2);
        connect_request(&mut client, echo_addr);
        let _ = read_exact_timeout(&mut client, 10);

        client.write_all(b"ping").unwrap();
        let echoed = read_exact_timeout(&mut client, 4);
        assert_eq!(&echoed, b"ping");

        client.shutdown(std::net::Shutdown::Write).unwrap();
        client.set_read_timeout(Some(StdDuration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "origin's echo-side close should propagate back once client half-closes");

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn management_stats_over_udp() {
        let (_socks_addr, mgmt_addr, shutdown) = spawn_server(vec![]);

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(StdDuration::from_secs(5))).unwrap();
        client.connect(mgmt_addr).unwrap();
        client.send(b"PING").unwrap();
        let mut buf = [0u8; 256];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK PONG\n");

        shutdown.store(true, Ordering::Relaxed);
    }
}
