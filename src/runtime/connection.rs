//! Per-connection state and the slab-indexed registry/pool that own it.
//!
//! Grounded in `runtime/connection.rs` from the teacher (`ConnState` +
//! `slab::Slab`-backed `ConnectionRegistry`), generalized from the teacher's
//! single-buffer request/response model to the two-buffer, two-descriptor
//! SOCKS session this crate actually drives.

use std::net::SocketAddr;
use std::time::Instant;

use mio::net::TcpStream;
use slab::Slab;

use crate::buffer::ByteBuffer;

/// The connection's position in the byte-driven protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    HelloRead,
    HelloWrite,
    AuthRead,
    AuthWrite,
    RequestRead,
    RequestConnecting,
    RequestWrite,
    Copy,
    Done,
    Error,
}

/// Half-direction liveness bits for the COPY relay.
pub mod duplex {
    pub const NONE: u8 = 0;
    pub const READ: u8 = 0b01;
    pub const WRITE: u8 = 0b10;
    pub const BOTH: u8 = READ | WRITE;
}

/// Generic "write these bytes, then transition" scratch shared by
/// HelloWrite, AuthWrite and RequestWrite — all three do nothing but drain a
/// small reply buffer and move on.
#[derive(Debug, Default)]
pub struct WriteReply {
    pub data: Vec<u8>,
    pub written: usize,
    pub next_state: Option<ConnState>,
}

impl WriteReply {
    pub fn new(data: Vec<u8>, next_state: ConnState) -> Self {
        Self {
            data,
            written: 0,
            next_state: Some(next_state),
        }
    }

    pub fn remaining(&self) -> &[u8] {
        &self.data[self.written..]
    }

    pub fn is_done(&self) -> bool {
        self.written >= self.data.len()
    }
}

/// Live state while a REQUEST's destination is being resolved/connected.
#[derive(Debug, Default)]
pub struct RequestScratch {
    pub candidates: Vec<SocketAddr>,
    pub cursor: usize,
    pub dest_display: String,
}

/// Live state during COPY: each side's duplex mask.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyScratch {
    pub client_duplex: u8,
    pub origin_duplex: u8,
}

/// Exactly one variant is live at a time, matching `Connection::state`.
#[derive(Debug)]
pub enum Scratch {
    None,
    Reply(WriteReply),
    Request(RequestScratch),
    Copy(CopyScratch),
}

impl Default for Scratch {
    fn default() -> Self {
        Scratch::None
    }
}

/// Which descriptor a readiness event was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Origin,
}

/// The single owner of a client<->origin session.
pub struct Connection {
    pub client: Option<TcpStream>,
    pub origin: Option<TcpStream>,
    pub rb: ByteBuffer,
    pub wb: ByteBuffer,
    pub client_addr: Option<SocketAddr>,
    pub username: Option<String>,
    pub state: ConnState,
    pub scratch: Scratch,
    pub accepted_at: Option<Instant>,
}

impl Connection {
    fn new(buffer_size: usize) -> Self {
        Self {
            client: None,
            origin: None,
            rb: ByteBuffer::new(buffer_size),
            wb: ByteBuffer::new(buffer_size),
            client_addr: None,
            username: None,
            state: ConnState::HelloRead,
            scratch: Scratch::None,
            accepted_at: None,
        }
    }

    /// Reset to a pristine state so a recycled record is indistinguishable
    /// from a freshly constructed one.
    fn reset(&mut self) {
        self.client = None;
        self.origin = None;
        self.rb.reset();
        self.wb.reset();
        self.client_addr = None;
        self.username = None;
        self.state = ConnState::HelloRead;
        self.scratch = Scratch::None;
        self.accepted_at = None;
    }
}

/// Slab-indexed table of live connections, backed by a bounded free list of
/// recycled records. `slab::Slab` gives us stable integer keys that double
/// as the low bits of the `mio::Token` we hand to the selector.
pub struct ConnectionRegistry {
    slab: Slab<Connection>,
    pool: Vec<Connection>,
    pool_cap: usize,
    buffer_size: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer_size: usize, pool_cap: usize) -> Self {
        Self {
            slab: Slab::new(),
            pool: Vec::with_capacity(pool_cap),
            pool_cap,
            buffer_size,
        }
    }

    /// Insert a freshly accepted client connection, returning its slab key.
    pub fn insert(&mut self, client: TcpStream, client_addr: SocketAddr) -> usize {
        let mut conn = self.pool.pop().unwrap_or_else(|| Connection::new(self.buffer_size));
        conn.client = Some(client);
        conn.client_addr = Some(client_addr);
        conn.accepted_at = Some(Instant::now());
        self.slab.insert(conn)
    }

    pub fn get(&self, id: usize) -> Option<&Connection> {
        self.slab.get(id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.slab.get_mut(id)
    }

    pub fn contains(&self, id: usize) -> bool {
        self.slab.contains(id)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Remove a connection from the live table and, capacity permitting,
    /// recycle its record into the free list.
    pub fn remove(&mut self, id: usize) {
        if !self.slab.contains(id) {
            return;
        }
        let mut conn = self.slab.remove(id);
        if self.pool.len() < self.pool_cap {
            conn.reset();
            self.pool.push(conn);
        }
    }
}

/// Packs a slab key and a side into the token space handed to `mio`.
/// Client tokens are even, origin tokens are odd.
pub fn token_for(id: usize, side: Side) -> mio::Token {
    let bit = match side {
        Side::Client => 0,
        Side::Origin => 1,
    };
    mio::Token(id << 1 | bit)
}

pub fn decode_token(token: mio::Token) -> (usize, Side) {
    let raw = token.0;
    let side = if raw & 1 == 0 { Side::Client } else { Side::Origin };
    (raw >> 1, side)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let t = token_for(42, Side::Origin);
        assert_eq!(decode_token(t), (42, Side::Origin));
        let t = token_for(0, Side::Client);
        assert_eq!(decode_token(t), (0, Side::Client));
    }

    #[test]
    fn test_registry_recycles_records() {
        use std::net::{TcpListener, TcpStream as StdTcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_stream = StdTcpStream::connect(addr).unwrap();
        let client = TcpStream::from_std(std_stream);

        let mut reg = ConnectionRegistry::new(256, 2);
        let id = reg.insert(client, addr);
        assert!(reg.contains(id));
        assert_eq!(reg.len(), 1);

        reg.get_mut(id).unwrap().state = ConnState::Copy;
        reg.remove(id);
        assert!(!reg.contains(id));
        assert_eq!(reg.len(), 0);

        // A recycled record starts fresh.
        let std_stream2 = StdTcpStream::connect(addr).unwrap();
        let client2 = TcpStream::from_std(std_stream2);
        let id2 = reg.insert(client2, addr);
        assert_eq!(reg.get(id2).unwrap().state, ConnState::HelloRead);
    }
}
