//! The byte-driven state handlers: HELLO, AUTH, REQUEST and COPY.
//!
//! Each submodule keeps its wire parsing as a pure function over a byte
//! slice (exercised directly in its own tests) separate from the socket
//! I/O that drives it, per SPEC_FULL.md §9 ("Handler continuation via
//! state table").

pub mod auth;
pub mod copy;
pub mod hello;
pub mod request;

use std::io::{self, Write};

use mio::net::TcpStream;

use crate::runtime::connection::{duplex, ConnState, CopyScratch, Scratch};

/// Shared "drain this reply buffer, then transition" driver used by
/// Hello/Auth/Request's write handlers — all three do nothing but finish
/// writing a small reply and move on to whatever state comes next.
///
/// `this_state` is the state the caller is currently in (HelloWrite,
/// AuthWrite or RequestWrite); it is what gets returned on a partial write
/// so the connection stays registered for WRITABLE and tries again on the
/// next event, per the "at most one syscall per invocation" rule.
pub(crate) fn drive_reply_write(
    stream: &mut TcpStream,
    scratch: &mut Scratch,
    this_state: ConnState,
) -> io::Result<ConnState> {
    let reply = match scratch {
        Scratch::Reply(r) => r,
        _ => unreachable!("drive_reply_write invoked outside a Reply scratch"),
    };

    match stream.write(reply.remaining()) {
        Ok(0) => Ok(ConnState::Error),
        Ok(n) => {
            reply.written += n;
            if !reply.is_done() {
                return Ok(this_state);
            }
            let next = reply.next_state.take().unwrap_or(ConnState::Error);
            *scratch = if next == ConnState::Copy {
                Scratch::Copy(CopyScratch {
                    client_duplex: duplex::BOTH,
                    origin_duplex: duplex::BOTH,
                })
            } else {
                Scratch::None
            };
            Ok(next)
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(this_state),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(this_state),
        Err(_) => Ok(ConnState::Error),
    }
}
