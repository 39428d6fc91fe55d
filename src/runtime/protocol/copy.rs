//! COPY: bidirectional byte relay with half-close propagation.
//!
//! Client reads into `rb` and writes from `wb`; origin reads into `wb` and
//! writes from `rb` — the two sides share the same buffer pair with
//! opposite roles. Each side carries a duplex mask recording which halves
//! of its socket are still live; interest is always recomputed, never
//! tracked separately, so it can't drift from the §4.7 formula.

use std::io::{self, Read, Write};

use crate::metrics::Metrics;
use crate::runtime::connection::{duplex, ConnState, Connection, CopyScratch};

fn copy_scratch(conn: &mut Connection) -> &mut CopyScratch {
    match &mut conn.scratch {
        crate::runtime::connection::Scratch::Copy(c) => c,
        _ => unreachable!("copy handler invoked outside the Copy state"),
    }
}

/// "This side just hit EOF or an error reading": its READ half dies now;
/// the peer's WRITE half dies once whatever is already buffered for it
/// drains (handled by `finalize`, not here) — clearing it immediately
/// would drop bytes already read from the peer but not yet delivered.
fn shut_read(this_duplex: &mut u8) {
    *this_duplex &= !duplex::READ;
}

/// "This side just hit a write error": nothing more will ever flow out of
/// it, so both its WRITE half and the peer's READ half die immediately —
/// there is no buffered data to lose in this direction.
fn shut_write_both_sides(this_duplex: &mut u8, peer_duplex: &mut u8) {
    *this_duplex &= !duplex::WRITE;
    *peer_duplex &= !duplex::READ;
}

/// Once a direction's source is permanently closed (no READ left) and its
/// buffer is drained, the sink's WRITE half is finally retired too.
fn finalize(sink_duplex: &mut u8, source_duplex_has_read: bool, buf_has_data: bool) {
    if !source_duplex_has_read && !buf_has_data {
        *sink_duplex &= !duplex::WRITE;
    }
}

fn recompute(conn: &mut Connection) -> ConnState {
    let rb_can_read = conn.rb.can_read();
    let wb_can_read = conn.wb.can_read();
    let client_has_read = copy_scratch(conn).client_duplex & duplex::READ != 0;
    let origin_has_read = copy_scratch(conn).origin_duplex & duplex::READ != 0;
    let origin_write_before = copy_scratch(conn).origin_duplex & duplex::WRITE != 0;
    let client_write_before = copy_scratch(conn).client_duplex & duplex::WRITE != 0;

    {
        let scratch = copy_scratch(conn);
        finalize(&mut scratch.origin_duplex, client_has_read, rb_can_read);
        finalize(&mut scratch.client_duplex, origin_has_read, wb_can_read);
    }

    let scratch = *copy_scratch(conn);

    // A side's WRITE half retiring here (as opposed to via an immediate
    // write failure, which already tore down the socket) means its
    // source drained cleanly: tell the real peer with an actual
    // half-close instead of just stopping our own relaying.
    if origin_write_before && scratch.origin_duplex & duplex::WRITE == 0 {
        if let Some(stream) = conn.origin.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
    }
    if client_write_before && scratch.client_duplex & duplex::WRITE == 0 {
        if let Some(stream) = conn.client.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Write);
        }
    }

    if scratch.client_duplex == duplex::NONE && scratch.origin_duplex == duplex::NONE {
        ConnState::Done
    } else {
        ConnState::Copy
    }
}

/// Interest a side should currently be registered for, or `None` for NOOP.
pub fn client_interest(conn: &Connection) -> Option<mio::Interest> {
    side_interest(copy_duplex(conn).0, conn.rb.can_write(), conn.wb.can_read())
}

pub fn origin_interest(conn: &Connection) -> Option<mio::Interest> {
    side_interest(copy_duplex(conn).1, conn.wb.can_write(), conn.rb.can_read())
}

fn copy_duplex(conn: &Connection) -> (u8, u8) {
    match &conn.scratch {
        crate::runtime::connection::Scratch::Copy(c) => (c.client_duplex, c.origin_duplex),
        _ => (duplex::NONE, duplex::NONE),
    }
}

fn side_interest(mask: u8, buf_in_writable: bool, buf_out_readable: bool) -> Option<mio::Interest> {
    let read = mask & duplex::READ != 0 && buf_in_writable;
    let write = mask & duplex::WRITE != 0 && buf_out_readable;
    match (read, write) {
        (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
        (true, false) => Some(mio::Interest::READABLE),
        (false, true) => Some(mio::Interest::WRITABLE),
        (false, false) => None,
    }
}

pub fn on_client_readable(conn: &mut Connection, metrics: &Metrics) -> io::Result<ConnState> {
    if !conn.rb.can_write() {
        return Ok(ConnState::Copy);
    }
    let stream = conn.client.as_mut().expect("copy without client socket");
    match stream.read(conn.rb.writable()) {
        Ok(0) => shut_read(&mut copy_scratch(conn).client_duplex),
        Ok(n) => {
            conn.rb.advance_write(n);
            metrics.add_bytes_received(n as u64);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(_) => shut_read(&mut copy_scratch(conn).client_duplex),
    }
    Ok(recompute(conn))
}

pub fn on_client_writable(conn: &mut Connection, metrics: &Metrics) -> io::Result<ConnState> {
    if !conn.wb.can_read() {
        return Ok(ConnState::Copy);
    }
    let stream = conn.client.as_mut().expect("copy without client socket");
    match stream.write(conn.wb.readable()) {
        Ok(0) => {
            let scratch = copy_scratch(conn);
            shut_write_both_sides(&mut scratch.client_duplex, &mut scratch.origin_duplex);
        }
        Ok(n) => {
            conn.wb.advance_read(n);
            metrics.add_bytes_sent(n as u64);
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(_) => {
            let scratch = copy_scratch(conn);
            shut_write_both_sides(&mut scratch.client_duplex, &mut scratch.origin_duplex);
        }
    }
    Ok(recompute(conn))
}

pub fn on_origin_readable(conn: &mut Connection) -> io::Result<ConnState> {
    if !conn.wb.can_write() {
        return Ok(ConnState::Copy);
    }
    let stream = conn.origin.as_mut().expect("copy without origin socket");
    match stream.read(conn.wb.writable()) {
        Ok(0) => shut_read(&mut copy_scratch(conn).origin_duplex),
        Ok(n) => conn.wb.advance_write(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(_) => shut_read(&mut copy_scratch(conn).origin_duplex),
    }
    Ok(recompute(conn))
}

pub fn on_origin_writable(conn: &mut Connection) -> io::Result<ConnState> {
    if !conn.rb.can_read() {
        return Ok(ConnState::Copy);
    }
    let stream = conn.origin.as_mut().expect("copy without origin socket");
    match stream.write(conn.rb.readable()) {
        Ok(0) => {
            let scratch = copy_scratch(conn);
            shut_write_both_sides(&mut scratch.origin_duplex, &mut scratch.client_duplex);
        }
        Ok(n) => conn.rb.advance_read(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
        Err(_) => {
            let scratch = copy_scratch(conn);
            shut_write_both_sides(&mut scratch.origin_duplex, &mut scratch.client_duplex);
        }
    }
    Ok(recompute(conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(r: bool, w: bool) -> u8 {
        (if r { duplex::READ } else { 0 }) | (if w { duplex::WRITE } else { 0 })
    }

    #[test]
    fn test_side_interest_formula() {
        assert_eq!(side_interest(duplex::BOTH, true, true), Some(mio::Interest::READABLE | mio::Interest::WRITABLE));
        assert_eq!(side_interest(duplex::BOTH, true, false), Some(mio::Interest::READABLE));
        assert_eq!(side_interest(duplex::BOTH, false, true), Some(mio::Interest::WRITABLE));
        assert_eq!(side_interest(duplex::BOTH, false, false), None);
        assert_eq!(side_interest(duplex::NONE, true, true), None);
    }

    #[test]
    fn test_shut_read_clears_only_read_bit() {
        let mut d = duplex::BOTH;
        shut_read(&mut d);
        assert_eq!(d, duplex::WRITE);
    }

    #[test]
    fn test_finalize_waits_for_drain() {
        let mut sink = duplex::BOTH;
        // Source still has READ: sink's WRITE must survive even with an empty buffer.
        finalize(&mut sink, true, false);
        assert_eq!(sink, duplex::BOTH);
        // Source closed but buffer still has data: WRITE must survive.
        finalize(&mut sink, false, true);
        assert_eq!(sink, duplex::BOTH);
        // Source closed and buffer drained: WRITE finally retires.
        finalize(&mut sink, false, false);
        assert_eq!(sink, duplex::READ);
    }

    #[test]
    fn test_mask_helper_matches_constants() {
        assert_eq!(mask(true, true), duplex::BOTH);
        assert_eq!(mask(false, false), duplex::NONE);
    }
}
