//! AUTH: RFC 1929 username/password sub-negotiation.
//!
//! Parser state lives on the stack of a single `parse_auth` call over
//! whatever bytes are currently buffered — unlike the distilled spec's
//! source, which kept parser progress in a `static` shared across
//! connections (a bug, not reproduced here; see DESIGN.md).

use std::io::{self, Read};

use crate::runtime::connection::{ConnState, Connection, Scratch, WriteReply};
use crate::users::UserTable;
use crate::wire;

pub enum AuthParse {
    Incomplete,
    Invalid,
    Done {
        consumed: usize,
        username: String,
        password: String,
    },
}

pub fn parse_auth(buf: &[u8]) -> AuthParse {
    if buf.is_empty() {
        return AuthParse::Incomplete;
    }
    if buf[0] != wire::AUTH_VERSION {
        return AuthParse::Invalid;
    }
    if buf.len() < 2 {
        return AuthParse::Incomplete;
    }
    let ulen = buf[1] as usize;
    if ulen == 0 {
        return AuthParse::Invalid;
    }
    let mut pos = 2;
    if buf.len() < pos + ulen {
        return AuthParse::Incomplete;
    }
    let username = match std::str::from_utf8(&buf[pos..pos + ulen]) {
        Ok(s) => s.to_string(),
        Err(_) => return AuthParse::Invalid,
    };
    pos += ulen;

    if buf.len() < pos + 1 {
        return AuthParse::Incomplete;
    }
    let plen = buf[pos] as usize;
    if plen == 0 {
        return AuthParse::Invalid;
    }
    pos += 1;
    if buf.len() < pos + plen {
        return AuthParse::Incomplete;
    }
    let password = match std::str::from_utf8(&buf[pos..pos + plen]) {
        Ok(s) => s.to_string(),
        Err(_) => return AuthParse::Invalid,
    };
    pos += plen;

    AuthParse::Done {
        consumed: pos,
        username,
        password,
    }
}

pub fn handle_read(conn: &mut Connection, users: &UserTable, metrics: &crate::metrics::Metrics) -> io::Result<ConnState> {
    let n = {
        let stream = conn.client.as_mut().expect("auth read without client socket");
        match stream.read(conn.rb.writable()) {
            Ok(0) => return Ok(ConnState::Error),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ConnState::AuthRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ConnState::AuthRead),
            Err(_) => return Ok(ConnState::Error),
        }
    };
    conn.rb.advance_write(n);

    match parse_auth(conn.rb.readable()) {
        AuthParse::Incomplete => Ok(ConnState::AuthRead),
        AuthParse::Invalid => Ok(ConnState::Error),
        AuthParse::Done {
            consumed,
            username,
            password,
        } => {
            conn.rb.advance_read(consumed);
            let ok = users.check(&username, &password);
            let (status, next) = if ok {
                metrics.auth_succeeded();
                conn.username = Some(username);
                (0x00u8, ConnState::RequestRead)
            } else {
                metrics.auth_failed();
                (0xFFu8, ConnState::Error)
            };
            conn.scratch = Scratch::Reply(WriteReply::new(
                vec![wire::AUTH_VERSION, status],
                next,
            ));
            Ok(ConnState::AuthWrite)
        }
    }
}

pub fn handle_write(conn: &mut Connection) -> io::Result<ConnState> {
    super::drive_reply_write(
        conn.client.as_mut().expect("auth write without client socket"),
        &mut conn.scratch,
        ConnState::AuthWrite,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_parse() {
        assert!(matches!(parse_auth(&[]), AuthParse::Incomplete));
        assert!(matches!(parse_auth(&[0x01]), AuthParse::Incomplete));
        assert!(matches!(parse_auth(&[0x01, 0x05, b'a', b'l', b'i']), AuthParse::Incomplete));
    }

    #[test]
    fn test_wrong_version() {
        assert!(matches!(parse_auth(&[0x02, 0x01, b'a', 0x01, b'b']), AuthParse::Invalid));
    }

    #[test]
    fn test_zero_length_fields_rejected() {
        assert!(matches!(parse_auth(&[0x01, 0x00]), AuthParse::Invalid));
    }

    #[test]
    fn test_full_credentials_parsed() {
        let mut buf = vec![0x01, 5];
        buf.extend_from_slice(b"alice");
        buf.push(3);
        buf.extend_from_slice(b"pw1");
        match parse_auth(&buf) {
            AuthParse::Done { consumed, username, password } => {
                assert_eq!(consumed, buf.len());
                assert_eq!(username, "alice");
                assert_eq!(password, "pw1");
            }
            _ => panic!("expected Done"),
        }
    }
}
