//! HELLO: method negotiation (RFC 1928 §3).

use std::io::{self, Read};

use crate::runtime::connection::{ConnState, Connection, Scratch, WriteReply};
use crate::wire;

pub enum HelloParse {
    Incomplete,
    Invalid,
    Done {
        consumed: usize,
        offered_none: bool,
        offered_userpass: bool,
    },
}

/// Pure function over a byte slice: no I/O, exercised directly in tests.
pub fn parse_hello(buf: &[u8]) -> HelloParse {
    if buf.is_empty() {
        return HelloParse::Incomplete;
    }
    if buf[0] != wire::SOCKS_VERSION {
        return HelloParse::Invalid;
    }
    if buf.len() < 2 {
        return HelloParse::Incomplete;
    }
    let n = buf[1] as usize;
    if buf.len() < 2 + n {
        return HelloParse::Incomplete;
    }
    let methods = &buf[2..2 + n];
    HelloParse::Done {
        consumed: 2 + n,
        offered_none: methods.contains(&wire::method::NONE),
        offered_userpass: methods.contains(&wire::method::USERPASS),
    }
}

/// USERPASS always wins over NONE when auth is mandatory, regardless of the
/// order the client listed its methods in.
pub fn select_method(auth_required: bool, offered_none: bool, offered_userpass: bool) -> u8 {
    if offered_userpass {
        wire::method::USERPASS
    } else if !auth_required && offered_none {
        wire::method::NONE
    } else {
        wire::method::NO_ACCEPTABLE
    }
}

pub fn handle_read(conn: &mut Connection, auth_required: bool) -> io::Result<ConnState> {
    let n = {
        let stream = conn.client.as_mut().expect("hello read without client socket");
        match stream.read(conn.rb.writable()) {
            Ok(0) => return Ok(ConnState::Error),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ConnState::HelloRead),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ConnState::HelloRead),
            Err(_) => return Ok(ConnState::Error),
        }
    };
    conn.rb.advance_write(n);

    match parse_hello(conn.rb.readable()) {
        HelloParse::Incomplete => Ok(ConnState::HelloRead),
        HelloParse::Invalid => Ok(ConnState::Error),
        HelloParse::Done {
            consumed,
            offered_none,
            offered_userpass,
        } => {
            conn.rb.advance_read(consumed);
            let method = select_method(auth_required, offered_none, offered_userpass);
            let next = match method {
                wire::method::NONE => ConnState::RequestRead,
                wire::method::USERPASS => ConnState::AuthRead,
                _ => ConnState::Error,
            };
            conn.scratch = Scratch::Reply(WriteReply::new(
                vec![wire::SOCKS_VERSION, method],
                next,
            ));
            Ok(ConnState::HelloWrite)
        }
    }
}

pub fn handle_write(conn: &mut Connection) -> io::Result<ConnState> {
    super::drive_reply_write(
        conn.client.as_mut().expect("hello write without client socket"),
        &mut conn.scratch,
        ConnState::HelloWrite,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_until_full_methods() {
        assert!(matches!(parse_hello(&[]), HelloParse::Incomplete));
        assert!(matches!(parse_hello(&[0x05]), HelloParse::Incomplete));
        assert!(matches!(parse_hello(&[0x05, 0x02, 0x00]), HelloParse::Incomplete));
    }

    #[test]
    fn test_wrong_version_is_invalid() {
        assert!(matches!(parse_hello(&[0x04, 0x01, 0x00]), HelloParse::Invalid));
    }

    #[test]
    fn test_parses_offered_methods() {
        match parse_hello(&[0x05, 0x02, 0x00, 0x02]) {
            HelloParse::Done {
                consumed,
                offered_none,
                offered_userpass,
            } => {
                assert_eq!(consumed, 4);
                assert!(offered_none);
                assert!(offered_userpass);
            }
            _ => panic!("expected Done"),
        }
    }

    #[test]
    fn test_select_method_userpass_wins_over_none() {
        assert_eq!(select_method(true, true, true), wire::method::USERPASS);
        assert_eq!(select_method(false, true, true), wire::method::USERPASS);
    }

    #[test]
    fn test_select_method_none_when_not_required() {
        assert_eq!(select_method(false, true, false), wire::method::NONE);
    }

    #[test]
    fn test_select_method_no_acceptable() {
        assert_eq!(select_method(true, true, false), wire::method::NO_ACCEPTABLE);
        assert_eq!(select_method(false, false, false), wire::method::NO_ACCEPTABLE);
    }
}
