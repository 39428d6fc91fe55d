//! Management protocol: a UDP request/reply command interpreter sharing
//! the user table and metrics with the SOCKS core, per SPEC_FULL.md §4.9.
//!
//! Grounded in `original_source/src/management.c` and
//! `src/include/management.h`: request `<COMMAND> [ARGS...]`, reply
//! `<STATUS> <MESSAGE>` where STATUS is `OK` or `ERR`. Dispatched on the
//! same selector thread as the SOCKS core, so mutating the user table
//! needs no lock.

use std::io;

use mio::net::UdpSocket;

use crate::metrics::Metrics;
use crate::users::UserTable;

/// Datagrams longer than this are dropped silently, mirroring the
/// original's `MGMT_MAX_CMD_LEN`.
const MAX_CMD_LEN: usize = 256;

/// Drains every datagram currently queued on `socket` (UDP readiness is
/// edge-triggered the same way TCP is under `mio`, and more than one
/// request can arrive between wakeups).
pub fn handle_datagram(socket: &mut UdpSocket, users: &mut UserTable, metrics: &Metrics) {
    let mut buf = [0u8; 512];
    loop {
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                if n > MAX_CMD_LEN {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf[..n]);
                let reply = dispatch(line.trim_end_matches(['\r', '\n']), users, metrics);
                let _ = socket.send_to(reply.as_bytes(), from);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn dispatch(line: &str, users: &mut UserTable, metrics: &Metrics) -> String {
    let line = line.trim();
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("").to_ascii_uppercase();
    let rest = parts.next().unwrap_or("").trim();

    match cmd.as_str() {
        "STATS" => {
            let mut out = String::from("OK\n");
            for (key, value) in metrics.snapshot() {
                out.push_str(&format!("{key}: {value}\n"));
            }
            out
        }
        "USERS" => {
            let mut out = String::from("OK\n");
            for name in users.names() {
                out.push_str(name);
                out.push('\n');
            }
            out
        }
        "ADD" => match rest.split_once(':') {
            Some((name, pass)) if !name.is_empty() && !pass.is_empty() => match users.add(name, pass) {
                Ok(()) => format!("OK added {name}\n"),
                Err(e) => format!("ERR {e}\n"),
            },
            _ => "ERR usage: ADD <user>:<pass>\n".to_string(),
        },
        "DEL" => {
            if rest.is_empty() {
                "ERR usage: DEL <user>\n".to_string()
            } else {
                match users.remove(rest) {
                    Ok(()) => format!("OK removed {rest}\n"),
                    Err(e) => format!("ERR {e}\n"),
                }
            }
        }
        "HELP" => "OK STATS|USERS|ADD <user>:<pass>|DEL <user>|PING|QUIT|HELP\n".to_string(),
        "PING" => "OK PONG\n".to_string(),
        "QUIT" => "OK bye\n".to_string(),
        "" => "ERR empty command\n".to_string(),
        _ => "ERR unknown command\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping() {
        let mut users = UserTable::new();
        let metrics = Metrics::new();
        assert_eq!(dispatch("PING", &mut users, &metrics), "OK PONG\n");
        assert_eq!(dispatch("ping", &mut users, &metrics), "OK PONG\n");
    }

    #[test]
    fn test_unknown_command() {
        let mut users = UserTable::new();
        let metrics = Metrics::new();
        assert_eq!(dispatch("BOGUS", &mut users, &metrics), "ERR unknown command\n");
        assert_eq!(dispatch("", &mut users, &metrics), "ERR empty command\n");
    }

    #[test]
    fn test_add_then_users_then_del() {
        let mut users = UserTable::new();
        let metrics = Metrics::new();
        assert_eq!(dispatch("ADD alice:secret", &mut users, &metrics), "OK added alice\n");
        assert_eq!(dispatch("USERS", &mut users, &metrics), "OK\nalice\n");
        assert_eq!(dispatch("DEL alice", &mut users, &metrics), "OK removed alice\n");
        assert_eq!(dispatch("DEL alice", &mut users, &metrics), "ERR user not found\n");
    }

    #[test]
    fn test_add_rejects_malformed_arg() {
        let mut users = UserTable::new();
        let metrics = Metrics::new();
        assert_eq!(dispatch("ADD alice", &mut users, &metrics), "ERR usage: ADD <user>:<pass>\n");
    }

    #[test]
    fn test_stats_reports_counters() {
        let mut users = UserTable::new();
        let metrics = Metrics::new();
        metrics.connection_opened();
        let reply = dispatch("STATS", &mut users, &metrics);
        assert!(reply.starts_with("OK\n"));
        assert!(reply.contains("current_connections: 1"));
    }
}
