//! Dedicated access-log line, one per completed CONNECT attempt.
//!
//! Emitted on the `tracing` target `"access"` so it can be routed to its own
//! sink independently of the general application log, per SPEC_FULL.md §6.

use std::net::SocketAddr;

pub fn record(user: Option<&str>, client_addr: Option<SocketAddr>, dest: &str, status: &str) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    let user = user.unwrap_or("-");
    let client = client_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());
    tracing::info!(target: "access", "{timestamp} {user} {client} -> {dest} {status}");
}
