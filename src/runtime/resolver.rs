//! DNS resolution for FQDN CONNECT targets.
//!
//! Synchronous and inline on the selector thread, per the accepted
//! limitation recorded in DESIGN.md. Behind a trait so the REQUEST handler
//! can be exercised with a fake resolver in tests without touching the
//! network.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

pub trait Resolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            Err(io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
        } else {
            Ok(addrs)
        }
    }
}
