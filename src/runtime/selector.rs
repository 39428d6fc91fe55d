//! Thin wrapper over `mio::Poll`.
//!
//! `NOOP` interest (per SPEC_FULL.md §4.2) is modeled by unregistering the
//! source entirely, since `mio::Interest` cannot be constructed empty.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

pub struct Selector {
    poll: Poll,
    events: Events,
}

impl Selector {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
        })
    }

    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn unregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until at least one source is ready or `timeout` elapses, then
    /// returns the ready events for the caller to dispatch.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<&Events> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(&self.events),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(&self.events),
            Err(e) => Err(e),
        }
    }
}

/// Interest with both directions cleared collapses to "unregister"; this
/// helper lets callers pass an `Option<Interest>` straight through without
/// tracking whether the descriptor is already registered — `reregister` is
/// tried first and a failure (the common "not registered yet" case) falls
/// back to `register`, so this is safe to call after every state
/// transition regardless of the descriptor's prior registration.
pub fn apply_interest<S: Source + ?Sized>(
    selector: &mut Selector,
    source: &mut S,
    token: Token,
    interest: Option<Interest>,
) -> io::Result<()> {
    match interest {
        Some(i) => {
            if selector.reregister(source, token, i).is_err() {
                selector.register(source, token, i)?;
            }
            Ok(())
        }
        None => {
            let _ = selector.unregister(source);
            Ok(())
        }
    }
}
