//! The non-blocking UDP socket contract consumed by the stack.
//!
//! The concrete transport is an external collaborator (see spec §1); this
//! module only fixes the interface the engine is written against, plus a
//! [`MockSocket`] used by tests and the scenario suite.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// A host/port pair. Distinct from `std::net::SocketAddr` only in name, to
/// mirror the `ha` terminology used throughout the spec.
pub type HostAddr = SocketAddr;

/// Non-blocking UDP socket contract.
///
/// Implementations must never block in [`Socket::receive`] or
/// [`Socket::send`]; backpressure is communicated by returning
/// [`Error::WouldBlock`] from `send`.
pub trait Socket {
    /// Binds the socket and marks it ready. Returns `false` on failure to
    /// bind (the stack treats that as fatal at construction time).
    fn reopen(&mut self) -> bool;

    /// Pulls one datagram, if any are pending. Never blocks.
    fn receive(&mut self) -> Option<(Vec<u8>, HostAddr)>;

    /// Sends one datagram. May return `Err(Error::WouldBlock)` to signal
    /// transient backpressure; any other `Err` is fatal and should be
    /// propagated by the caller.
    fn send(&mut self, buf: &[u8], addr: &HostAddr) -> Result<usize>;

    /// The address this socket is bound to, valid after [`Socket::reopen`].
    fn local_addr(&self) -> HostAddr;
}

#[derive(Default)]
struct MockSocketState {
    inbox: VecDeque<(Vec<u8>, HostAddr)>,
    /// Destinations that should report `WouldBlock` the next time a send
    /// is attempted to them. Consumed (removed) on use, so tests can model
    /// a single transient failure.
    block_once: VecDeque<HostAddr>,
    sent: VecDeque<(Vec<u8>, HostAddr)>,
}

/// An in-memory [`Socket`] used by unit and scenario tests.
///
/// Cloning a `MockSocket` shares its queues (mirrors the teacher's
/// `MockTransport`'s `Arc<Mutex<Vec<_>>>` pattern): build one, clone it
/// before handing the original to a `Stack`, and drive the clone from
/// test code with [`MockSocket::deliver`]/[`MockSocket::take_sent`] to
/// simulate packets arriving over the wire from a peer stack.
#[derive(Clone)]
pub struct MockSocket {
    addr: HostAddr,
    state: Arc<Mutex<MockSocketState>>,
}

impl MockSocket {
    /// Creates a new mock bound at `addr`.
    pub fn new(addr: HostAddr) -> Self {
        Self {
            addr,
            state: Arc::new(Mutex::new(MockSocketState::default())),
        }
    }

    /// Pushes a datagram into this socket's receive queue, as if it had
    /// arrived from `from`.
    pub fn deliver(&self, buf: Vec<u8>, from: HostAddr) {
        self.state.lock().unwrap().inbox.push_back((buf, from));
    }

    /// Arranges for the next send to `addr` to fail with `WouldBlock`.
    pub fn block_next_send_to(&self, addr: HostAddr) {
        self.state.lock().unwrap().block_once.push_back(addr);
    }

    /// Drains the record of everything sent through this socket so far.
    pub fn take_sent(&self) -> Vec<(Vec<u8>, HostAddr)> {
        self.state.lock().unwrap().sent.drain(..).collect()
    }
}

impl Socket for MockSocket {
    fn reopen(&mut self) -> bool {
        true
    }

    fn receive(&mut self) -> Option<(Vec<u8>, HostAddr)> {
        self.state.lock().unwrap().inbox.pop_front()
    }

    fn send(&mut self, buf: &[u8], addr: &HostAddr) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.block_once.iter().position(|a| a == addr) {
            state.block_once.remove(pos);
            return Err(Error::WouldBlock);
        }
        state.sent.push_back((buf.to_vec(), *addr));
        Ok(buf.len())
    }

    fn local_addr(&self) -> HostAddr {
        self.addr
    }
}
