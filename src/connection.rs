//! Per-connection state and the per-worker connection registry.

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use slab::Slab;

use crate::factory::SequenceFactory;

/// Suggested initial capacity for a fresh connection's input buffer.
pub const INITIAL_IN_BUF_CAPACITY: usize = 1024; // 1 KiB

/// Suggested initial capacity for a fresh connection's output buffer.
pub const INITIAL_OUT_BUF_CAPACITY: usize = 64 * 1024; // 64 KiB

/// Everything the reactor needs to drive one client connection.
///
/// Mutated only by the worker thread currently handling its token; no
/// synchronization is needed within a single connection's lifetime
/// (see `Registry` below for how connections are shared across a
/// worker's accept/read/write/close dispatch).
pub struct ConnectionState {
    /// The connection's socket. Owns the underlying fd; dropping this
    /// closes it.
    pub stream: TcpStream,
    /// Bytes received but not yet fully consumed into commands.
    /// Append-at-tail, consume-at-head.
    pub in_buf: BytesMut,
    /// Bytes queued to write back to the client. Append-at-tail,
    /// consume-at-head.
    pub out_buf: BytesMut,
    /// This connection's registered sequences.
    pub factory: SequenceFactory,
    /// Set whenever `out_buf` gains data the reactor hasn't yet
    /// finished writing; cleared once `out_buf` drains and no further
    /// rows are pending.
    pub ready_write: bool,
    /// Set by `export seq`; while true, the write path refills
    /// `out_buf` with fresh rows each time it empties.
    pub export_seq: bool,
    /// Whether the reactor currently has this fd registered for
    /// write-readiness (tracked so the write-interest is only
    /// (re)registered on an actual transition, not on every event).
    pub write_registered: bool,
}

impl ConnectionState {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            in_buf: BytesMut::with_capacity(INITIAL_IN_BUF_CAPACITY),
            out_buf: BytesMut::with_capacity(INITIAL_OUT_BUF_CAPACITY),
            factory: SequenceFactory::new(),
            ready_write: false,
            export_seq: false,
            write_registered: false,
        }
    }

    /// Drops the head `n` bytes already written from `out_buf`.
    pub fn advance_out_buf(&mut self, n: usize) {
        self.out_buf.advance(n);
    }
}

/// The reactor's `fd -> ConnectionState` mapping for one worker.
///
/// Each worker owns its own `Registry`: connections never migrate
/// between workers (the listener's `SO_REUSEPORT` load-balancing
/// decides which worker a connection lands on once, at accept time),
/// so no cross-worker synchronization is required to read or mutate
/// an entry (see `SPEC_FULL.md` §9 for why this sidesteps the single
/// global registry mutex the base design describes).
#[derive(Default)]
pub struct Registry {
    connections: Slab<ConnectionState>,
}

impl Registry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
        }
    }

    pub fn insert(&mut self, conn: ConnectionState) -> usize {
        self.connections.insert(conn)
    }

    pub fn get_mut(&mut self, token: usize) -> Option<&mut ConnectionState> {
        self.connections.get_mut(token)
    }

    pub fn contains(&self, token: usize) -> bool {
        self.connections.contains(token)
    }

    /// Removes and returns the connection, or `None` if it was already
    /// removed (close is idempotent).
    pub fn remove(&mut self, token: usize) -> Option<ConnectionState> {
        if self.connections.contains(token) {
            Some(self.connections.remove(token))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ConnectionState)> {
        self.connections.iter_mut()
    }
}
