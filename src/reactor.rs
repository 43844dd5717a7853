//! The edge-triggered, non-blocking connection reactor.
//!
//! One instance of this event loop runs per worker thread. Each worker
//! owns its own `mio::Poll` and its own connection `Registry`; the
//! listening socket is bound with `SO_REUSEPORT` so the kernel
//! distributes accepted connections across workers (see `SPEC_FULL.md`
//! §9 for why this sidesteps the single shared-multiplexer-plus-global-
//! mutex design the base spec describes as its "simplest correct"
//! option).

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::command;
use crate::connection::{ConnectionState, Registry};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Bounded stack buffer for one `read()` call; the read path loops
/// over chunks of this size until the socket would block.
const READ_CHUNK_SIZE: usize = 1024;

/// Caps how many `read()` calls a single pass over one fd can perform,
/// so one very chatty connection can't starve the rest of the batch in
/// a single go. A connection that hits this cap before the socket
/// would block is re-queued (`still_readable` in `run_worker`) and
/// revisited before the next `poll()` wait rather than dropped, since
/// edge-triggered mode requires the socket be fully drained.
const MAX_READS_PER_EVENT: usize = 64;

/// Tunables the reactor needs per worker; resolved from `Config`.
#[derive(Debug, Clone, Copy)]
pub struct ReactorConfig {
    pub max_events: usize,
    pub max_connections: usize,
    pub refill_cap: usize,
    pub output_soft_cap: usize,
    pub poll_timeout: Duration,
}

/// Runs the reactor loop for one worker until `running` is cleared.
///
/// Takes ownership of an already-bound `SO_REUSEPORT` listener (see
/// `Server::run`, which binds one such listener per worker up front,
/// before any worker thread exists) and owns its own registry for the
/// lifetime of the call; on return every connection has been closed
/// and both the listener and the poll's underlying fd are dropped.
pub fn run_worker(
    worker_id: usize,
    listener: std::net::TcpListener,
    cfg: ReactorConfig,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(cfg.max_events);

    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut registry = Registry::with_capacity(cfg.max_connections);

    // Tokens whose read path hit `MAX_READS_PER_EVENT` before seeing
    // `WouldBlock`: under edge-triggered readiness the kernel will not
    // re-notify these fds until *new* bytes arrive, so they must be
    // revisited before the next `poll()` wait rather than left to
    // possibly never see another readable event (spec.md glossary:
    // "the handler must drain until the syscall would block to avoid
    // stalling").
    let mut still_readable = Vec::new();

    while running.load(Ordering::Relaxed) {
        match poll.poll(&mut events, Some(cfg.poll_timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(worker = worker_id, error = %e, "poll error, continuing");
                continue;
            }
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_connections(worker_id, &listener, &mut poll, &mut registry, cfg);
                continue;
            }

            let token = event.token().0;
            if !registry.contains(token) {
                continue; // closed by an earlier event in this same batch
            }

            if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                close_connection(&mut poll, &mut registry, token);
                continue;
            }

            if event.is_readable() {
                drain_readable(worker_id, &mut poll, &mut registry, token, &mut still_readable);
            }

            if !registry.contains(token) {
                continue;
            }

            if event.is_writable() {
                if let Err(e) = handle_writable(&mut registry, token, cfg) {
                    debug!(worker = worker_id, token, error = %e, "connection closed on write");
                    close_connection(&mut poll, &mut registry, token);
                    continue;
                }
            }

            if registry.contains(token) {
                sync_write_interest(&mut poll, &mut registry, token);
            }
        }

        // Revisit every fd that hit the per-event read cap with data
        // still potentially pending, until each either drains or
        // closes. A connection re-added to `still_readable` by this
        // same pass is picked up again on the next iteration. A command
        // completed only on a revisit read can set `ready_write` after
        // the per-event loop already passed this token, so re-sync
        // write-interest here too or the reply never gets a WRITABLE
        // registration to ride out on.
        while !still_readable.is_empty() {
            for token in std::mem::take(&mut still_readable) {
                if registry.contains(token) {
                    drain_readable(worker_id, &mut poll, &mut registry, token, &mut still_readable);
                    if registry.contains(token) {
                        sync_write_interest(&mut poll, &mut registry, token);
                    }
                }
            }
        }
    }

    for (_, conn) in registry.iter_mut() {
        let _ = poll.registry().deregister(&mut conn.stream);
        let _ = conn.stream.shutdown(std::net::Shutdown::Both);
    }
    let _ = poll.registry().deregister(&mut listener);

    Ok(())
}

/// §4.4.1 Accept path: drain the listen queue (edge-triggered
/// discipline), registering each new connection for read-readiness.
fn accept_connections(
    worker_id: usize,
    listener: &TcpListener,
    poll: &mut Poll,
    registry: &mut Registry,
    cfg: ReactorConfig,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if registry.len() >= cfg.max_connections {
                    warn!(worker = worker_id, "connection limit reached, dropping accept");
                    continue;
                }

                let token = registry.insert(ConnectionState::new(stream));
                let conn = match registry
                    .get_mut(token)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))
                {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(worker = worker_id, error = %e, "accepted connection vanished before registration");
                        continue;
                    }
                };

                if let Err(e) =
                    poll.registry()
                        .register(&mut conn.stream, Token(token), Interest::READABLE)
                {
                    warn!(worker = worker_id, error = %e, "failed to register accepted connection");
                    registry.remove(token);
                    continue;
                }

                debug!(worker = worker_id, token, peer = %peer, "accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(worker = worker_id, error = %e, "accept error");
                break;
            }
        }
    }
}

/// Runs the read path for `token` and, if it stopped because it hit
/// `MAX_READS_PER_EVENT` rather than `WouldBlock`, re-queues the token
/// in `still_readable` so the caller revisits it before the worker's
/// next `poll()` wait (edge-triggered readiness won't re-notify a
/// fd that still has unread bytes sitting in the kernel buffer).
fn drain_readable(
    worker_id: usize,
    poll: &mut Poll,
    registry: &mut Registry,
    token: usize,
    still_readable: &mut Vec<usize>,
) {
    match handle_readable(registry, token) {
        Ok(true) => still_readable.push(token),
        Ok(false) => {}
        Err(e) => {
            debug!(worker = worker_id, token, error = %e, "connection closed on read");
            close_connection(poll, registry, token);
        }
    }
}

/// §4.4.2 Read path. Returns `Ok(true)` if the read loop stopped
/// because it hit `MAX_READS_PER_EVENT` rather than because the socket
/// would block — i.e. there may still be unread bytes waiting.
fn handle_readable(registry: &mut Registry, token: usize) -> io::Result<bool> {
    let conn = registry
        .get_mut(token)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    let mut buf = [0u8; READ_CHUNK_SIZE];
    for i in 0..MAX_READS_PER_EVENT {
        match conn.stream.read(&mut buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
            }
            Ok(n) => {
                conn.in_buf.extend_from_slice(&buf[..n]);
                command::process(conn);
                if i + 1 == MAX_READS_PER_EVENT {
                    return Ok(true);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(false)
}

/// §4.4.3 Write path.
fn handle_writable(registry: &mut Registry, token: usize, cfg: ReactorConfig) -> io::Result<()> {
    let conn = registry
        .get_mut(token)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    while !conn.out_buf.is_empty() {
        match conn.stream.write(&conn.out_buf) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
            }
            Ok(n) => conn.advance_out_buf(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    refill(conn, cfg);

    if conn.out_buf.is_empty() && !conn.export_seq {
        conn.ready_write = false;
    }

    Ok(())
}

/// After `out_buf` fully drains, refill it with up to `refill_cap`
/// fresh rows while `export_seq` is set, bounded by `output_soft_cap`
/// so a slow consumer can't make one connection's refill burst grow
/// without limit. Clears `export_seq` the first time a row comes back
/// empty (no sequences registered) and never re-emits a record for
/// that empty row.
fn refill(conn: &mut ConnectionState, cfg: ReactorConfig) {
    if !conn.export_seq {
        return;
    }

    for _ in 0..cfg.refill_cap {
        if conn.out_buf.len() > cfg.output_soft_cap {
            break;
        }
        let row = conn.factory.row();
        if row.is_empty() {
            conn.export_seq = false;
            break;
        }
        conn.out_buf.extend_from_slice(row.as_bytes());
        conn.out_buf.extend_from_slice(b"\r\n");
    }
}

/// Re-registers the fd for read+write or read-only depending on
/// whether `ready_write` just transitioned, without emitting redundant
/// `epoll_ctl`-equivalent syscalls when the interest set hasn't
/// changed.
fn sync_write_interest(poll: &mut Poll, registry: &mut Registry, token: usize) {
    let conn = match registry.get_mut(token) {
        Some(c) => c,
        None => return,
    };

    if conn.ready_write && !conn.write_registered {
        if poll
            .registry()
            .reregister(
                &mut conn.stream,
                Token(token),
                Interest::READABLE | Interest::WRITABLE,
            )
            .is_ok()
        {
            conn.write_registered = true;
        }
    } else if !conn.ready_write && conn.write_registered {
        if poll
            .registry()
            .reregister(&mut conn.stream, Token(token), Interest::READABLE)
            .is_ok()
        {
            conn.write_registered = false;
        }
    }
}

/// §4.4.4 Close path: idempotent removal from the multiplexer and the
/// registry.
fn close_connection(poll: &mut Poll, registry: &mut Registry, token: usize) {
    if let Some(mut conn) = registry.remove(token) {
        let _ = poll.registry().deregister(&mut conn.stream);
        let _ = conn.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Binds a non-blocking `SO_REUSEPORT` listener on `addr` with a
/// backlog of 1024, per spec.md §4.5/§9 (IPv4-only; dual-stack is a
/// non-goal).
pub fn bind_reuseport_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}
