//! Top-level server lifecycle: bind -> listen -> register -> run -> shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{error, info};

use crate::config::Config;
use crate::reactor::{self, ReactorConfig};

/// Owns the server's worker threads for the duration of one `run`.
///
/// Cheap to clone: the running flag and resolved bound address are
/// shared via `Arc`, so a caller can hand one clone to a background
/// thread that calls `run()` while keeping another to call `stop()`
/// or poll `local_addr()` from.
#[derive(Clone)]
pub struct Server {
    config: Config,
    running: Arc<AtomicBool>,
    /// Set once `run()` has resolved and bound the listening address
    /// (resolving an ephemeral `port: 0` to the actual port chosen by
    /// the kernel), so callers driving `run()` from a background
    /// thread can discover where the server ended up listening.
    bound_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
            bound_addr: Arc::new(Mutex::new(None)),
        }
    }

    /// A clone of the running flag, for an external caller (signal
    /// handlers, tests) to trigger `stop()` without holding the
    /// `Server` itself.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Clears the running flag. Advisory: workers finish their current
    /// event batch, then exit on their next timed wake.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// The address the server is listening on, once `run()` has bound
    /// it. Useful for tests that start the server with `port: 0` and
    /// need to discover the ephemeral port the kernel assigned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().expect("bound_addr mutex poisoned")
    }

    /// Binds the listening address, spawns one worker per hardware
    /// thread (or `config.workers` if set), and blocks until every
    /// worker has exited (i.e. until `stop()` is called and observed).
    pub fn run(&self) -> io::Result<()> {
        let requested: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let num_workers = self
            .config
            .workers
            .filter(|&w| w > 0)
            .unwrap_or_else(num_cpus)
            .max(1);

        let reactor_cfg = ReactorConfig {
            max_events: self.config.max_events,
            max_connections: self.config.max_connections,
            refill_cap: self.config.refill_cap,
            output_soft_cap: self.config.output_soft_cap,
            poll_timeout: self.config.poll_timeout,
        };

        // Bind every worker's SO_REUSEPORT listener up front, from this
        // thread, before spawning any worker. The first bind resolves
        // `requested` (which may carry an ephemeral `port: 0`) to a
        // concrete address; every other worker's listener then binds
        // that same resolved address. The first listener is never
        // dropped before the rest are bound, so the port stays held by
        // this process throughout — unlike a probe-bind-then-drop
        // approach, there is no window in which another process could
        // steal the (possibly just-assigned) port before every worker
        // has its own listener on it.
        let mut listeners = Vec::with_capacity(num_workers);
        listeners.push(reactor::bind_reuseport_listener(requested)?);
        let addr = listeners[0].local_addr()?;
        for _ in 1..num_workers {
            listeners.push(reactor::bind_reuseport_listener(addr)?);
        }
        *self.bound_addr.lock().expect("bound_addr mutex poisoned") = Some(addr);

        info!(%addr, workers = num_workers, "starting sequence-stream server");

        let mut handles = Vec::with_capacity(num_workers);
        for (worker_id, listener) in listeners.into_iter().enumerate() {
            let running = Arc::clone(&self.running);
            let handle = thread::Builder::new()
                .name(format!("seqstream-worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = reactor::run_worker(worker_id, listener, reactor_cfg, running) {
                        error!(worker = worker_id, error = %e, "worker exited with error");
                    }
                })?;
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }

        info!("sequence-stream server stopped");
        Ok(())
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
