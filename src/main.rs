//! seqstream: a line-oriented TCP server that lets each connection
//! define up to three arithmetic sequences and stream their
//! interleaved "next" values.
//!
//! Signal handling, argument parsing, and logging are wired up here;
//! the reactor itself only needs `Server::new(config).run()`.

use std::process::ExitCode;
use std::sync::atomic::Ordering;

use signal_hook::consts::{SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM};
use signal_hook::low_level;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use seqstream::config::Config;
use seqstream::server::Server;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    // SIGPIPE defaults to terminating the process; a client closing its
    // read side mid-write must not take the whole server down with it.
    if let Err(e) = unsafe { low_level::register(SIGPIPE, || {}) } {
        error!(error = %e, "failed to ignore SIGPIPE");
    }

    let server = Server::new(config);

    // SIGINT/SIGTERM/SIGHUP/SIGQUIT all mean "stop gracefully": clear
    // the shared running flag. Each worker observes it on its next
    // timed `poll()` wake (<=500ms), per spec.md §5.
    for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT] {
        let running = server.running_flag();
        let result = unsafe {
            low_level::register(signal, move || running.store(false, Ordering::Relaxed))
        };
        if let Err(e) = result {
            error!(signal, error = %e, "failed to register signal handler");
            return ExitCode::FAILURE;
        }
    }

    match server.run() {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "fatal server error");
            ExitCode::FAILURE
        }
    }
}
