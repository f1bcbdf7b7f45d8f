//! # cport-lines
//!
//! Line-oriented TCP server on the cport completion port.
//!
//! The main thread blocks in `accept` and posts every new client to the
//! port as a `StartClient` operation. Worker threads pick it up, start a
//! connection task and from then on only run that task when one of its
//! reads or writes completes.
//!
//! ## Usage
//!
//!     cargo run -p cport-lines --release -- [--port 8080] [--workers 4] [--backend uring]
//!
//! Configuration comes from `CPORT_*` variables first; flags override.
//! Log level comes from `CPORT_LOG` (default `info`).
//!
//! ## Try it
//!
//!     printf 'GET / HTTP/1.1\r\nHost: x\r\n\r\n' | nc 127.0.0.1 8080

use cport_core::env::{env_get, env_get_bool};
use cport_core::shared::Retainer;
use cport_core::task::Engine;
use cport_core::op::Operation;
use cport_runtime::{line_factory, BackendKind, IoHandler, RuntimeConfig, WorkerPool, WorkerStats};

use nix::errno::Errno;
use nix::sys::socket::accept;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

/// SIGINT/SIGTERM without SA_RESTART, so a blocked `accept` returns EINTR.
fn install_signals() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("CPORT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(env_get_bool("CPORT_LOG_ANSI", true))
        .with_thread_names(true)
        .init();
}

struct Args {
    port: u16,
    config: RuntimeConfig,
}

fn parse_args(mut config: RuntimeConfig) -> Result<Args, String> {
    let mut port: u16 = env_get("CPORT_PORT", 8080);
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().ok_or_else(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--port" | "-p" => {
                port = value("--port")?.parse::<u16>().map_err(|e| format!("--port: {}", e))?;
            }
            "--workers" | "-w" => {
                let n = value("--workers")?.parse::<usize>().map_err(|e| format!("--workers: {}", e))?;
                config = config.num_workers(n);
            }
            "--backend" | "-b" => {
                let kind = value("--backend")?.parse::<BackendKind>().map_err(|e| e.to_string())?;
                config = config.backend(kind);
            }
            s => match s.parse::<u16>() {
                Ok(p) => port = p,
                Err(_) => return Err(format!("unknown argument '{}'", s)),
            },
        }
    }
    Ok(Args { port, config })
}

/// Accept until a signal arrives or the listener fails.
fn accept_loop(listener: &TcpListener, handler: &IoHandler) -> u64 {
    let mut clients = 0u64;
    while RUNNING.load(Ordering::Relaxed) {
        let fd = match accept(listener.as_raw_fd()) {
            Ok(fd) => fd,
            Err(Errno::EINTR) | Err(Errno::ECONNABORTED) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                if matches!(e, Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM) {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                break;
            }
        };
        // Safety: `accept` just returned this descriptor and nothing else owns it.
        let client = unsafe { OwnedFd::from_raw_fd(fd) };
        tracing::trace!(fd, "client connected");

        if let Err(rejected) = handler.post(Operation::start_client(client)) {
            tracing::error!(error = %rejected, "cannot hand client to the port");
            if handler.is_closed() {
                break;
            }
            continue;
        }
        clients += 1;
    }
    clients
}

fn main() -> ExitCode {
    init_logging();
    install_signals();

    let Args { port, config } = match parse_args(RuntimeConfig::from_env()) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("cport-lines: {}", e);
            eprintln!("usage: cport-lines [--port N] [--workers N] [--backend auto|uring|threaded]");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "bad configuration");
        return ExitCode::from(2);
    }
    config.log();

    // ── 1. Completion port ──
    let mut handler: Retainer<IoHandler> = match IoHandler::create(&config) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "cannot create the io handler");
            return ExitCode::FAILURE;
        }
    };
    let Some(port_handle) = handler.get() else {
        return ExitCode::FAILURE;
    };

    // ── 2. Workers ──
    let engine = Arc::new(Engine::new(config.engine_config()));
    let pool = match WorkerPool::start(
        config.num_workers,
        &handler,
        Arc::clone(&engine),
        line_factory(config.recv_buffer),
    ) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "cannot start workers");
            port_handle.close();
            return ExitCode::FAILURE;
        }
    };

    // ── 3. Accept loop ──
    let listener = match TcpListener::bind(("0.0.0.0", port)) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(port, error = %e, "bind failed");
            port_handle.close();
            pool.join();
            port_handle.drain();
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        port,
        backend = port_handle.backend_name(),
        workers = pool.num_workers(),
        "listening"
    );
    let clients = accept_loop(&listener, port_handle);

    // ── 4. Shutdown ──
    tracing::info!("shutting down");
    port_handle.close();
    let mut total = WorkerStats::default();
    for s in pool.join() {
        total += s;
    }
    let abandoned = port_handle.drain();
    let stats = engine.stats();
    tracing::info!(
        clients,
        completions = total.completions,
        failed_ops = total.failed_ops,
        finished = stats.finished,
        killed = stats.killed,
        abandoned,
        "stopped"
    );
    handler.release();
    ExitCode::SUCCESS
}
