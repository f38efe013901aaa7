use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use log::{LevelFilter, error};

use aesdsocket::daemon::daemonize;
use aesdsocket::server::{Backend, Server, ServerConfig};

#[cfg(feature = "char-device")]
use aesdsocket::device::CommandDevice;

/// Shared with the signal handlers once the server's flag exists.
static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_termination(_signo: libc::c_int) {
    // Only async-signal-safe work here: set the flag and return.
    if let Some(flag) = SHUTDOWN.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

fn install_signal_handlers() -> std::io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        // No SA_RESTART: blocked calls must see EINTR on delivery.
        sa.sa_sigaction = handle_termination as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut()) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // A peer that disappears mid-send must not kill the process.
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The original logs through syslog (LOG_USER, identity "aesdsocket");
/// fall back to stderr where no syslog socket exists (containers, CI).
fn init_logging() {
    let installed = syslog::init(
        syslog::Facility::LOG_USER,
        LevelFilter::Info,
        Some("aesdsocket"),
    );
    if installed.is_err() {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Info)
            .try_init();
    }
}

struct Args {
    daemonize: bool,
}

fn parse_args() -> Args {
    let mut daemonize = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-d" => daemonize = true,
            _ => {
                eprintln!("Usage: aesdsocket [-d]");
                process::exit(1);
            }
        }
    }
    Args { daemonize }
}

#[cfg(feature = "char-device")]
fn backend() -> Backend {
    Backend::Device(CommandDevice::new())
}

#[cfg(not(feature = "char-device"))]
fn backend() -> Backend {
    Backend::File {
        data_path: aesdsocket::server::DEFAULT_DATA_PATH.into(),
    }
}

fn main() {
    let args = parse_args();
    init_logging();

    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = SHUTDOWN.set(Arc::clone(&shutdown));
    if let Err(e) = install_signal_handlers() {
        error!("failed to install signal handlers: {e}");
        process::exit(1);
    }

    let config = ServerConfig {
        backend: backend(),
        ..ServerConfig::default()
    };

    // Bind, open the backend, and verify thread creation before daemonizing
    // so startup failures are reported in the foreground.
    let server = match Server::bind(config, shutdown) {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {e}");
            process::exit(1);
        }
    };

    if args.daemonize {
        if let Err(e) = daemonize() {
            error!("failed to daemonize: {e}");
            process::exit(1);
        }
    }

    if let Err(e) = server.run() {
        error!("server failed: {e}");
        process::exit(1);
    }
}
