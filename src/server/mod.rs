//! Line-oriented TCP server: accept loop, connection registry, shutdown.

pub mod conn;
pub mod sink;
pub mod timestamp;

use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};

use crate::device::CommandDevice;
use crate::error::AesdError;
use crate::server::sink::{DeviceLog, FileLog, LogSink};
use crate::server::timestamp::spawn_timestamp_writer;

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 9000;

/// Default file-mode data path.
pub const DEFAULT_DATA_PATH: &str = "/var/tmp/aesdsocketdata";

/// How long the accept loop waits on the listening socket before re-checking
/// the shutdown flag. In a multithreaded process the terminating signal may
/// be delivered to any thread, so EINTR alone cannot be relied on to wake
/// the acceptor.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Which backend receives packets and serves replays.
pub enum Backend {
    /// Append to a regular file and replay its full contents.
    File { data_path: PathBuf },
    /// Drive the shared in-process command device.
    Device(Arc<CommandDevice>),
}

pub struct ServerConfig {
    /// Port to bind on all IPv4 interfaces. Port 0 picks an ephemeral port.
    pub port: u16,
    pub backend: Backend,
    /// Interval of the timestamp writer (file mode only).
    pub timestamp_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backend: Backend::File {
                data_path: PathBuf::from(DEFAULT_DATA_PATH),
            },
            timestamp_interval: Duration::from_secs(10),
        }
    }
}

enum BackendState {
    File(Arc<FileLog>),
    Device(Arc<CommandDevice>),
}

/// One accepted connection, owned by the registry until reaped.
struct ConnRecord {
    worker: JoinHandle<()>,
    done: Arc<AtomicBool>,
    /// Cloned handle used only to half-close the socket at shutdown; the
    /// worker owns the stream itself.
    stream: TcpStream,
    peer: SocketAddr,
}

pub struct Server {
    /// Listening socket; taken and closed as the first shutdown step.
    listener: Mutex<Option<TcpListener>>,
    shutdown: Arc<AtomicBool>,
    backend: BackendState,
    timestamp_interval: Duration,
    /// Connection registry. Never held across I/O or a join.
    connections: Mutex<Vec<ConnRecord>>,
}

impl Server {
    /// Bind the listening socket and open the backend.
    ///
    /// Everything that can fail at startup fails here, before the caller
    /// daemonizes, so errors surface in the foreground.
    pub fn bind(config: ServerConfig, shutdown: Arc<AtomicBool>) -> Result<Self, AesdError> {
        // std sets SO_REUSEADDR on Unix listeners.
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))?;
        let backend = match config.backend {
            Backend::File { data_path } => BackendState::File(FileLog::create(&data_path)?),
            Backend::Device(device) => BackendState::Device(device),
        };
        // The timestamp worker itself starts in run(), which may execute
        // after the caller daemonizes (only the forking thread survives a
        // fork). Prove thread creation works now so a failure surfaces in
        // the foreground like the other startup resources.
        if matches!(backend, BackendState::File(_)) {
            let probe = thread::Builder::new().name("timestamp".into()).spawn(|| {})?;
            let _ = probe.join();
        }
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            shutdown,
            backend,
            timestamp_interval: config.timestamp_interval,
            connections: Mutex::new(Vec::new()),
        })
    }

    fn listener(&self) -> std::sync::MutexGuard<'_, Option<TcpListener>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.listener().as_ref() {
            Some(listener) => listener.local_addr(),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Ask the accept loop and all workers to wind down.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Accept connections until shutdown is requested, then tear down:
    /// half-close every client socket, join all workers and the timestamp
    /// writer, and remove the data file in file mode.
    pub fn run(&self) -> Result<(), AesdError> {
        let timestamp_worker = match &self.backend {
            BackendState::File(log) => Some(spawn_timestamp_writer(
                Arc::clone(log),
                self.timestamp_interval,
                Arc::clone(&self.shutdown),
            )?),
            BackendState::Device(_) => None,
        };

        if let Some(listener) = self.listener().as_ref() {
            listener.set_nonblocking(true)?;
        }
        while !self.shutdown.load(Ordering::SeqCst) {
            let guard = self.listener();
            let Some(listener) = guard.as_ref() else {
                break;
            };
            match wait_for_connection(listener) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    error!("poll on listening socket failed: {e}");
                    break;
                }
            }
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                // The connection vanished between poll and accept.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {e}");
                    continue;
                }
            };
            drop(guard);
            self.spawn_worker(stream, peer);
            self.reap_finished();
        }

        info!("Caught signal, exiting");
        self.teardown(timestamp_worker);
        Ok(())
    }

    fn spawn_worker(&self, stream: TcpStream, peer: SocketAddr) {
        // The listener is non-blocking; the accepted socket must not be.
        if let Err(e) = stream.set_nonblocking(false) {
            error!("failed to configure socket for {}: {e}", peer.ip());
            return;
        }
        let half_close = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                error!("failed to clone socket for {}: {e}", peer.ip());
                return;
            }
        };
        let sink: Box<dyn LogSink + Send> = match &self.backend {
            BackendState::File(log) => Box::new(Arc::clone(log)),
            BackendState::Device(device) => Box::new(DeviceLog::open(device)),
        };
        let done = Arc::new(AtomicBool::new(false));
        let spawned = thread::Builder::new().name(format!("conn-{}", peer.ip())).spawn({
            let done = Arc::clone(&done);
            let shutdown = Arc::clone(&self.shutdown);
            move || {
                conn::handle_connection(stream, peer.ip(), sink, shutdown);
                done.store(true, Ordering::SeqCst);
            }
        });
        match spawned {
            Ok(worker) => self.connections().push(ConnRecord {
                worker,
                done,
                stream: half_close,
                peer,
            }),
            Err(e) => error!("failed to spawn worker for {}: {e}", peer.ip()),
        }
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, Vec<ConnRecord>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove finished records from the registry and join them. Joining
    /// happens outside the lock.
    fn reap_finished(&self) {
        let finished: Vec<ConnRecord> = {
            let mut list = self.connections();
            let mut finished = Vec::new();
            let mut i = 0;
            while i < list.len() {
                if list[i].done.load(Ordering::SeqCst) {
                    finished.push(list.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            finished
        };
        for record in finished {
            if record.worker.join().is_err() {
                warn!("worker for {} panicked", record.peer.ip());
            }
        }
    }

    fn teardown(&self, timestamp_worker: Option<JoinHandle<()>>) {
        // Close the listening socket first: no connection may arrive while
        // the workers below are being woken and joined.
        drop(self.listener().take());

        let records: Vec<ConnRecord> = std::mem::take(&mut *self.connections());
        for record in &records {
            // Unblock any read the worker is parked in.
            if let Err(e) = record.stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    warn!("half-close of {} failed: {e}", record.peer.ip());
                }
            }
        }
        for record in records {
            if record.worker.join().is_err() {
                warn!("worker for {} panicked", record.peer.ip());
            }
        }
        if let Some(worker) = timestamp_worker {
            let _ = worker.join();
        }
        if let BackendState::File(log) = &self.backend {
            if let Err(e) = log.remove() {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove {}: {e}", log.path().display());
                }
            }
        }
    }
}

/// Wait until the listener is readable or the poll timeout elapses.
/// `Ok(false)` means "nothing yet, re-check the shutdown flag".
fn wait_for_connection(listener: &TcpListener) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: listener.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = ACCEPT_POLL_TIMEOUT.as_millis() as libc::c_int;
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    // Any revents (including error conditions) are handled by accept.
    Ok(rc > 0)
}
