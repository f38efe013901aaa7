//! Log backends: where packets are appended and where replays come from.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use log::warn;

use crate::device::{CommandDevice, DeviceHandle};
use crate::device::seek::parse_seek_command;
use crate::error::AesdError;

/// Replay block size.
pub const SEND_CHUNK: usize = 4096;

/// Backend seam between packet assembly and the command log.
///
/// `submit` appends one complete packet to the log and streams the reply to
/// `reply`. An error ends the submitting connection only.
pub trait LogSink {
    fn submit(&mut self, packet: &[u8], reply: &mut dyn Write) -> Result<(), AesdError>;
}

/// File-mode log: a single regular file shared by all connections and the
/// timestamp writer.
///
/// The inner mutex is the file lock; append-then-replay runs as one critical
/// section so a replay sees the just-appended packet and nothing a concurrent
/// writer adds mid-stream.
pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    /// Open the data file, discarding any previous contents.
    pub fn create(path: &Path) -> Result<Arc<Self>, AesdError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        file.set_len(0)?;
        Ok(Arc::new(Self {
            path: path.to_owned(),
            file: Mutex::new(file),
        }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append one packet under the file lock, without replaying. Used by the
    /// timestamp writer.
    pub fn append(&self, packet: &[u8]) -> Result<(), AesdError> {
        let mut file = self.lock();
        file.write_all(packet)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the data file (shutdown step).
    pub fn remove(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }
}

impl LogSink for Arc<FileLog> {
    fn submit(&mut self, packet: &[u8], reply: &mut dyn Write) -> Result<(), AesdError> {
        let mut file = self.lock();
        file.write_all(packet)?;
        // Positional reads leave the append cursor alone.
        let mut offset = 0u64;
        let mut buf = [0u8; SEND_CHUNK];
        loop {
            let n = loop {
                match file.read_at(&mut buf, offset) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            if n == 0 {
                break;
            }
            reply.write_all(&buf[..n])?;
            offset += n as u64;
        }
        Ok(())
    }
}

/// Device-mode log: drives the in-process command device through a handle
/// opened once per connection.
///
/// No cross-connection lock lives here; the device's own lock serializes.
pub struct DeviceLog {
    handle: DeviceHandle,
}

impl DeviceLog {
    pub fn open(device: &Arc<CommandDevice>) -> Self {
        Self {
            handle: device.open(),
        }
    }
}

impl LogSink for DeviceLog {
    fn submit(&mut self, packet: &[u8], reply: &mut dyn Write) -> Result<(), AesdError> {
        if let Some(target) = parse_seek_command(packet) {
            // A seek command positions the handle and is not written to the
            // log; the reply stream below then starts at the seek position.
            // A rejected seek is dropped and the connection continues.
            if let Err(e) = self.handle.seek_to(target) {
                warn!("rejected seek command: {e}");
                return Ok(());
            }
        } else {
            self.handle.write_all(packet)?;
        }
        // Stream from the handle position until a block carries a newline
        // (end-of-command) or the log is exhausted.
        let mut buf = [0u8; SEND_CHUNK];
        loop {
            let n = self.handle.read(&mut buf)?;
            if n == 0 {
                break;
            }
            reply.write_all(&buf[..n])?;
            if buf[..n].contains(&b'\n') {
                break;
            }
        }
        Ok(())
    }
}
