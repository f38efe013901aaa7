//! In-process command device: a byte stream over the command ring.
//!
//! Writes are split on newlines into commands; each completed command is
//! committed to the ring, evicting the oldest once the ring is full. Reads
//! are byte-addressed across the committed commands in FIFO order. Every
//! operation serializes on the device lock.

pub mod ring;
pub mod seek;

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::device::ring::{CommandRing, Entry};
use crate::device::seek::SeekTo;
use crate::error::AesdError;

/// State guarded by the device lock.
struct DeviceState {
    ring: CommandRing,
    /// Bytes of the in-progress command, pending until a newline arrives.
    partial: Vec<u8>,
}

impl DeviceState {
    /// Grow `partial` by `bytes`, failing without side effects when the
    /// allocator cannot satisfy the request.
    fn append_partial(&mut self, bytes: &[u8]) -> Result<(), AesdError> {
        self.partial
            .try_reserve(bytes.len())
            .map_err(|_| AesdError::OutOfMemory)?;
        self.partial.extend_from_slice(bytes);
        Ok(())
    }

    /// Commit the pending partial as one command. No-op while empty.
    fn finalize(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let entry = Entry::new(std::mem::take(&mut self.partial));
        // The displaced entry, if any, is dropped here.
        let _evicted = self.ring.add(entry);
    }

    /// Newline framing: every terminated segment of `buf` becomes a command,
    /// the tail stays pending. Commands committed before an allocation
    /// failure remain committed.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize, AesdError> {
        let mut start = 0;
        for (i, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                self.append_partial(&buf[start..=i])?;
                self.finalize();
                start = i + 1;
            }
        }
        if start < buf.len() {
            self.append_partial(&buf[start..])?;
        }
        Ok(buf.len())
    }

    /// Copy up to `out.len()` bytes starting at absolute position `pos`,
    /// crossing entry boundaries in FIFO order.
    fn read_at(&self, pos: u64, out: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < out.len() {
            let Some((entry, within)) = self.ring.find_at(pos + copied as u64) else {
                break;
            };
            let avail = &entry.as_bytes()[within..];
            let n = avail.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
        }
        copied
    }
}

/// The single shared device instance. Open handles with [`CommandDevice::open`].
pub struct CommandDevice {
    state: Mutex<DeviceState>,
}

impl CommandDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState {
                ring: CommandRing::new(),
                partial: Vec::new(),
            }),
        })
    }

    /// Bind a new handle to the device. Each handle carries its own position;
    /// there is no other per-open state.
    pub fn open(self: &Arc<Self>) -> DeviceHandle {
        DeviceHandle {
            dev: Arc::clone(self),
            pos: 0,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>, AesdError> {
        // A poisoned lock means the holder panicked mid-update; fail the
        // operation without touching state, as an interrupted lock wait would.
        self.state.lock().map_err(|_| AesdError::Interrupted)
    }

    /// Current logical size: the byte sum of all committed commands. Pending
    /// partial bytes are not included.
    pub fn total_size(&self) -> Result<u64, AesdError> {
        Ok(self.lock()?.ring.total_size())
    }

    /// Number of committed commands currently present.
    pub fn command_count(&self) -> Result<usize, AesdError> {
        Ok(self.lock()?.ring.len())
    }
}

/// A per-open view of the device: shared state plus a private byte position.
///
/// Behaves like a file: [`Read`] honors the position, [`Write`] appends
/// regardless of it, [`Seek`] measures against the current total size.
pub struct DeviceHandle {
    dev: Arc<CommandDevice>,
    pos: u64,
}

impl DeviceHandle {
    /// Position the handle at byte `write_cmd_offset` within the
    /// `write_cmd`-th present command (ioctl counterpart).
    ///
    /// Fails with [`AesdError::InvalidSeek`] when the command index or the
    /// offset within it is out of range.
    pub fn seek_to(&mut self, target: SeekTo) -> Result<(), AesdError> {
        let state = self.dev.lock()?;
        let index = target.write_cmd as usize;
        let Some(entry) = state.ring.nth(index) else {
            return Err(AesdError::InvalidSeek);
        };
        if target.write_cmd_offset as usize >= entry.len() {
            return Err(AesdError::InvalidSeek);
        }
        let base: u64 = state.ring.iter().take(index).map(|e| e.len() as u64).sum();
        self.pos = base + u64::from(target.write_cmd_offset);
        debug!(
            "seek_to cmd={} offset={} -> pos={}",
            target.write_cmd, target.write_cmd_offset, self.pos
        );
        Ok(())
    }

    /// Current absolute byte position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for DeviceHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.dev.lock().map_err(io::Error::from)?;
        let n = state.read_at(self.pos, buf);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for DeviceHandle {
    /// Append-only: the handle position is ignored.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.dev.lock().map_err(io::Error::from)?;
        state.write_bytes(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for DeviceHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let state = self.dev.lock().map_err(io::Error::from)?;
        let size = state.ring.total_size();
        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => i128::from(size) + i128::from(d),
        };
        if target < 0 || target > i128::from(u64::MAX) {
            return Err(AesdError::InvalidSeek.into());
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
