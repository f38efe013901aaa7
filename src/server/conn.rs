//! Per-connection worker: assemble newline-terminated packets and hand each
//! to the log sink.

use std::io::{self, Read};
use std::net::{IpAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};

use crate::server::sink::LogSink;

/// Receive block size.
pub const RECV_CHUNK: usize = 4096;

/// First allocation of the assembly buffer; growth doubles from there.
const ASSEMBLY_INITIAL_CAPACITY: usize = 1024;

/// Accumulates inbound bytes until a newline completes a packet.
pub struct LineAssembler {
    buf: Vec<u8>,
    /// Set after an allocation failure: input is dropped until the next
    /// newline so framing resynchronizes on a packet boundary.
    discarding: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Feed `bytes`, invoking `on_packet` once per completed packet (newline
    /// included). The buffer's capacity is retained between packets.
    pub fn feed<E>(
        &mut self,
        bytes: &[u8],
        mut on_packet: impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        for &byte in bytes {
            if self.discarding {
                if byte == b'\n' {
                    self.discarding = false;
                }
                continue;
            }
            if self.buf.len() == self.buf.capacity() {
                let grow = if self.buf.capacity() == 0 {
                    ASSEMBLY_INITIAL_CAPACITY
                } else {
                    self.buf.capacity()
                };
                if self.buf.try_reserve_exact(grow).is_err() {
                    error!("out of memory assembling a packet; discarding until next newline");
                    self.buf = Vec::new();
                    self.discarding = byte != b'\n';
                    continue;
                }
            }
            self.buf.push(byte);
            if byte == b'\n' {
                let result = on_packet(&self.buf);
                self.buf.clear();
                result?;
            }
        }
        Ok(())
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of one connection worker. Owns `stream`; returns when the peer
/// closes, the sink fails, or shutdown is requested (the accept loop
/// half-closes the socket to unblock the read).
pub(crate) fn handle_connection(
    mut stream: TcpStream,
    peer_ip: IpAddr,
    mut sink: Box<dyn LogSink + Send>,
    shutdown: Arc<AtomicBool>,
) {
    info!("Accepted connection from {peer_ip}");

    let mut assembler = LineAssembler::new();
    let mut chunk = [0u8; RECV_CHUNK];
    while !shutdown.load(Ordering::SeqCst) {
        let n = match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("recv from {peer_ip} failed: {e}");
                break;
            }
        };
        let result = assembler.feed(&chunk[..n], |packet| sink.submit(packet, &mut stream));
        if let Err(e) = result {
            warn!("connection from {peer_ip} dropped: {e}");
            break;
        }
    }

    info!("Closed connection from {peer_ip}");
}
