use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use aesdsocket::device::CommandDevice;
use aesdsocket::error::AesdError;
use aesdsocket::server::conn::LineAssembler;
use aesdsocket::server::{Backend, Server, ServerConfig};
use tempfile::TempDir;

/// An in-process server on an ephemeral port, wound down on drop.
struct TestServer {
    server: Arc<Server>,
    shutdown: Arc<AtomicBool>,
    addr: SocketAddr,
    data_path: Option<PathBuf>,
    runner: Option<JoinHandle<Result<(), AesdError>>>,
    _dir: Option<TempDir>,
}

impl TestServer {
    fn start(backend: Backend, timestamp_interval: Duration) -> (Arc<Server>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let config = ServerConfig {
            port: 0,
            backend,
            timestamp_interval,
        };
        let server = Arc::new(Server::bind(config, Arc::clone(&shutdown)).expect("bind server"));
        (server, shutdown)
    }

    fn launch(server: Arc<Server>, shutdown: Arc<AtomicBool>, data_path: Option<PathBuf>, dir: Option<TempDir>) -> Self {
        let addr = server.local_addr().expect("local addr");
        let runner = thread::spawn({
            let server = Arc::clone(&server);
            move || server.run()
        });
        Self {
            server,
            shutdown,
            addr,
            data_path,
            runner: Some(runner),
            _dir: dir,
        }
    }

    fn file_mode(timestamp_interval: Duration) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_path = dir.path().join("aesdsocketdata");
        let (server, shutdown) = Self::start(
            Backend::File {
                data_path: data_path.clone(),
            },
            timestamp_interval,
        );
        Self::launch(server, shutdown, Some(data_path), Some(dir))
    }

    fn device_mode() -> Self {
        let (server, shutdown) = Self::start(
            Backend::Device(CommandDevice::new()),
            Duration::from_secs(600),
        );
        Self::launch(server, shutdown, None, None)
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream
    }

    /// Request shutdown and assert the server wound down cleanly.
    fn stop(mut self) {
        self.server.request_shutdown();
        let result = self.runner.take().expect("runner").join().expect("server thread");
        result.expect("graceful shutdown");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(runner) = self.runner.take() {
            let _ = runner.join();
        }
    }
}

fn send_packet(stream: &mut TcpStream, packet: &[u8]) {
    stream.write_all(packet).expect("send packet");
}

fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).expect("read reply");
    reply
}

/// A quiet timestamp interval for tests that are not about timestamps.
const QUIET: Duration = Duration::from_secs(600);

// ---- File mode ----

#[test]
fn each_reply_replays_the_whole_log() {
    let ts = TestServer::file_mode(QUIET);
    let mut client = ts.connect();

    send_packet(&mut client, b"A\n");
    let first = read_exactly(&mut client, 2);
    assert_eq!(first, b"A\n");

    send_packet(&mut client, b"B\n");
    let second = read_exactly(&mut client, 4);
    assert_eq!(second, b"A\nB\n");
    // Later replies extend earlier ones.
    assert!(second.starts_with(&first));

    ts.stop();
}

#[test]
fn clients_share_one_log() {
    let ts = TestServer::file_mode(QUIET);

    let mut first = ts.connect();
    send_packet(&mut first, b"A\n");
    assert_eq!(read_exactly(&mut first, 2), b"A\n");

    let mut second = ts.connect();
    send_packet(&mut second, b"B\n");
    assert_eq!(read_exactly(&mut second, 4), b"A\nB\n");

    send_packet(&mut first, b"C\n");
    assert_eq!(read_exactly(&mut first, 6), b"A\nB\nC\n");

    ts.stop();
}

#[test]
fn concurrent_packets_stay_contiguous() {
    let ts = TestServer::file_mode(QUIET);

    let lines: Vec<String> = (0..4).map(|i| format!("client-{i}-payload\n")).collect();
    let workers: Vec<_> = lines
        .iter()
        .cloned()
        .map(|line| {
            let mut client = ts.connect();
            thread::spawn(move || {
                send_packet(&mut client, line.as_bytes());
                // One reply byte proves the append completed.
                read_exactly(&mut client, 1);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("client thread");
    }

    let mut last = ts.connect();
    send_packet(&mut last, b"final\n");
    let total: usize = lines.iter().map(|l| l.len()).sum::<usize>() + "final\n".len();
    let reply = String::from_utf8(read_exactly(&mut last, total)).expect("utf8 reply");

    let mut got: Vec<&str> = reply.split_inclusive('\n').collect();
    assert_eq!(got.pop(), Some("final\n"));
    got.sort_unstable();
    let mut expected: Vec<&str> = lines.iter().map(String::as_str).collect();
    expected.sort_unstable();
    assert_eq!(got, expected);

    ts.stop();
}

#[test]
fn timestamps_are_appended_periodically() {
    let ts = TestServer::file_mode(Duration::from_millis(200));
    thread::sleep(Duration::from_millis(700));

    let mut client = ts.connect();
    send_packet(&mut client, b"X\n");
    let mut reply = Vec::new();
    let mut buf = [0u8; 1024];
    while !reply.ends_with(b"X\n") {
        let n = client.read(&mut buf).expect("read reply");
        assert!(n > 0, "connection closed before the reply finished");
        reply.extend_from_slice(&buf[..n]);
    }

    let text = String::from_utf8(reply).expect("utf8 reply");
    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    assert_eq!(*lines.last().expect("at least one line"), "X\n");
    let stamps: Vec<&str> = lines[..lines.len() - 1].to_vec();
    assert!(!stamps.is_empty(), "no timestamp lines after 700ms at 200ms interval");
    for line in stamps {
        let rest = line.strip_prefix("timestamp:").expect("timestamp prefix");
        chrono::DateTime::parse_from_str(rest.trim_end(), "%a, %d %b %Y %H:%M:%S %z")
            .expect("parseable timestamp");
    }

    ts.stop();
}

#[test]
fn shutdown_wakes_idle_clients_and_removes_the_data_file() {
    let ts = TestServer::file_mode(QUIET);
    let data_path = ts.data_path.clone().expect("file mode path");
    assert!(data_path.exists());

    let mut idle = ts.connect();
    // Give the accept loop a beat to register the connection.
    thread::sleep(Duration::from_millis(200));

    ts.server.request_shutdown();
    let mut buf = [0u8; 16];
    let n = idle.read(&mut buf).expect("read after shutdown");
    assert_eq!(n, 0, "idle client should see EOF on shutdown");

    ts.stop();
    assert!(!data_path.exists(), "data file should be removed at shutdown");
}

// ---- Device mode ----

#[test]
fn device_replies_continue_from_the_handle_position() {
    let ts = TestServer::device_mode();

    let mut client = ts.connect();
    send_packet(&mut client, b"hello\n");
    assert_eq!(read_exactly(&mut client, 6), b"hello\n");
    send_packet(&mut client, b"world\n");
    assert_eq!(read_exactly(&mut client, 6), b"world\n");
    drop(client);

    // A fresh connection opens a fresh handle at position zero.
    let mut fresh = ts.connect();
    send_packet(&mut fresh, b"again\n");
    assert_eq!(read_exactly(&mut fresh, 18), b"hello\nworld\nagain\n");

    ts.stop();
}

#[test]
fn device_seek_command_positions_the_reply_stream() {
    let ts = TestServer::device_mode();

    let mut client = ts.connect();
    send_packet(&mut client, b"hello\n");
    assert_eq!(read_exactly(&mut client, 6), b"hello\n");
    send_packet(&mut client, b"world\n");
    assert_eq!(read_exactly(&mut client, 6), b"world\n");

    send_packet(&mut client, b"AESDCHAR_IOCSEEKTO:0,2\n");
    assert_eq!(read_exactly(&mut client, 10), b"llo\nworld\n");

    // An out-of-range seek is dropped without a reply or a disconnect.
    send_packet(&mut client, b"AESDCHAR_IOCSEEKTO:9,0\n");
    send_packet(&mut client, b"ok\n");
    assert_eq!(read_exactly(&mut client, 3), b"ok\n");

    ts.stop();
}

#[test]
fn device_seek_command_is_not_written_to_the_log() {
    let ts = TestServer::device_mode();

    let mut client = ts.connect();
    send_packet(&mut client, b"a\n");
    assert_eq!(read_exactly(&mut client, 2), b"a\n");
    send_packet(&mut client, b"AESDCHAR_IOCSEEKTO:0,0\n");
    assert_eq!(read_exactly(&mut client, 2), b"a\n");
    drop(client);

    let mut fresh = ts.connect();
    send_packet(&mut fresh, b"b\n");
    assert_eq!(read_exactly(&mut fresh, 4), b"a\nb\n");

    ts.stop();
}

// ---- Line assembly ----

#[test]
fn assembler_frames_packets_across_chunk_boundaries() {
    let mut assembler = LineAssembler::new();
    let mut packets: Vec<Vec<u8>> = Vec::new();
    for chunk in [&b"ab"[..], b"c\nde", b"f\ngh"] {
        assembler
            .feed(chunk, |packet| {
                packets.push(packet.to_vec());
                Ok::<(), ()>(())
            })
            .expect("feed");
    }
    assert_eq!(packets, vec![b"abc\n".to_vec(), b"def\n".to_vec()]);
}

#[test]
fn assembler_keeps_trailing_bytes_pending() {
    let mut assembler = LineAssembler::new();
    let mut packets = 0;
    assembler
        .feed(b"no newline yet", |_| {
            packets += 1;
            Ok::<(), ()>(())
        })
        .expect("feed");
    assert_eq!(packets, 0);
    assembler
        .feed(b"\n", |_| {
            packets += 1;
            Ok::<(), ()>(())
        })
        .expect("feed");
    assert_eq!(packets, 1);
}
