//! Periodic timestamp writer (file mode only).

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use log::warn;

use crate::server::sink::FileLog;

/// RFC-2822-like local-time format, e.g. `Sat, 01 Aug 2026 12:00:00 +0000`.
const TIMESTAMP_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

/// Spawn the timestamp writer. It appends `timestamp:<date>\n` to the log
/// every `interval`, sleeping in short increments (a tenth of the interval,
/// at most one second) so a shutdown request is honored promptly.
///
/// Spawn failure is startup-fatal and left to the caller.
pub fn spawn_timestamp_writer(
    log: Arc<FileLog>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("timestamp".into())
        .spawn(move || run(&log, interval, &shutdown))
}

fn run(log: &FileLog, interval: Duration, shutdown: &AtomicBool) {
    let step = (interval / 10)
        .min(Duration::from_secs(1))
        .max(Duration::from_millis(1));
    loop {
        let mut slept = Duration::ZERO;
        while slept < interval {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(step);
            slept += step;
        }
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let line = format!("timestamp:{}\n", Local::now().format(TIMESTAMP_FORMAT));
        if let Err(e) = log.append(line.as_bytes()) {
            warn!("failed to append timestamp: {e}");
        }
    }
}
