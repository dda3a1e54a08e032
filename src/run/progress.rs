//! Background progress reporting.
//!
//! A reporter thread wakes on a fixed interval, checks every expected log
//! for the encoder's terminal marker and logs `(created, finished, total)`.
//! It never touches the job pool; it stops once every log is finished or
//! when its owner drops the stop channel.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::metrics::{TERMINAL_MARKER, decode_log_bytes};

/// How much of a log's tail is searched for the terminal marker.
pub const TAIL_BYTES: u64 = 64 * 1024;

/// Progress counts at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Logs that exist.
    pub created: usize,
    /// Logs that contain the terminal marker.
    pub finished: usize,
    /// Logs expected.
    pub total: usize,
}

impl ProgressSnapshot {
    /// Whether every expected log is finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.finished >= self.total
    }
}

/// Whether a log's tail contains the terminal marker.
#[must_use]
pub fn log_finished(path: &Path) -> bool {
    read_tail(path).is_some_and(|text| text.contains(TERMINAL_MARKER))
}

fn read_tail(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    // Keep the offset even so UTF-16 logs stay aligned.
    let start = len.saturating_sub(TAIL_BYTES) & !1;
    file.seek(SeekFrom::Start(start)).ok()?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).ok()?;
    Some(decode_log_bytes(&bytes))
}

/// Count created and finished logs among `log_paths`.
#[must_use]
pub fn scan(log_paths: &[PathBuf]) -> ProgressSnapshot {
    let mut snapshot = ProgressSnapshot {
        total: log_paths.len(),
        ..ProgressSnapshot::default()
    };
    for path in log_paths.iter().filter(|p| p.is_file()) {
        snapshot.created += 1;
        if log_finished(path) {
            snapshot.finished += 1;
        }
    }
    snapshot
}

/// Handle to a running progress thread.
#[derive(Debug)]
pub struct ProgressReporter {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<ProgressSnapshot>>,
}

impl ProgressReporter {
    /// Start reporting on `log_paths` every `interval`.
    #[must_use]
    pub fn spawn(log_paths: Vec<PathBuf>, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let snapshot = scan(&log_paths);
                    info!(
                        created = snapshot.created,
                        finished = snapshot.finished,
                        total = snapshot.total,
                        "progress"
                    );
                    if snapshot.is_complete() {
                        return snapshot;
                    }
                }
                scan(&log_paths)
            })
            .ok();
        Self {
            stop: Some(tx),
            handle,
        }
    }

    /// Stop the reporter and return its final counts.
    pub fn stop(mut self) -> Option<ProgressSnapshot> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<ProgressSnapshot> {
        drop(self.stop.take());
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_counts() {
        let dir = tempfile::tempdir().unwrap();
        let done = dir.path().join("a.log");
        let running = dir.path().join("b.log");
        let missing = dir.path().join("c.log");
        std::fs::write(&done, "POC 0\n Total Time: 1.0 sec. [user] 1.1 sec. [elapsed]\n").unwrap();
        std::fs::write(&running, "POC 0\n").unwrap();

        let snapshot = scan(&[done, running, missing]);
        assert_eq!(
            snapshot,
            ProgressSnapshot {
                created: 2,
                finished: 1,
                total: 3
            }
        );
        assert!(!snapshot.is_complete());
    }

    #[test]
    fn test_marker_only_in_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.log");
        let mut text = String::from(" Total Time: 1.0 sec.\n");
        text.push_str(&"x".repeat(TAIL_BYTES as usize + 10));
        std::fs::write(&path, text).unwrap();
        assert!(!log_finished(&path));
    }

    #[test]
    fn test_utf16_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.log");
        let bytes: Vec<u8> = " Total Time: 2.0 sec.\n"
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect();
        std::fs::write(&path, bytes).unwrap();
        assert!(log_finished(&path));
    }

    #[test]
    fn test_reporter_stop_returns_counts() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = ProgressReporter::spawn(vec![dir.path().join("x.log")], Duration::from_secs(3600));
        let snapshot = reporter.stop().unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.created, 0);
    }

    #[test]
    fn test_reporter_finishes_when_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("enc.log");
        std::fs::write(&path, "Total Time: 1 sec.").unwrap();
        let reporter = ProgressReporter::spawn(vec![path], Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(100));
        let snapshot = reporter.stop().unwrap();
        assert!(snapshot.is_complete());
    }
}
