//! Append-only CSV results ledger.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::Result;

use super::JobResult;

/// CSV ledger shared by all workers.
///
/// Rows are written under a single lock and flushed one at a time, so an
/// interrupted run leaves a valid prefix. The header is written only when
/// the file is new or empty.
#[derive(Debug)]
pub struct ResultsLedger {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
}

impl ResultsLedger {
    /// Open (or create) a ledger for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
        })
    }

    /// Ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row and flush it to disk.
    pub fn append(&self, row: &JobResult) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }

    /// Read every row of an existing ledger.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<JobResult>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::Group;
    use crate::run::JobStatus;

    fn row(qp: i32, bitrate: Option<f64>) -> JobResult {
        JobResult {
            group: Group::PerfAdd,
            tool: "ADD_ALF".to_string(),
            sequence: "RaceHorses_416x240_30".to_string(),
            qp,
            bitrate_kbps: bitrate,
            psnr_y: bitrate.map(|_| 35.25),
            psnr_u: None,
            psnr_v: None,
            psnr_yuv: None,
            encode_time_s: Some(12.5),
            exit_code: Some(0),
            status: JobStatus::Done,
            log_path: PathBuf::from(format!("out/perf_add/ADD_ALF/RaceHorses_416x240_30/QP{qp}/enc.log")),
        }
    }

    #[test]
    fn test_round_trip_keeps_unknowns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let rows = vec![row(22, Some(812.5)), row(27, None)];

        let ledger = ResultsLedger::open(&path).unwrap();
        for r in &rows {
            ledger.append(r).unwrap();
        }
        drop(ledger);

        let loaded = ResultsLedger::load(&path).unwrap();
        assert_eq!(loaded, rows);
        assert_eq!(loaded[1].bitrate_kbps, None);
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");

        ResultsLedger::open(&path).unwrap().append(&row(22, Some(1.0))).unwrap();
        ResultsLedger::open(&path).unwrap().append(&row(27, Some(2.0))).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("bitrate_kbps").count(), 1);
        assert!(text.starts_with("group,tool,sequence,qp,bitrate_kbps,psnr_y,psnr_u,psnr_v,psnr_yuv,encode_time_s,exit_code,status,log_path"));
        assert_eq!(ResultsLedger::load(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_status_and_group_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let mut timed_out = row(32, None);
        timed_out.status = JobStatus::Timeout;
        timed_out.exit_code = None;
        ResultsLedger::open(&path).unwrap().append(&timed_out).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let data = text.lines().nth(1).unwrap();
        assert!(data.starts_with("perf_add,ADD_ALF,RaceHorses_416x240_30,32,,,,,,12.5,,TIMEOUT,"));
    }

    #[test]
    fn test_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let ledger = ResultsLedger::open(&path).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let ledger = &ledger;
                s.spawn(move || {
                    for i in 0..25 {
                        ledger.append(&row(t * 100 + i, Some(1.0))).unwrap();
                    }
                });
            }
        });
        assert_eq!(ResultsLedger::load(&path).unwrap().len(), 100);
    }
}
