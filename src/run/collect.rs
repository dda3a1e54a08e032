//! Rebuild result rows from an existing output tree.
//!
//! Logs are expected at `<root>/<group>/<tool>/<sequence>/QP<qp>/*.log`,
//! the layout the planner assigns. Files elsewhere are ignored.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::experiment::Group;
use crate::experiment::plan::JobId;
use crate::metrics::{
    ExtractContext, LogMetrics, MetricExtractor, TERMINAL_MARKER, decode_log_bytes,
};

use super::{JobResult, JobStatus};

/// Scan `root` for encoder logs and extract one row per log.
///
/// Rows whose log contains the terminal marker get [`JobStatus::Done`],
/// others [`JobStatus::Failed`]. A log that cannot be read becomes a failed
/// row with unknown metrics. Exit codes are unknown. Rows come back
/// sorted by job identity.
pub fn collect_logs(root: &Path, fps_default: u32) -> Result<Vec<JobResult>> {
    if !root.is_dir() {
        return Err(Error::Config(format!(
            "output directory does not exist: {}",
            root.display()
        )));
    }

    let extractor = MetricExtractor::default();
    let mut rows = Vec::new();
    collect_recursive(root, root, &extractor, fps_default, &mut rows)?;
    rows.sort_by(|a, b| a.id().cmp(&b.id()).then_with(|| a.log_path.cmp(&b.log_path)));

    info!(root = %root.display(), rows = rows.len(), "collected logs");
    Ok(rows)
}

fn collect_recursive(
    root: &Path,
    current: &Path,
    extractor: &MetricExtractor,
    fps_default: u32,
    rows: &mut Vec<JobResult>,
) -> Result<()> {
    for entry in fs::read_dir(current)? {
        let path = entry?.path();
        if path.is_dir() {
            if path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|s| s.starts_with('.'))
            {
                continue;
            }
            collect_recursive(root, &path, extractor, fps_default, rows)?;
        } else if path.extension().is_some_and(|e| e == "log") {
            if let Some(row) = read_log(root, &path, extractor, fps_default)? {
                rows.push(row);
            }
        }
    }
    Ok(())
}

fn read_log(
    root: &Path,
    path: &Path,
    extractor: &MetricExtractor,
    fps_default: u32,
) -> Result<Option<JobResult>> {
    let Some(id) = job_id_from_path(root, path) else {
        debug!(path = %path.display(), "log outside job layout");
        return Ok(None);
    };

    let text = match fs::read(path) {
        Ok(bytes) => decode_log_bytes(&bytes),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable log recorded as failed");
            let row = JobResult::new(&id, &LogMetrics::default(), None, JobStatus::Failed, path);
            return Ok(Some(row));
        }
    };
    let metrics = extractor.extract(&text, &ExtractContext::new(&id.sequence, fps_default));
    let status = if text.contains(TERMINAL_MARKER) {
        JobStatus::Done
    } else {
        JobStatus::Failed
    };
    Ok(Some(JobResult::new(&id, &metrics, None, status, path)))
}

/// Recover a job identity from `<group>/<tool>/<sequence>/QP<qp>/<file>`.
fn job_id_from_path(root: &Path, path: &Path) -> Option<JobId> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .iter()
        .map(|c| c.to_str())
        .collect::<Option<_>>()?;
    let [group, tool, sequence, qp_dir, _file] = parts.as_slice() else {
        return None;
    };
    let qp = qp_dir.strip_prefix("QP")?.parse().ok()?;
    Some(JobId {
        group: Group::parse(group)?,
        tool: (*tool).to_string(),
        sequence: (*sequence).to_string(),
        qp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
\tTotal Frames |   Bitrate     Y-PSNR    U-PSNR    V-PSNR    YUV-PSNR
\t        8    a     512.2500   34.5000   40.0000   41.0000   36.0000
 Total Time:       3.000 sec. [user]       3.500 sec. [elapsed]
";

    fn write(root: &Path, relative: &str, text: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_collects_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "perf_ablate/ABLATE_ALF/RaceHorses_416x240_30/QP32/enc.log", LOG);
        write(root, "baseline/Baseline_Ref/RaceHorses_416x240_30/QP22/enc.log", LOG);
        write(root, "baselines/Baseline_Min/RaceHorses_416x240_30/QP27/enc.log", "POC 0\n");
        write(root, "perf_ablate/ABLATE_ALF/notes.log", LOG);
        write(root, "perf_ablate/ABLATE_ALF/RaceHorses_416x240_30/QP32/enc.bin", "");
        write(root, ".hidden/x/y/QP1/enc.log", LOG);

        let rows = collect_logs(root, 30).unwrap();
        assert_eq!(rows.len(), 3);

        assert_eq!(rows[0].group, Group::Baseline);
        assert_eq!(rows[0].tool, "Baseline_Min");
        assert_eq!(rows[0].status, JobStatus::Failed);
        assert!(rows[0].rd_point().is_none());

        assert_eq!(rows[1].tool, "Baseline_Ref");
        assert_eq!(rows[1].qp, 22);
        assert_eq!(rows[1].status, JobStatus::Done);
        assert_eq!(rows[1].bitrate_kbps, Some(512.25));
        assert_eq!(rows[1].encode_time_s, Some(3.5));
        assert_eq!(rows[1].exit_code, None);

        assert_eq!(rows[2].group, Group::PerfAblate);
        assert_eq!(rows[2].qp, 32);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_log_is_failed_row() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "perf_add/ADD_ALF/S1/QP22/enc.log", LOG);
        let dangling = root.join("perf_add/ADD_ALF/S1/QP27/enc.log");
        fs::create_dir_all(dangling.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink(root.join("gone.log"), &dangling).unwrap();

        let rows = collect_logs(root, 30).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].qp, 22);
        assert_eq!(rows[0].status, JobStatus::Done);
        assert_eq!(rows[0].bitrate_kbps, Some(512.25));
        assert_eq!(rows[1].qp, 27);
        assert_eq!(rows[1].status, JobStatus::Failed);
        assert_eq!(rows[1].bitrate_kbps, None);
        assert_eq!(rows[1].log_path, dangling);
    }

    #[test]
    fn test_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(collect_logs(&dir.path().join("nope"), 30).is_err());
    }

    #[test]
    fn test_job_id_from_path() {
        let root = Path::new("/out");
        let id = job_id_from_path(root, Path::new("/out/speed_add/ADD_X/Seq_60/QP27/enc.log")).unwrap();
        assert_eq!(id.group, Group::SpeedAdd);
        assert_eq!(id.qp, 27);
        assert!(job_id_from_path(root, Path::new("/out/speed_add/ADD_X/Seq_60/Q27/enc.log")).is_none());
        assert!(job_id_from_path(root, Path::new("/out/other/ADD_X/Seq_60/QP27/enc.log")).is_none());
    }
}
