//! Bounded-concurrency execution of planned jobs.
//!
//! [`Runner`] drives the encoder over a job list on a dedicated rayon pool
//! with exactly `max_parallel` threads. Each job occupies one pool thread for
//! the lifetime of its encoder process, which caps simultaneous processes.
//! After a job ends its log goes through the metric extractor and a
//! [`JobResult`] row is appended to the [`ResultsLedger`].
//!
//! Encoder failures never abort a batch: they are recorded as
//! [`JobStatus::Failed`], [`JobStatus::Timeout`] or [`JobStatus::SpawnError`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use codec_ablate::run::{RunConfig, Runner};
//!
//! let config = RunConfig::builder()
//!     .max_parallel(8)
//!     .timeout(Duration::from_secs(3600))
//!     .build();
//! let summary = Runner::new(config).run(&spec, &jobs)?;
//! println!("{} done, {} failed", summary.done, summary.failed);
//! ```

pub mod collect;
pub mod invoke;
pub mod ledger;
pub mod progress;

pub use invoke::{EncodeOutcome, Encoder, Invocation, ProcessEncoder};
pub use ledger::ResultsLedger;
pub use progress::{ProgressReporter, ProgressSnapshot};

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::experiment::plan::{Job, JobId};
use crate::experiment::{ExperimentSpec, Group};
use crate::metrics::{ExtractContext, LogMetrics, MetricExtractor};
use crate::stats::RdPoint;

/// File name of the results ledger inside the output directory.
pub const LEDGER_FILE_NAME: &str = "results.csv";

/// File name of the run summary inside the output directory.
pub const SUMMARY_FILE_NAME: &str = "run_summary.json";

/// Upper bound for the default worker count.
const DEFAULT_MAX_PARALLEL_CAP: usize = 16;

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// The encoder exited with code zero.
    Done,
    /// The encoder exited non-zero or was terminated by a signal.
    Failed,
    /// The encoder exceeded its timeout and was killed.
    Timeout,
    /// The encoder could not be started.
    SpawnError,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Timeout => "TIMEOUT",
            Self::SpawnError => "SPAWN_ERROR",
        };
        f.write_str(s)
    }
}

/// One ledger row: a job identity with its outcome and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Job group.
    pub group: Group,
    /// Tool variant or baseline name.
    pub tool: String,
    /// Sequence name.
    pub sequence: String,
    /// Quantization parameter.
    pub qp: i32,
    /// Average bitrate in kbps.
    pub bitrate_kbps: Option<f64>,
    /// Luma PSNR in dB.
    pub psnr_y: Option<f64>,
    /// Cb PSNR in dB.
    pub psnr_u: Option<f64>,
    /// Cr PSNR in dB.
    pub psnr_v: Option<f64>,
    /// Combined PSNR in dB.
    pub psnr_yuv: Option<f64>,
    /// Encode time in seconds.
    pub encode_time_s: Option<f64>,
    /// Process exit code.
    pub exit_code: Option<i32>,
    /// Terminal state.
    pub status: JobStatus,
    /// Encoder log path.
    pub log_path: PathBuf,
}

impl JobResult {
    /// Assemble a row from an identity, metrics and outcome.
    #[must_use]
    pub fn new(
        id: &JobId,
        metrics: &LogMetrics,
        exit_code: Option<i32>,
        status: JobStatus,
        log_path: &Path,
    ) -> Self {
        Self {
            group: id.group,
            tool: id.tool.clone(),
            sequence: id.sequence.clone(),
            qp: id.qp,
            bitrate_kbps: metrics.bitrate_kbps,
            psnr_y: metrics.psnr_y,
            psnr_u: metrics.psnr_u,
            psnr_v: metrics.psnr_v,
            psnr_yuv: metrics.psnr_yuv,
            encode_time_s: metrics.encode_time_s,
            exit_code,
            status,
            log_path: log_path.to_path_buf(),
        }
    }

    /// Job identity of this row.
    #[must_use]
    pub fn id(&self) -> JobId {
        JobId {
            group: self.group,
            tool: self.tool.clone(),
            sequence: self.sequence.clone(),
            qp: self.qp,
        }
    }

    /// Rate-distortion point, when both bitrate and luma PSNR are known.
    #[must_use]
    pub fn rd_point(&self) -> Option<RdPoint> {
        Some(RdPoint::new(self.bitrate_kbps?, self.psnr_y?))
    }
}

/// Keep only the last row recorded for each log path, in first-seen order.
///
/// The ledger is append-only, so a rerun adds a newer row for the same job.
#[must_use]
pub fn latest_results(rows: Vec<JobResult>) -> Vec<JobResult> {
    let mut seen = HashSet::new();
    let mut latest: Vec<JobResult> = rows
        .into_iter()
        .rev()
        .filter(|row| seen.insert(row.log_path.clone()))
        .collect();
    latest.reverse();
    latest
}

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of concurrent encoder processes.
    pub max_parallel: usize,

    /// Per-job time limit.
    pub timeout: Option<Duration>,

    /// How often the progress reporter scans logs.
    pub progress_interval: Duration,

    /// Exported to the encoder as `OMP_NUM_THREADS`.
    pub encoder_threads: Option<usize>,

    /// Discard bitstreams by writing them to the platform null sink.
    pub null_bitstream: bool,

    /// Encode this many frames instead of each sequence's frame count.
    pub frames_override: Option<u32>,

    /// Skip jobs already recorded as `DONE` in the ledger.
    pub resume: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }
}

/// Default worker count: available cores, capped at 16.
#[must_use]
pub fn default_max_parallel() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .min(DEFAULT_MAX_PARALLEL_CAP)
}

/// Builder for [`RunConfig`].
#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    max_parallel: Option<usize>,
    timeout: Option<Duration>,
    progress_interval: Option<Duration>,
    encoder_threads: Option<usize>,
    null_bitstream: bool,
    frames_override: Option<u32>,
    resume: bool,
}

impl RunConfigBuilder {
    /// Set the maximum number of concurrent encoder processes.
    #[must_use]
    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = Some(n);
        self
    }

    /// Set the per-job time limit.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the progress scan interval.
    #[must_use]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = Some(interval);
        self
    }

    /// Set the encoder's internal thread count.
    #[must_use]
    pub fn encoder_threads(mut self, threads: usize) -> Self {
        self.encoder_threads = Some(threads);
        self
    }

    /// Discard bitstreams.
    #[must_use]
    pub fn null_bitstream(mut self, enabled: bool) -> Self {
        self.null_bitstream = enabled;
        self
    }

    /// Override the number of frames encoded per job.
    #[must_use]
    pub fn frames_override(mut self, frames: u32) -> Self {
        self.frames_override = Some(frames);
        self
    }

    /// Skip jobs already completed in an earlier run.
    #[must_use]
    pub fn resume(mut self, enabled: bool) -> Self {
        self.resume = enabled;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RunConfig {
        RunConfig {
            max_parallel: self.max_parallel.unwrap_or_else(default_max_parallel).max(1),
            timeout: self.timeout,
            progress_interval: self.progress_interval.unwrap_or(Duration::from_secs(10)),
            encoder_threads: self.encoder_threads,
            null_bitstream: self.null_bitstream,
            frames_override: self.frames_override,
            resume: self.resume,
        }
    }
}

/// Counts and timing for a finished run. Also written as `run_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the last job finished.
    pub finished_at: DateTime<Utc>,
    /// Jobs handed to the runner.
    pub total: usize,
    /// Jobs skipped because the ledger already had them as `DONE`.
    pub skipped: usize,
    /// Jobs that exited successfully.
    pub done: usize,
    /// Jobs that exited non-zero.
    pub failed: usize,
    /// Jobs killed at their timeout.
    pub timed_out: usize,
    /// Jobs whose encoder could not be started.
    pub spawn_errors: usize,
    /// Executed jobs whose log yielded a rate-distortion point.
    pub with_metrics: usize,
    /// Ledger the rows were appended to.
    pub ledger_path: PathBuf,
}

impl RunSummary {
    fn new(started_at: DateTime<Utc>, total: usize, skipped: usize, ledger_path: &Path) -> Self {
        Self {
            started_at,
            finished_at: started_at,
            total,
            skipped,
            done: 0,
            failed: 0,
            timed_out: 0,
            spawn_errors: 0,
            with_metrics: 0,
            ledger_path: ledger_path.to_path_buf(),
        }
    }

    fn record(&mut self, result: &JobResult) {
        match result.status {
            JobStatus::Done => self.done += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Timeout => self.timed_out += 1,
            JobStatus::SpawnError => self.spawn_errors += 1,
        }
        if result.rd_point().is_some() {
            self.with_metrics += 1;
        }
    }

    /// Number of jobs executed in this run.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.done + self.failed + self.timed_out + self.spawn_errors
    }
}

/// Executes jobs against an encoder.
pub struct Runner {
    config: RunConfig,
    encoder: Box<dyn Encoder>,
    extractor: MetricExtractor,
}

impl Runner {
    /// Create a runner that spawns encoder processes.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self::with_encoder(config, ProcessEncoder::default())
    }

    /// Create a runner with a custom encoder.
    #[must_use]
    pub fn with_encoder(config: RunConfig, encoder: impl Encoder + 'static) -> Self {
        Self {
            config,
            encoder: Box::new(encoder),
            extractor: MetricExtractor::default(),
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every job and append one ledger row per executed job.
    ///
    /// Returns an error only for problems outside individual jobs: the
    /// output directory, the ledger or the worker pool.
    pub fn run(&self, spec: &ExperimentSpec, jobs: &[Job]) -> Result<RunSummary> {
        std::fs::create_dir_all(&spec.output_dir)?;
        let ledger_path = spec.output_dir.join(LEDGER_FILE_NAME);

        let completed: HashSet<PathBuf> = if self.config.resume && ledger_path.exists() {
            ResultsLedger::load(&ledger_path)?
                .into_iter()
                .filter(|row| row.status == JobStatus::Done)
                .map(|row| row.log_path)
                .collect()
        } else {
            HashSet::new()
        };
        let pending: Vec<&Job> = jobs
            .iter()
            .filter(|job| !completed.contains(&job.log_path))
            .collect();
        let skipped = jobs.len() - pending.len();

        let ledger = ResultsLedger::open(&ledger_path)?;
        let mut summary = RunSummary::new(Utc::now(), jobs.len(), skipped, &ledger_path);
        info!(
            jobs = pending.len(),
            skipped,
            max_parallel = self.config.max_parallel,
            ledger = %ledger_path.display(),
            "starting run"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_parallel)
            .thread_name(|i| format!("encode-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        let log_paths = pending.iter().map(|job| job.log_path.clone()).collect();
        let progress = ProgressReporter::spawn(log_paths, self.config.progress_interval);

        let results: Result<Vec<JobResult>> = pool.install(|| {
            pending
                .par_iter()
                .map(|job| self.execute(spec, job, &ledger))
                .collect()
        });

        progress.stop();
        let results = results?;

        for result in &results {
            summary.record(result);
        }
        summary.finished_at = Utc::now();

        let summary_path = spec.output_dir.join(SUMMARY_FILE_NAME);
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

        info!(
            done = summary.done,
            failed = summary.failed,
            timed_out = summary.timed_out,
            spawn_errors = summary.spawn_errors,
            with_metrics = summary.with_metrics,
            "run finished"
        );
        Ok(summary)
    }

    fn execute(&self, spec: &ExperimentSpec, job: &Job, ledger: &ResultsLedger) -> Result<JobResult> {
        let invocation = Invocation::for_job(spec, job, &self.config);
        debug!(job = %job.id, command = %invocation, "launching encoder");

        let started = Instant::now();
        let outcome = std::fs::create_dir_all(&job.output_dir)
            .map_err(Error::from)
            .and_then(|()| self.encoder.encode(&invocation, &job.log_path, self.config.timeout));

        let (status, exit_code, elapsed) = match outcome {
            Ok(outcome) if outcome.timed_out => (JobStatus::Timeout, outcome.exit_code, outcome.elapsed),
            Ok(outcome) if outcome.success() => (JobStatus::Done, outcome.exit_code, outcome.elapsed),
            Ok(outcome) => (JobStatus::Failed, outcome.exit_code, outcome.elapsed),
            Err(e) => {
                warn!(job = %job.id, error = %e, "failed to start encoder");
                (JobStatus::SpawnError, None, started.elapsed())
            }
        };

        let ctx = ExtractContext::new(&job.sequence.name, job.sequence.frame_rate);
        let mut metrics = self.extractor.extract_file(&job.log_path, &ctx);
        if metrics.encode_time_s.is_none() {
            metrics.encode_time_s = Some(elapsed.as_secs_f64());
        }

        match status {
            JobStatus::Done if !metrics.has_rd_point() => {
                warn!(job = %job.id, log = %job.log_path.display(), "no rate-distortion metrics in log");
            }
            JobStatus::Done => {
                debug!(job = %job.id, seconds = elapsed.as_secs_f64(), "job finished");
            }
            JobStatus::Failed | JobStatus::Timeout => {
                warn!(
                    job = %job.id,
                    status = %status,
                    exit_code = ?exit_code,
                    log = %job.log_path.display(),
                    "encode did not complete"
                );
            }
            JobStatus::SpawnError => {}
        }

        let result = JobResult::new(&job.id, &metrics, exit_code, status, &job.log_path);
        ledger.append(&result)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::{PlanOptions, plan};
    use crate::experiment::tests::sample_spec;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAKE_LOG: &str = "\
\tTotal Frames |   Bitrate     Y-PSNR    U-PSNR    V-PSNR    YUV-PSNR
\t        8    a    1000.0000   36.0000   40.0000   41.0000   37.0000
 Total Time:       1.000 sec. [user]       1.250 sec. [elapsed]
";

    /// Writes a canned log and tracks how many encodes overlap.
    #[derive(Default)]
    struct FakeEncoder {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_tool: Option<String>,
    }

    impl Encoder for FakeEncoder {
        fn encode(
            &self,
            _invocation: &Invocation,
            log_path: &Path,
            _timeout: Option<Duration>,
        ) -> Result<EncodeOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));

            let path = log_path.to_string_lossy().into_owned();
            let failing = self
                .fail_tool
                .as_deref()
                .is_some_and(|tool| path.contains(tool));
            std::fs::write(log_path, if failing { "boom\n" } else { FAKE_LOG })?;

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(EncodeOutcome {
                exit_code: Some(if failing { 1 } else { 0 }),
                timed_out: false,
                elapsed: Duration::from_millis(20),
            })
        }
    }

    fn spec_in(dir: &Path) -> ExperimentSpec {
        let mut spec = sample_spec();
        spec.output_dir = dir.to_path_buf();
        spec
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::default();
        assert!(config.max_parallel >= 1 && config.max_parallel <= 16);
        assert_eq!(config.progress_interval, Duration::from_secs(10));
        assert!(config.timeout.is_none());
        assert_eq!(RunConfig::builder().max_parallel(0).build().max_parallel, 1);
    }

    #[test]
    fn test_concurrency_cap() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(dir.path());
        let jobs: Vec<Job> = plan(&spec, &PlanOptions::default())
            .unwrap()
            .into_iter()
            .take(10)
            .collect();

        let encoder = Arc::new(FakeEncoder::default());

        let config = RunConfig::builder()
            .max_parallel(3)
            .progress_interval(Duration::from_millis(5))
            .build();
        let summary = Runner::with_encoder(config, Arc::clone(&encoder))
            .run(&spec, &jobs)
            .unwrap();

        assert_eq!(encoder.calls.load(Ordering::SeqCst), 10);
        assert!(encoder.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(summary.done, 10);
        assert_eq!(summary.with_metrics, 10);

        let rows = ResultsLedger::load(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|r| r.bitrate_kbps == Some(1000.0)));
        assert!(rows.iter().all(|r| r.encode_time_s == Some(1.25)));
        assert!(dir.path().join(SUMMARY_FILE_NAME).exists());
    }

    #[test]
    fn test_failures_recorded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(dir.path());
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        let encoder = FakeEncoder {
            fail_tool: Some("ABLATE_SAO".to_string()),
            ..FakeEncoder::default()
        };

        let summary = Runner::with_encoder(RunConfig::builder().max_parallel(4).build(), encoder)
            .run(&spec, &jobs)
            .unwrap();
        assert_eq!(summary.failed, 8);
        assert_eq!(summary.done, jobs.len() - 8);

        let rows = ResultsLedger::load(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let failed: Vec<_> = rows.iter().filter(|r| r.status == JobStatus::Failed).collect();
        assert_eq!(failed.len(), 8);
        assert!(failed.iter().all(|r| r.tool == "ABLATE_SAO" && r.exit_code == Some(1)));
        assert!(failed.iter().all(|r| r.bitrate_kbps.is_none() && r.psnr_y.is_none()));
    }

    #[test]
    fn test_resume_skips_done_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_in(dir.path());
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        let config = || RunConfig::builder().max_parallel(2).resume(true).build();

        Runner::with_encoder(config(), FakeEncoder::default())
            .run(&spec, &jobs[..5])
            .unwrap();

        let encoder = Arc::new(FakeEncoder::default());
        let summary = Runner::with_encoder(config(), Arc::clone(&encoder))
            .run(&spec, &jobs[..8])
            .unwrap();
        assert_eq!(summary.skipped, 5);
        assert_eq!(summary.executed(), 3);
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);

        let rows = ResultsLedger::load(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        assert_eq!(rows.len(), 8);
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_in(dir.path());
        // `/bin/sh -c <script> -i <input> ...`: the config slot carries the
        // script and the input path lands in `$1`.
        spec.encoder_binary = PathBuf::from("/bin/sh");
        spec.base_config =
            "case \"$1\" in *Horses*) sleep 5 ;; *) echo 'Total Time: 0.1 sec.' ;; esac".to_string();
        let jobs: Vec<Job> = plan(&spec, &PlanOptions::default())
            .unwrap()
            .into_iter()
            .filter(|j| j.id.qp == 37 && j.id.group == Group::Baseline && j.id.tool == "Baseline_Ref")
            .collect();
        assert_eq!(jobs.len(), 2);

        let config = RunConfig::builder()
            .max_parallel(2)
            .timeout(Duration::from_millis(300))
            .build();
        let summary = Runner::new(config).run(&spec, &jobs).unwrap();
        assert_eq!(summary.timed_out, 1);
        assert_eq!(summary.done, 1);

        let rows = ResultsLedger::load(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let timed_out = rows.iter().find(|r| r.status == JobStatus::Timeout).unwrap();
        assert!(timed_out.sequence.starts_with("RaceHorses"));
        let done = rows.iter().find(|r| r.status == JobStatus::Done).unwrap();
        assert_eq!(done.encode_time_s, Some(0.1));
    }

    #[test]
    fn test_latest_results_keeps_last_row_per_log() {
        let row = |qp: i32, status: JobStatus| JobResult {
            group: Group::PerfAblate,
            tool: "ABLATE_ALF".to_string(),
            sequence: "S".to_string(),
            qp,
            bitrate_kbps: None,
            psnr_y: None,
            psnr_u: None,
            psnr_v: None,
            psnr_yuv: None,
            encode_time_s: None,
            exit_code: None,
            status,
            log_path: PathBuf::from(format!("QP{qp}/enc.log")),
        };
        let rows = vec![
            row(22, JobStatus::Failed),
            row(27, JobStatus::Done),
            row(22, JobStatus::Done),
        ];
        let latest = latest_results(rows);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].qp, 27);
        assert_eq!(latest[1].status, JobStatus::Done);
    }
}
