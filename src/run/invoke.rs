//! Encoder process invocation.
//!
//! The encoder is started from an argument vector, never through a shell.
//! Its stdout and stderr share the job's log file.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::experiment::ExperimentSpec;
use crate::experiment::plan::Job;

use super::RunConfig;

/// Platform bitstream sink used when bitstreams are not kept.
pub const NULL_SINK: &str = if cfg!(windows) { "NUL" } else { "/dev/null" };

/// A fully resolved encoder command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Encoder executable.
    pub program: PathBuf,
    /// Arguments, one token each.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Build the command line for a planned job.
    ///
    /// `<bin> -c <cfg> -i <input> -wdt <w> -hgt <h> -fr <fps> -f <frames> -q <qp>
    /// -b <bitstream> <resolved_args...>`, where the resolved arguments start
    /// with the experiment's fixed arguments.
    #[must_use]
    pub fn for_job(spec: &ExperimentSpec, job: &Job, config: &RunConfig) -> Self {
        let seq = &job.sequence;
        let frames = config.frames_override.unwrap_or(seq.frame_count);
        let bitstream = if config.null_bitstream {
            NULL_SINK.to_string()
        } else {
            job.bitstream_path.to_string_lossy().into_owned()
        };

        let mut args = vec![
            "-c".to_string(),
            spec.base_config.clone(),
            "-i".to_string(),
            seq.media_locator.clone(),
            "-wdt".to_string(),
            seq.width.to_string(),
            "-hgt".to_string(),
            seq.height.to_string(),
            "-fr".to_string(),
            seq.frame_rate.to_string(),
            "-f".to_string(),
            frames.to_string(),
            "-q".to_string(),
            job.id.qp.to_string(),
            "-b".to_string(),
            bitstream,
        ];
        args.extend(job.args.iter().cloned());

        let mut env = Vec::new();
        if let Some(threads) = config.encoder_threads {
            env.push(("OMP_NUM_THREADS".to_string(), threads.to_string()));
        }

        Self {
            program: spec.encoder_binary.clone(),
            args,
            env,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// How an encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOutcome {
    /// Exit code; `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Whether the process was killed for exceeding its timeout.
    pub timed_out: bool,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
}

impl EncodeOutcome {
    /// Exit code zero within the time limit.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Something that can run an encoder invocation.
pub trait Encoder: Send + Sync {
    /// Run `invocation`, writing combined output to `log_path`.
    ///
    /// An `Err` means the process could not be started at all.
    fn encode(
        &self,
        invocation: &Invocation,
        log_path: &Path,
        timeout: Option<Duration>,
    ) -> Result<EncodeOutcome>;
}

impl<E: Encoder + ?Sized> Encoder for std::sync::Arc<E> {
    fn encode(
        &self,
        invocation: &Invocation,
        log_path: &Path,
        timeout: Option<Duration>,
    ) -> Result<EncodeOutcome> {
        (**self).encode(invocation, log_path, timeout)
    }
}

/// Runs the encoder as a child process.
#[derive(Debug, Clone)]
pub struct ProcessEncoder {
    poll_interval: Duration,
}

impl Default for ProcessEncoder {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl ProcessEncoder {
    /// Create an encoder that checks for timeouts every `poll_interval`.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl Encoder for ProcessEncoder {
    fn encode(
        &self,
        invocation: &Invocation,
        log_path: &Path,
        timeout: Option<Duration>,
    ) -> Result<EncodeOutcome> {
        let log = File::create(log_path)?;
        let log_err = log.try_clone()?;

        let started = Instant::now();
        let mut child = ChildGuard::new(
            Command::new(&invocation.program)
                .args(&invocation.args)
                .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err))
                .spawn()?,
        );

        let Some(limit) = timeout else {
            let status = child.wait()?;
            return Ok(EncodeOutcome {
                exit_code: status.code(),
                timed_out: false,
                elapsed: started.elapsed(),
            });
        };

        let deadline = started + limit;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(EncodeOutcome {
                    exit_code: status.code(),
                    timed_out: false,
                    elapsed: started.elapsed(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                // The child may exit between try_wait and kill.
                child.kill();
                let status = child.wait()?;
                return Ok(EncodeOutcome {
                    exit_code: status.code(),
                    timed_out: true,
                    elapsed: started.elapsed(),
                });
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

/// Owns a running encoder process; kills and reaps it on drop unless it
/// was already waited on.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::{PlanOptions, plan};
    use crate::experiment::tests::sample_spec;

    #[test]
    fn test_invocation_layout() {
        let spec = sample_spec();
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        let job = jobs.iter().find(|j| j.id.tool == "ADD_ALF").unwrap();
        let config = RunConfig::builder().encoder_threads(2).build();

        let inv = Invocation::for_job(&spec, job, &config);
        assert_eq!(inv.program, PathBuf::from("/opt/vtm/EncoderApp"));
        assert_eq!(&inv.args[..2], ["-c", "cfg/encoder_randomaccess_vtm.cfg"]);
        let pos = |flag: &str| inv.args.iter().position(|a| a == flag).unwrap();
        assert_eq!(inv.args[pos("-wdt") + 1], job.sequence.width.to_string());
        assert_eq!(inv.args[pos("-q") + 1], job.id.qp.to_string());
        assert_eq!(inv.args[pos("-b") + 1], job.bitstream_path.to_string_lossy());
        // fixed args precede resolved tool args
        let fixed = pos("--TemporalSubsampleRatio=8");
        assert!(fixed < pos("--ALF=1"));
        assert_eq!(inv.args.last().unwrap(), "--DepQuant=0");
        assert_eq!(inv.env, vec![("OMP_NUM_THREADS".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_invocation_overrides() {
        let spec = sample_spec();
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        let config = RunConfig::builder()
            .null_bitstream(true)
            .frames_override(8)
            .build();
        let inv = Invocation::for_job(&spec, &jobs[0], &config);
        let pos = |flag: &str| inv.args.iter().position(|a| a == flag).unwrap();
        assert_eq!(inv.args[pos("-b") + 1], NULL_SINK);
        assert_eq!(inv.args[pos("-f") + 1], "8");
        assert!(inv.env.is_empty());
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Invocation {
            program: dir.path().join("no-such-encoder"),
            args: vec![],
            env: vec![],
        };
        let result = ProcessEncoder::default().encode(&inv, &dir.path().join("enc.log"), None);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_process_output_goes_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("enc.log");
        let inv = Invocation {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".to_string(),
                "echo out; echo err 1>&2; exit 3".to_string(),
            ],
            env: vec![],
        };
        let outcome = ProcessEncoder::default().encode(&inv, &log, None).unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        let text = std::fs::read_to_string(&log).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let inv = Invocation {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            env: vec![],
        };
        let started = Instant::now();
        let outcome = ProcessEncoder::new(Duration::from_millis(10))
            .encode(&inv, &dir.path().join("enc.log"), Some(Duration::from_millis(200)))
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_dropped_guard_kills_child() {
        let child = Command::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        let started = Instant::now();
        drop(ChildGuard::new(child));
        assert!(started.elapsed() < Duration::from_secs(4));

        let alive = Command::new("/bin/sh")
            .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
            .status()
            .unwrap();
        assert!(!alive.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_waited_guard_leaves_status() {
        let child = Command::new("/bin/sh").args(["-c", "exit 4"]).spawn().unwrap();
        let mut guard = ChildGuard::new(child);
        assert_eq!(guard.wait().unwrap().code(), Some(4));
        assert!(guard.reaped);
    }

    #[test]
    fn test_display_quotes_spaces() {
        let inv = Invocation {
            program: PathBuf::from("enc"),
            args: vec!["-i".to_string(), "my clip.yuv".to_string()],
            env: vec![],
        };
        assert_eq!(inv.to_string(), "enc -i \"my clip.yuv\"");
    }
}
