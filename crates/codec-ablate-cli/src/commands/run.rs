//! Run command.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use codec_ablate::experiment::plan::plan;
use codec_ablate::run::{JobStatus, ResultsLedger, RunConfig, Runner, latest_results};
use codec_ablate::stats::Summary;

use super::{JobSelection, load_spec};

/// Execution options from the command line.
pub struct RunArgs {
    pub max_parallel: Option<usize>,
    pub timeout: Option<u64>,
    pub progress_interval: u64,
    pub encoder_threads: Option<usize>,
    pub null_bitstream: bool,
    pub frames: Option<u32>,
    pub resume: bool,
}

impl RunArgs {
    fn to_config(&self) -> RunConfig {
        let mut builder = RunConfig::builder()
            .progress_interval(Duration::from_secs(self.progress_interval.max(1)))
            .null_bitstream(self.null_bitstream)
            .resume(self.resume);
        if let Some(n) = self.max_parallel {
            builder = builder.max_parallel(n);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(threads) = self.encoder_threads {
            builder = builder.encoder_threads(threads);
        }
        if let Some(frames) = self.frames {
            builder = builder.frames_override(frames);
        }
        builder.build()
    }
}

pub fn run(spec_path: &Path, select: &JobSelection, args: RunArgs) -> Result<()> {
    let spec = load_spec(spec_path)?;
    let jobs = plan(&spec, &select.to_options()?).context("Failed to plan jobs")?;

    let summary = Runner::new(args.to_config())
        .run(&spec, &jobs)
        .context("Run failed")?;

    println!("Run Summary:");
    println!("{:-<40}", "");
    println!("  Jobs:          {}", summary.total);
    println!("  Skipped:       {}", summary.skipped);
    println!("  Done:          {}", summary.done);
    println!("  Failed:        {}", summary.failed);
    println!("  Timed out:     {}", summary.timed_out);
    println!("  Spawn errors:  {}", summary.spawn_errors);
    println!("  With metrics:  {}", summary.with_metrics);

    let rows = latest_results(ResultsLedger::load(&summary.ledger_path)?);
    let times: Vec<f64> = rows
        .iter()
        .filter(|r| r.status == JobStatus::Done)
        .filter_map(|r| r.encode_time_s)
        .collect();
    if let Some(t) = Summary::compute(&times) {
        println!("Encode time (s):");
        println!("  Mean: {:.1}, Median: {:.1}", t.mean, t.median);
        println!("  Min: {:.1}, Max: {:.1}", t.min, t.max);
    }
    println!("Ledger: {}", summary.ledger_path.display());

    Ok(())
}
