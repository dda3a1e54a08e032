//! Collect command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use codec_ablate::run::collect::collect_logs;
use codec_ablate::run::{JobStatus, LEDGER_FILE_NAME, ResultsLedger};

pub fn run(root: &Path, output: Option<PathBuf>, fps: u32) -> Result<()> {
    let rows = collect_logs(root, fps)
        .with_context(|| format!("Failed to collect logs under {}", root.display()))?;

    let path = output.unwrap_or_else(|| root.join(LEDGER_FILE_NAME));
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
    }
    let ledger = ResultsLedger::open(&path)?;
    for row in &rows {
        ledger.append(row)?;
    }

    let done = rows.iter().filter(|r| r.status == JobStatus::Done).count();
    let with_metrics = rows.iter().filter(|r| r.rd_point().is_some()).count();
    println!("Collected {} logs ({} complete, {} with RD metrics)", rows.len(), done, with_metrics);
    println!("Ledger written to: {}", path.display());
    Ok(())
}
