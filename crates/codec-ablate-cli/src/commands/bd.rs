//! BD-Rate command.

use std::path::Path;

use anyhow::{Context, Result};
use codec_ablate::analysis::report::{BD_SUMMARY_FILE, OVERVIEW_FILE, write_bd_summary, write_overview};
use codec_ablate::analysis::{AnalysisConfig, compute_bd_metrics, overview};
use codec_ablate::run::ResultsLedger;

use super::load_spec;

/// Anchor selection from the command line.
pub struct AnchorArgs {
    pub reference: Option<String>,
    pub minimal: Option<String>,
    pub strict: bool,
    pub fallback_to_reference: bool,
}

pub fn run(ledger: &Path, spec: Option<&Path>, out_dir: &Path, args: AnchorArgs) -> Result<()> {
    let mut config = match spec {
        Some(path) => AnalysisConfig::from_spec(&load_spec(path)?),
        None => AnalysisConfig::default(),
    };
    if let Some(name) = args.reference {
        config.reference_anchor = name;
    }
    if let Some(name) = args.minimal {
        config.minimal_anchor = name;
    }
    config.allow_two_qp = !args.strict;
    config.fallback_minimal_to_reference = args.fallback_to_reference;

    let rows = ResultsLedger::load(ledger)
        .with_context(|| format!("Failed to read ledger {}", ledger.display()))?;
    let metrics = compute_bd_metrics(&rows, &config);
    let overview = overview(&metrics);

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    write_bd_summary(&out_dir.join(BD_SUMMARY_FILE), &metrics)?;
    write_overview(&out_dir.join(OVERVIEW_FILE), &overview)?;

    println!("{:<15} {:<30} {:>10} {:>6}", "Group", "Tool", "BD-Rate %", "Seqs");
    println!("{:-<64}", "");
    for row in &overview {
        let mean = row
            .mean_bd_rate
            .map_or_else(|| "-".to_string(), |v| format!("{:.3}", v));
        println!(
            "{:<15} {:<30} {:>10} {:>6}",
            row.group.to_string(),
            row.experiment,
            mean,
            row.n_sequences_used
        );
    }

    let unresolved = metrics.iter().filter(|m| !m.status.is_numeric()).count();
    if unresolved > 0 {
        println!("{} of {} comparisons unresolved, see {}", unresolved, metrics.len(), BD_SUMMARY_FILE);
    }
    Ok(())
}
