//! Ranking command.

use std::path::Path;

use anyhow::{Context, Result};
use codec_ablate::analysis::report::{RankingReport, load_bd_summary};
use codec_ablate::analysis::{
    RankingConfig, Thresholds, classify, correlations, flags_for, per_class_breakdown,
    recommend, shortlist, tool_effects,
};

use super::load_spec;

/// File name of the shortlisted experiment.
const SHORTLIST_FILE: &str = "shortlist.yaml";

pub fn run(
    bd_summary: &Path,
    spec_path: &Path,
    out_dir: &Path,
    exact_only: bool,
    thresholds: &Thresholds,
    top_k: Option<usize>,
) -> Result<()> {
    let spec = load_spec(spec_path)?;
    let metrics = load_bd_summary(bd_summary)
        .with_context(|| format!("Failed to read BD summary {}", bd_summary.display()))?;
    let config = RankingConfig {
        include_estimates: !exact_only,
    };

    let effects = tool_effects(&metrics, &config);
    let correlations = correlations(&metrics, &config);
    let tiers = classify(&effects, thresholds);
    let recommendation = recommend(&tiers, &correlations);

    let report = RankingReport {
        conservative_flags: flags_for(&recommendation.conservative, &spec),
        aggressive_flags: flags_for(&recommendation.aggressive, &spec),
        class_breakdown: per_class_breakdown(&metrics, &config),
        effects,
        correlations,
        recommendation,
    };
    report
        .write(out_dir)
        .with_context(|| format!("Failed to write reports to {}", out_dir.display()))?;

    println!(
        "{:<15} {:<30} {:>8} {:>8} {:>6} {:>5}",
        "Group", "Tool", "Mean", "Median", "Stable", "Seqs"
    );
    println!("{:-<77}", "");
    for e in &report.effects {
        println!(
            "{:<15} {:<30} {:>8.3} {:>8.3} {:>6.2} {:>5}",
            e.group.to_string(),
            e.experiment,
            e.mean_benefit,
            e.median_benefit,
            e.stability_ratio,
            e.n_sequences
        );
    }
    println!();
    println!(
        "Tiers: {} high, {} medium, {} low",
        tiers.high.len(),
        tiers.medium.len(),
        tiers.low.len()
    );
    println!("Conservative flags: {}", report.conservative_flags.join(" "));
    println!("Aggressive flags:   {}", report.aggressive_flags.join(" "));

    if let Some(k) = top_k {
        let path = out_dir.join(SHORTLIST_FILE);
        shortlist(&spec, &report.effects, k)
            .save_yaml(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Shortlist written to: {}", path.display());
    }
    Ok(())
}
