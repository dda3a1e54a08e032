//! CSV and text outputs of the analysis stage.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::Result;

use super::rank::{ClassBreakdown, PairCorrelation, Recommendation, ToolEffect};
use super::{BdMetric, OverviewRow};

/// Per-tool, per-sequence BD-Rate.
pub const BD_SUMMARY_FILE: &str = "bd_summary.csv";
/// Mean BD-Rate per tool.
pub const OVERVIEW_FILE: &str = "overview.csv";
/// Ranked tool effects.
pub const TOOL_EFFECTS_FILE: &str = "tool_effects.csv";
/// Tool pair correlations.
pub const PAIR_CORRELATION_FILE: &str = "pair_correlation.csv";
/// Mean benefit per resolution class.
pub const CLASS_BREAKDOWN_FILE: &str = "per_class_breakdown.csv";
/// Flags of the conservative set, one per line.
pub const CONSERVATIVE_FLAGS_FILE: &str = "flags_conservative.txt";
/// Flags of the aggressive set, one per line.
pub const AGGRESSIVE_FLAGS_FILE: &str = "flags_aggressive.txt";

/// Write serializable rows as CSV with a header taken from the field names.
///
/// An empty row set still gets a header when `header` is given.
fn write_rows<T: Serialize>(path: &Path, rows: &[T], header: &[&str]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(!rows.is_empty())
        .from_path(path)?;
    if rows.is_empty() {
        wtr.write_record(header)?;
    }
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!(path = %path.display(), rows = rows.len(), "wrote report");
    Ok(())
}

/// `group, experiment, sequence, anchor_used, anchor_fallback, bd_rate_percent, qps_used, approx_flag, status`
pub fn write_bd_summary(path: &Path, metrics: &[BdMetric]) -> Result<()> {
    write_rows(
        path,
        metrics,
        &[
            "group",
            "experiment",
            "sequence",
            "anchor_used",
            "anchor_fallback",
            "bd_rate_percent",
            "qps_used",
            "approx_flag",
            "status",
        ],
    )
}

/// Read a BD summary written by [`write_bd_summary`].
pub fn load_bd_summary(path: &Path) -> Result<Vec<BdMetric>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut metrics = Vec::new();
    for row in reader.deserialize() {
        metrics.push(row?);
    }
    Ok(metrics)
}

/// `group, experiment, mean_bd_rate, n_sequences_used`
pub fn write_overview(path: &Path, rows: &[OverviewRow]) -> Result<()> {
    write_rows(
        path,
        rows,
        &["group", "experiment", "mean_bd_rate", "n_sequences_used"],
    )
}

/// `group, experiment, mean_benefit, median_benefit, std_dev, stability_ratio, n_sequences, n_estimated`
pub fn write_tool_effects(path: &Path, effects: &[ToolEffect]) -> Result<()> {
    write_rows(
        path,
        effects,
        &[
            "group",
            "experiment",
            "mean_benefit",
            "median_benefit",
            "std_dev",
            "stability_ratio",
            "n_sequences",
            "n_estimated",
        ],
    )
}

/// `group_a, tool_a, group_b, tool_b, n_sequences, correlation`
pub fn write_pair_correlation(path: &Path, pairs: &[PairCorrelation]) -> Result<()> {
    write_rows(
        path,
        pairs,
        &["group_a", "tool_a", "group_b", "tool_b", "n_sequences", "correlation"],
    )
}

/// `group, experiment, class, mean, n`
pub fn write_class_breakdown(path: &Path, rows: &[ClassBreakdown]) -> Result<()> {
    write_rows(path, rows, &["group", "experiment", "class", "mean", "n"])
}

/// One flag per line.
pub fn write_flags(path: &Path, flags: &[String]) -> Result<()> {
    let mut text = flags.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(path, text)?;
    info!(path = %path.display(), flags = flags.len(), "wrote flags");
    Ok(())
}

/// Everything the ranking stage produces.
#[derive(Debug, Clone, Default)]
pub struct RankingReport {
    /// Tools in rank order.
    pub effects: Vec<ToolEffect>,
    /// Pair correlations, strongest first.
    pub correlations: Vec<PairCorrelation>,
    /// Per-class means.
    pub class_breakdown: Vec<ClassBreakdown>,
    /// Conservative and aggressive tool sets.
    pub recommendation: Recommendation,
    /// Flags enabling the conservative set.
    pub conservative_flags: Vec<String>,
    /// Flags enabling the aggressive set.
    pub aggressive_flags: Vec<String>,
}

impl RankingReport {
    /// Write every ranking output into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        write_tool_effects(&dir.join(TOOL_EFFECTS_FILE), &self.effects)?;
        write_pair_correlation(&dir.join(PAIR_CORRELATION_FILE), &self.correlations)?;
        write_class_breakdown(&dir.join(CLASS_BREAKDOWN_FILE), &self.class_breakdown)?;
        write_flags(&dir.join(CONSERVATIVE_FLAGS_FILE), &self.conservative_flags)?;
        write_flags(&dir.join(AGGRESSIVE_FLAGS_FILE), &self.aggressive_flags)?;
        Ok(())
    }
}
