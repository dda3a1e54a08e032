//! BD-Rate computation over ledger rows.
//!
//! Rows are grouped into rate-distortion sets per `(group, tool, sequence)`
//! and each tool set is compared against its group's anchor set for the
//! same sequence. [`rank`] turns the resulting [`BdMetric`] rows into
//! per-tool effects and flag presets; [`report`] writes them out.

pub mod rank;
pub mod report;

pub use rank::{
    ClassBreakdown, PairCorrelation, RankingConfig, Recommendation, Thresholds, Tiers, ToolEffect,
    classify, correlations, flags_for, per_class_breakdown, recommend, shortlist, tool_effects,
};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::experiment::{AnchorRole, ExperimentSpec, Group};
use crate::run::{JobResult, JobStatus, latest_results};
use crate::stats::{BdStatus, RdSet, compare_rd, mean};

/// Anchor name used when an experiment does not name its reference anchor.
pub const DEFAULT_REFERENCE_ANCHOR: &str = "Baseline_Ref";

/// Anchor name used when an experiment does not name its minimal anchor.
pub const DEFAULT_MINIMAL_ANCHOR: &str = "Baseline_Min";

/// Options for [`compute_bd_metrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Anchor for ablation groups.
    pub reference_anchor: String,
    /// Anchor for addition groups.
    pub minimal_anchor: String,
    /// Report a two-point estimate when only two QPs are shared.
    pub allow_two_qp: bool,
    /// Compare addition groups against the reference anchor when the
    /// minimal anchor has no data for a sequence.
    pub fallback_minimal_to_reference: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            reference_anchor: DEFAULT_REFERENCE_ANCHOR.to_string(),
            minimal_anchor: DEFAULT_MINIMAL_ANCHOR.to_string(),
            allow_two_qp: true,
            fallback_minimal_to_reference: false,
        }
    }
}

impl AnalysisConfig {
    /// Take anchor names from an experiment, keeping defaults for the rest.
    #[must_use]
    pub fn from_spec(spec: &ExperimentSpec) -> Self {
        let defaults = Self::default();
        Self {
            reference_anchor: spec
                .anchor_name(AnchorRole::Reference)
                .map_or(defaults.reference_anchor, str::to_string),
            minimal_anchor: spec
                .anchor_name(AnchorRole::Minimal)
                .map_or(defaults.minimal_anchor, str::to_string),
            ..defaults
        }
    }

    /// Anchor name for a role.
    #[must_use]
    pub fn anchor(&self, role: AnchorRole) -> &str {
        match role {
            AnchorRole::Reference => &self.reference_anchor,
            AnchorRole::Minimal => &self.minimal_anchor,
        }
    }
}

/// BD-Rate of one tool on one sequence against its anchor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BdMetric {
    /// Tool group.
    pub group: Group,
    /// Tool variant name.
    pub experiment: String,
    /// Sequence name.
    pub sequence: String,
    /// Anchor the tool was compared against.
    pub anchor_used: String,
    /// Whether the reference anchor stood in for a missing minimal anchor.
    pub anchor_fallback: bool,
    /// BD-Rate in percent; negative means the tool saves bits.
    pub bd_rate_percent: Option<f64>,
    /// QPs used for the fit, comma separated.
    pub qps_used: String,
    /// Whether the value is a two-point estimate.
    #[serde(rename = "approx_flag")]
    pub approx: bool,
    /// Outcome.
    pub status: BdStatus,
}

type SetKey = (Group, String, String);

/// Compute BD metrics for every `(group, tool, sequence)` in `rows`.
///
/// Only the latest row per log path counts, and only `DONE` rows supply
/// rate-distortion points: a timed-out or failed encode may still have
/// partial averages in its log. Tool keys without any such point yet are
/// reported as `PENDING`; missing anchor data
/// gives `NO_ANCHOR`. Output is sorted by `(group, experiment, sequence)`.
#[must_use]
pub fn compute_bd_metrics(rows: &[JobResult], config: &AnalysisConfig) -> Vec<BdMetric> {
    let rows = latest_results(rows.to_vec());

    let mut sets: BTreeMap<SetKey, RdSet> = BTreeMap::new();
    let mut tool_keys: BTreeSet<SetKey> = BTreeSet::new();
    for row in &rows {
        let key = (row.group, row.tool.clone(), row.sequence.clone());
        if row.group != Group::Baseline {
            tool_keys.insert(key.clone());
        }
        if row.status != JobStatus::Done {
            continue;
        }
        if let Some(point) = row.rd_point() {
            sets.entry(key).or_default().insert(row.qp, point);
        }
    }

    let anchor_set = |name: &str, sequence: &str| {
        sets.get(&(Group::Baseline, name.to_string(), sequence.to_string()))
            .filter(|set| !set.is_empty())
    };

    let mut metrics = Vec::with_capacity(tool_keys.len());
    for key in tool_keys {
        let (group, experiment, sequence) = key.clone();
        let Some(role) = group.anchor_role() else {
            continue;
        };
        let mut anchor_used = config.anchor(role).to_string();
        let mut anchor_fallback = false;
        let mut anchor = anchor_set(&anchor_used, &sequence);
        if anchor.is_none() && role == AnchorRole::Minimal && config.fallback_minimal_to_reference {
            anchor = anchor_set(&config.reference_anchor, &sequence);
            if anchor.is_some() {
                warn!(
                    group = %group,
                    experiment = %experiment,
                    sequence = %sequence,
                    missing = %anchor_used,
                    "minimal anchor missing, using reference anchor"
                );
                anchor_used.clone_from(&config.reference_anchor);
                anchor_fallback = true;
            }
        }

        let mut metric = BdMetric {
            group,
            experiment,
            sequence,
            anchor_used,
            anchor_fallback,
            bd_rate_percent: None,
            qps_used: String::new(),
            approx: false,
            status: BdStatus::Pending,
        };

        match (sets.get(&key), anchor) {
            (None, _) => {}
            (Some(_), None) => metric.status = BdStatus::NoAnchor,
            (Some(test), Some(anchor)) => {
                let outcome = compare_rd(anchor, test, config.allow_two_qp);
                metric.bd_rate_percent = outcome.bd_rate_percent;
                metric.qps_used = outcome
                    .qps_used
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                metric.approx = outcome.status.is_estimate();
                metric.status = outcome.status;
            }
        }

        if !metric.status.is_numeric() {
            warn!(
                group = %metric.group,
                experiment = %metric.experiment,
                sequence = %metric.sequence,
                status = %metric.status,
                "BD-Rate unresolved"
            );
        }
        metrics.push(metric);
    }

    let resolved = metrics.iter().filter(|m| m.status.is_numeric()).count();
    info!(total = metrics.len(), resolved, "computed BD metrics");
    metrics
}

/// Mean BD-Rate per `(group, experiment)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverviewRow {
    /// Tool group.
    pub group: Group,
    /// Tool variant name.
    pub experiment: String,
    /// Mean BD-Rate over sequences with a numeric result.
    pub mean_bd_rate: Option<f64>,
    /// Sequences that contributed to the mean.
    pub n_sequences_used: usize,
}

/// Average numeric BD-Rates per tool.
///
/// Tools with no numeric result still get a row, with no mean.
#[must_use]
pub fn overview(metrics: &[BdMetric]) -> Vec<OverviewRow> {
    let mut by_tool: BTreeMap<(Group, &str), Vec<f64>> = BTreeMap::new();
    for metric in metrics {
        let values = by_tool.entry((metric.group, &metric.experiment)).or_default();
        if metric.status.is_numeric() {
            values.extend(metric.bd_rate_percent);
        }
    }
    by_tool
        .into_iter()
        .map(|((group, experiment), values)| OverviewRow {
            group,
            experiment: experiment.to_string(),
            mean_bd_rate: (!values.is_empty()).then(|| mean(&values)),
            n_sequences_used: values.len(),
        })
        .collect()
}
