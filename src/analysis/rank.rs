//! Tool ranking, tiering and flag-preset selection.
//!
//! Per-sequence BD-Rates become a "benefit when the tool is on":
//! `+bd` for ablation groups (removing a useful tool costs bits) and `-bd`
//! for addition groups (adding a useful tool saves bits). Effects are
//! ranked by `(mean desc, stability desc, median desc)`.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::experiment::args::invert_toggle;
use crate::experiment::{ExperimentSpec, Group, ToolVariant};
use crate::stats::{mean, median, pearson, pstdev};

use super::BdMetric;

/// Pairs correlated above this magnitude are treated as redundant.
pub const REDUNDANCY_CORRELATION: f64 = 0.85;

/// Minimum shared sequences for a pair correlation.
pub const MIN_SHARED_SEQUENCES: usize = 3;

static RESOLUTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d+)x(\d+)_").expect("valid regex"));

/// Options for benefit aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingConfig {
    /// Count two-point estimates (`OK_EST2QP`) alongside exact results.
    pub include_estimates: bool,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            include_estimates: true,
        }
    }
}

/// Aggregate benefit of one tool across sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEffect {
    /// Tool group.
    pub group: Group,
    /// Tool variant name.
    pub experiment: String,
    /// Mean benefit in BD-Rate percent.
    pub mean_benefit: f64,
    /// Median benefit.
    pub median_benefit: f64,
    /// Population standard deviation of the benefit.
    pub std_dev: f64,
    /// Share of sequences with positive benefit.
    pub stability_ratio: f64,
    /// Sequences contributing.
    pub n_sequences: usize,
    /// How many of those were two-point estimates.
    pub n_estimated: usize,
}

type ToolKey = (Group, String);

/// Per-tool, per-sequence benefits from the metrics that count.
fn benefits(metrics: &[BdMetric], config: &RankingConfig) -> BTreeMap<ToolKey, BTreeMap<String, (f64, bool)>> {
    let mut out: BTreeMap<ToolKey, BTreeMap<String, (f64, bool)>> = BTreeMap::new();
    for metric in metrics {
        if !metric.status.is_numeric() || (metric.approx && !config.include_estimates) {
            continue;
        }
        let Some(bd) = metric.bd_rate_percent else {
            continue;
        };
        out.entry((metric.group, metric.experiment.clone()))
            .or_default()
            .insert(metric.sequence.clone(), (bd * metric.group.benefit_sign(), metric.approx));
    }
    out
}

#[derive(Debug, Default)]
struct ToolAccumulator {
    values: Vec<f64>,
    estimated: usize,
}

impl ToolAccumulator {
    fn push(&mut self, benefit: f64, estimated: bool) {
        self.values.push(benefit);
        if estimated {
            self.estimated += 1;
        }
    }

    fn finish(self, (group, experiment): ToolKey) -> ToolEffect {
        let positive = self.values.iter().filter(|&&v| v > 0.0).count();
        ToolEffect {
            group,
            experiment,
            mean_benefit: mean(&self.values),
            median_benefit: median(&self.values),
            std_dev: pstdev(&self.values),
            stability_ratio: positive as f64 / self.values.len() as f64,
            n_sequences: self.values.len(),
            n_estimated: self.estimated,
        }
    }
}

/// Aggregate per-sequence benefits into ranked tool effects.
///
/// ```
/// use codec_ablate::analysis::{BdMetric, RankingConfig, tool_effects};
/// use codec_ablate::experiment::Group;
/// use codec_ablate::stats::BdStatus;
///
/// let metric = |sequence: &str, bd: f64| BdMetric {
///     group: Group::PerfAblate,
///     experiment: "ABLATE_ALF".into(),
///     sequence: sequence.into(),
///     anchor_used: "Baseline_Ref".into(),
///     anchor_fallback: false,
///     bd_rate_percent: Some(bd),
///     qps_used: "22,27,32,37".into(),
///     approx: false,
///     status: BdStatus::Ok,
/// };
/// let metrics = [metric("A", 2.0), metric("B", -0.5), metric("C", 3.0)];
/// let effects = tool_effects(&metrics, &RankingConfig::default());
/// assert_eq!(effects[0].mean_benefit, 1.5);
/// assert!((effects[0].stability_ratio - 2.0 / 3.0).abs() < 1e-12);
/// ```
#[must_use]
pub fn tool_effects(metrics: &[BdMetric], config: &RankingConfig) -> Vec<ToolEffect> {
    let mut effects: Vec<ToolEffect> = benefits(metrics, config)
        .into_iter()
        .map(|(key, per_sequence)| {
            per_sequence
                .into_values()
                .fold(ToolAccumulator::default(), |mut acc, (benefit, estimated)| {
                    acc.push(benefit, estimated);
                    acc
                })
                .finish(key)
        })
        .collect();

    effects.sort_by(|a, b| {
        b.mean_benefit
            .total_cmp(&a.mean_benefit)
            .then(b.stability_ratio.total_cmp(&a.stability_ratio))
            .then(b.median_benefit.total_cmp(&a.median_benefit))
            .then_with(|| (a.group, &a.experiment).cmp(&(b.group, &b.experiment)))
    });
    effects
}

/// Tier boundaries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Minimum mean benefit for High.
    pub high_mean: f64,
    /// Minimum mean benefit for Medium.
    pub medium_mean: f64,
    /// Minimum stability for High.
    pub high_stability: f64,
    /// Minimum stability for Medium.
    pub medium_stability: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high_mean: 0.7,
            medium_mean: 0.4,
            high_stability: 0.8,
            medium_stability: 0.6,
        }
    }
}

/// Effects split by tier, each in rank order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tiers {
    /// Mean and stability both clear the High bar.
    pub high: Vec<ToolEffect>,
    /// Clears the Medium bar but not High.
    pub medium: Vec<ToolEffect>,
    /// Everything else.
    pub low: Vec<ToolEffect>,
}

/// Split ranked effects into High, Medium and Low tiers.
#[must_use]
pub fn classify(effects: &[ToolEffect], thresholds: &Thresholds) -> Tiers {
    let mut tiers = Tiers::default();
    for effect in effects {
        let tier = if effect.mean_benefit >= thresholds.high_mean
            && effect.stability_ratio >= thresholds.high_stability
        {
            &mut tiers.high
        } else if effect.mean_benefit >= thresholds.medium_mean
            && effect.stability_ratio >= thresholds.medium_stability
        {
            &mut tiers.medium
        } else {
            &mut tiers.low
        };
        tier.push(effect.clone());
    }
    tiers
}

/// Pearson correlation of two tools' per-sequence benefits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCorrelation {
    /// Group of the first tool.
    pub group_a: Group,
    /// First tool.
    pub tool_a: String,
    /// Group of the second tool.
    pub group_b: Group,
    /// Second tool.
    pub tool_b: String,
    /// Shared sequences.
    pub n_sequences: usize,
    /// Pearson `r` over the shared sequences.
    pub correlation: f64,
}

/// Correlate every tool pair sharing at least three sequences.
///
/// Pairs where either tool has constant benefit are skipped. Output is
/// sorted by `|r|`, largest first.
#[must_use]
pub fn correlations(metrics: &[BdMetric], config: &RankingConfig) -> Vec<PairCorrelation> {
    let benefits = benefits(metrics, config);
    let tools: Vec<(&ToolKey, &BTreeMap<String, (f64, bool)>)> = benefits.iter().collect();

    let mut pairs = Vec::new();
    for (i, &((group_a, tool_a), seqs_a)) in tools.iter().enumerate() {
        for &((group_b, tool_b), seqs_b) in &tools[i + 1..] {
            let (x, y): (Vec<f64>, Vec<f64>) = seqs_a
                .iter()
                .filter_map(|(seq, &(a, _))| seqs_b.get(seq).map(|&(b, _)| (a, b)))
                .unzip();
            if x.len() < MIN_SHARED_SEQUENCES {
                continue;
            }
            let Some(correlation) = pearson(&x, &y) else {
                debug!(tool_a = %tool_a, tool_b = %tool_b, "constant benefit, correlation skipped");
                continue;
            };
            pairs.push(PairCorrelation {
                group_a: *group_a,
                tool_a: tool_a.clone(),
                group_b: *group_b,
                tool_b: tool_b.clone(),
                n_sequences: x.len(),
                correlation,
            });
        }
    }
    pairs.sort_by(|a, b| b.correlation.abs().total_cmp(&a.correlation.abs()));
    pairs
}

/// The two recommended tool sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recommendation {
    /// High tier only.
    pub conservative: Vec<ToolEffect>,
    /// High and Medium tiers minus redundant tools.
    pub aggressive: Vec<ToolEffect>,
}

/// Build the conservative and aggressive sets.
///
/// For each pair in `correlations` with `|r| > 0.85` where both tools are
/// in the aggressive set, the one with the lower mean benefit is dropped;
/// on a tie the second of the pair goes.
#[must_use]
pub fn recommend(tiers: &Tiers, correlations: &[PairCorrelation]) -> Recommendation {
    let candidates: Vec<ToolEffect> = tiers.high.iter().chain(&tiers.medium).cloned().collect();
    let mean_of: BTreeMap<(Group, &str), f64> = candidates
        .iter()
        .map(|e| ((e.group, e.experiment.as_str()), e.mean_benefit))
        .collect();

    let mut pruned: HashSet<(Group, &str)> = HashSet::new();
    for pair in correlations
        .iter()
        .filter(|p| p.correlation.abs() > REDUNDANCY_CORRELATION)
    {
        let a = (pair.group_a, pair.tool_a.as_str());
        let b = (pair.group_b, pair.tool_b.as_str());
        let (Some(&mean_a), Some(&mean_b)) = (mean_of.get(&a), mean_of.get(&b)) else {
            continue;
        };
        let dropped = if mean_a >= mean_b { b } else { a };
        debug!(
            tool = dropped.1,
            correlation = pair.correlation,
            "dropping redundant tool"
        );
        pruned.insert(dropped);
    }

    let aggressive = candidates
        .iter()
        .filter(|e| !pruned.contains(&(e.group, e.experiment.as_str())))
        .cloned()
        .collect();
    Recommendation {
        conservative: tiers.high.clone(),
        aggressive,
    }
}

/// Flags that turn the given tools on, deduplicated and sorted.
///
/// An explicit `flags` list on the tool wins. Otherwise addition tools
/// contribute their arguments and ablation tools contribute their boolean
/// toggles inverted.
#[must_use]
pub fn flags_for(effects: &[ToolEffect], spec: &ExperimentSpec) -> Vec<String> {
    let mut flags = BTreeSet::new();
    for effect in effects {
        let Some(tool) = spec.tool(effect.group, &effect.experiment) else {
            warn!(group = %effect.group, experiment = %effect.experiment, "tool not in experiment, no flags");
            continue;
        };
        flags.extend(tool_flags(effect.group, tool));
    }
    flags.into_iter().collect()
}

fn tool_flags(group: Group, tool: &ToolVariant) -> Vec<String> {
    if let Some(flags) = &tool.flags {
        return flags.clone();
    }
    if group.is_ablation() {
        tool.args.iter().filter_map(|t| invert_toggle(t)).collect()
    } else {
        tool.args.iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
    }
}

/// Resolution class from a `_WxH_` token in a sequence name.
///
/// `B` for widths from 1920, `C` from 832, `D` from 416, `U` otherwise or
/// when the name carries no resolution.
#[must_use]
pub fn resolution_class(sequence: &str) -> char {
    let width: Option<u32> = RESOLUTION
        .captures(sequence)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    match width {
        Some(w) if w >= 1920 => 'B',
        Some(w) if w >= 832 => 'C',
        Some(w) if w >= 416 => 'D',
        _ => 'U',
    }
}

/// Mean benefit of one tool within one resolution class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassBreakdown {
    /// Tool group.
    pub group: Group,
    /// Tool variant name.
    pub experiment: String,
    /// Resolution class, see [`resolution_class`].
    pub class: char,
    /// Mean benefit within the class.
    pub mean: f64,
    /// Sequences in the class.
    pub n: usize,
}

/// Mean benefit per tool and resolution class.
#[must_use]
pub fn per_class_breakdown(metrics: &[BdMetric], config: &RankingConfig) -> Vec<ClassBreakdown> {
    let mut by_class: BTreeMap<(Group, String, char), Vec<f64>> = BTreeMap::new();
    for ((group, experiment), per_sequence) in benefits(metrics, config) {
        for (sequence, (benefit, _)) in per_sequence {
            by_class
                .entry((group, experiment.clone(), resolution_class(&sequence)))
                .or_default()
                .push(benefit);
        }
    }
    by_class
        .into_iter()
        .map(|((group, experiment, class), values)| ClassBreakdown {
            group,
            experiment,
            class,
            mean: mean(&values),
            n: values.len(),
        })
        .collect()
}

/// Copy of `spec` keeping at most `top_k` tools per group, in rank order.
///
/// Tools without an effect are dropped.
#[must_use]
pub fn shortlist(spec: &ExperimentSpec, effects: &[ToolEffect], top_k: usize) -> ExperimentSpec {
    let mut out = spec.clone();
    for group in Group::TOOL_GROUPS {
        let kept: Vec<ToolVariant> = effects
            .iter()
            .filter(|e| e.group == group)
            .filter_map(|e| spec.tool(group, &e.experiment))
            .take(top_k)
            .cloned()
            .collect();
        match group {
            Group::PerfAdd => out.perf_add = kept,
            Group::PerfAblate => out.perf_ablate = kept,
            Group::SpeedAdd => out.speed_add = kept,
            Group::SpeedAblate => out.speed_ablate = kept,
            Group::Baseline => {}
        }
    }
    info!(top_k, "built shortlist");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::tests::sample_spec;
    use crate::stats::BdStatus;

    fn metric(group: Group, tool: &str, sequence: &str, bd: f64) -> BdMetric {
        BdMetric {
            group,
            experiment: tool.to_string(),
            sequence: sequence.to_string(),
            anchor_used: "anchor".to_string(),
            anchor_fallback: false,
            bd_rate_percent: Some(bd),
            qps_used: "22,27,32,37".to_string(),
            approx: false,
            status: BdStatus::Ok,
        }
    }

    fn effect(group: Group, tool: &str, mean_benefit: f64, stability_ratio: f64) -> ToolEffect {
        ToolEffect {
            group,
            experiment: tool.to_string(),
            mean_benefit,
            median_benefit: mean_benefit,
            std_dev: 0.0,
            stability_ratio,
            n_sequences: 3,
            n_estimated: 0,
        }
    }

    #[test]
    fn test_tool_effect_aggregation() {
        let metrics = vec![
            metric(Group::PerfAblate, "ABLATE_ALF", "A", 2.0),
            metric(Group::PerfAblate, "ABLATE_ALF", "B", -0.5),
            metric(Group::PerfAblate, "ABLATE_ALF", "C", 3.0),
        ];
        let effects = tool_effects(&metrics, &RankingConfig::default());
        assert_eq!(effects.len(), 1);
        let e = &effects[0];
        assert!((e.mean_benefit - 1.5).abs() < 1e-12);
        assert!((e.stability_ratio - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(e.median_benefit, 2.0);
        assert_eq!(e.n_sequences, 3);
    }

    #[test]
    fn test_addition_sign_is_negated() {
        let metrics = vec![
            metric(Group::PerfAdd, "ADD_ALF", "A", -2.0),
            metric(Group::PerfAdd, "ADD_ALF", "B", -4.0),
        ];
        let effects = tool_effects(&metrics, &RankingConfig::default());
        assert!((effects[0].mean_benefit - 3.0).abs() < 1e-12);
        assert_eq!(effects[0].stability_ratio, 1.0);
    }

    #[test]
    fn test_estimates_and_unresolved() {
        let mut estimated = metric(Group::PerfAblate, "T", "B", 10.0);
        estimated.approx = true;
        estimated.status = BdStatus::OkEst2Qp;
        let mut missing = metric(Group::PerfAblate, "T", "C", 0.0);
        missing.bd_rate_percent = None;
        missing.status = BdStatus::NoAnchor;
        let metrics = vec![metric(Group::PerfAblate, "T", "A", 2.0), estimated, missing];

        let all = tool_effects(&metrics, &RankingConfig::default());
        assert_eq!(all[0].n_sequences, 2);
        assert_eq!(all[0].n_estimated, 1);
        assert!((all[0].mean_benefit - 6.0).abs() < 1e-12);

        let exact = tool_effects(&metrics, &RankingConfig { include_estimates: false });
        assert_eq!(exact[0].n_sequences, 1);
        assert!((exact[0].mean_benefit - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_ranking_order() {
        let metrics = vec![
            metric(Group::PerfAblate, "LOW", "A", 0.1),
            metric(Group::PerfAblate, "HIGH", "A", 5.0),
            metric(Group::PerfAdd, "MID", "A", -1.0),
        ];
        let effects = tool_effects(&metrics, &RankingConfig::default());
        let names: Vec<&str> = effects.iter().map(|e| e.experiment.as_str()).collect();
        assert_eq!(names, ["HIGH", "MID", "LOW"]);
    }

    #[test]
    fn test_classify_tiers() {
        let effects = vec![
            effect(Group::PerfAblate, "A", 1.0, 0.9),
            effect(Group::PerfAblate, "B", 1.0, 0.7),
            effect(Group::PerfAblate, "C", 0.5, 0.6),
            effect(Group::PerfAblate, "D", 0.3, 1.0),
        ];
        let tiers = classify(&effects, &Thresholds::default());
        let names = |v: &[ToolEffect]| v.iter().map(|e| e.experiment.clone()).collect::<Vec<_>>();
        assert_eq!(names(&tiers.high), ["A"]);
        assert_eq!(names(&tiers.medium), ["B", "C"]);
        assert_eq!(names(&tiers.low), ["D"]);
    }

    #[test]
    fn test_correlation_pruning() {
        let mut metrics = Vec::new();
        for (seq, bd) in [("A", 1.0), ("B", 2.0), ("C", 3.0)] {
            metrics.push(metric(Group::PerfAblate, "STRONG", seq, bd * 2.0));
            metrics.push(metric(Group::PerfAblate, "WEAK", seq, bd));
        }
        let config = RankingConfig::default();
        let pairs = correlations(&metrics, &config);
        assert_eq!(pairs.len(), 1);
        assert!((pairs[0].correlation - 1.0).abs() < 1e-9);
        assert_eq!(pairs[0].n_sequences, 3);

        let effects = tool_effects(&metrics, &config);
        let tiers = classify(&effects, &Thresholds::default());
        assert_eq!(tiers.high.len(), 2);

        let rec = recommend(&tiers, &pairs);
        assert_eq!(rec.conservative.len(), 2);
        let kept: Vec<&str> = rec.aggressive.iter().map(|e| e.experiment.as_str()).collect();
        assert_eq!(kept, ["STRONG"]);
    }

    #[test]
    fn test_correlation_requires_shared_sequences() {
        let metrics = vec![
            metric(Group::PerfAblate, "X", "A", 1.0),
            metric(Group::PerfAblate, "X", "B", 2.0),
            metric(Group::PerfAblate, "Y", "A", 1.0),
            metric(Group::PerfAblate, "Y", "B", 2.0),
            metric(Group::PerfAblate, "Z", "A", 1.0),
            metric(Group::PerfAblate, "Z", "B", 1.0),
            metric(Group::PerfAblate, "Z", "C", 1.0),
        ];
        assert!(correlations(&metrics, &RankingConfig::default()).is_empty());
    }

    #[test]
    fn test_equal_means_drop_second() {
        let tiers = Tiers {
            high: vec![effect(Group::PerfAblate, "A", 1.0, 1.0), effect(Group::PerfAblate, "B", 1.0, 1.0)],
            ..Tiers::default()
        };
        let pairs = vec![PairCorrelation {
            group_a: Group::PerfAblate,
            tool_a: "A".to_string(),
            group_b: Group::PerfAblate,
            tool_b: "B".to_string(),
            n_sequences: 3,
            correlation: -0.9,
        }];
        let rec = recommend(&tiers, &pairs);
        assert_eq!(rec.aggressive.len(), 1);
        assert_eq!(rec.aggressive[0].experiment, "A");
    }

    #[test]
    fn test_flags_for_tools() {
        let mut spec = sample_spec();
        spec.perf_ablate[1].flags = Some(vec!["--SAO=1".to_string(), "--SAOLcuBoundary=1".to_string()]);
        let effects = vec![
            effect(Group::PerfAblate, "ABLATE_ALF", 1.0, 1.0),
            effect(Group::PerfAblate, "ABLATE_SAO", 1.0, 1.0),
            effect(Group::PerfAdd, "ADD_ALF", 1.0, 1.0),
            effect(Group::PerfAdd, "UNKNOWN", 1.0, 1.0),
        ];
        assert_eq!(
            flags_for(&effects, &spec),
            ["--ALF=1", "--CCALF=1", "--SAO=1", "--SAOLcuBoundary=1"]
        );
    }

    #[test]
    fn test_resolution_class() {
        assert_eq!(resolution_class("BasketballDrive_1920x1080_50"), 'B');
        assert_eq!(resolution_class("BQMall_832x480_60"), 'C');
        assert_eq!(resolution_class("RaceHorses_416x240_30"), 'D');
        assert_eq!(resolution_class("Tiny_352x288_30"), 'U');
        assert_eq!(resolution_class("NoSize"), 'U');
    }

    #[test]
    fn test_per_class_breakdown() {
        let metrics = vec![
            metric(Group::PerfAblate, "T", "A_1920x1080_50", 1.0),
            metric(Group::PerfAblate, "T", "B_3840x2160_60", 3.0),
            metric(Group::PerfAblate, "T", "C_416x240_30", 5.0),
        ];
        let rows = per_class_breakdown(&metrics, &RankingConfig::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].class, 'B');
        assert_eq!(rows[0].n, 2);
        assert!((rows[0].mean - 2.0).abs() < 1e-12);
        assert_eq!(rows[1].class, 'D');
    }

    #[test]
    fn test_shortlist_keeps_top_k_in_rank_order() {
        let spec = sample_spec();
        let effects = vec![
            effect(Group::PerfAblate, "ABLATE_SAO", 2.0, 1.0),
            effect(Group::PerfAblate, "ABLATE_ALF", 1.0, 1.0),
        ];
        let short = shortlist(&spec, &effects, 1);
        assert_eq!(short.perf_ablate.len(), 1);
        assert_eq!(short.perf_ablate[0].name, "ABLATE_SAO");
        assert!(short.perf_add.is_empty());
        assert_eq!(short.sequences, spec.sequences);
        assert_eq!(short.baselines, spec.baselines);

        let both = shortlist(&spec, &effects, 5);
        let names: Vec<&str> = both.perf_ablate.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["ABLATE_SAO", "ABLATE_ALF"]);
    }
}
