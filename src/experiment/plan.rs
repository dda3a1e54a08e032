//! Expansion of an experiment into encode jobs.
//!
//! Planning is pure: the same experiment and options always produce the
//! same job list, in the same order, with the same output paths. A partial
//! run can therefore be re-planned and resumed without renaming anything.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::args::merge_args;
use super::{AnchorRole, ExperimentSpec, Group, Sequence};
use crate::error::{Error, Result};

/// File name of the per-job encoder log.
pub const LOG_FILE_NAME: &str = "enc.log";

/// Identity of a job. Ordered by group, tool, sequence, then QP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    /// Group the job belongs to.
    pub group: Group,
    /// Tool variant name, or the baseline name for anchor jobs.
    pub tool: String,
    /// Sequence name.
    pub sequence: String,
    /// Quantization parameter.
    pub qp: i32,
}

impl JobId {
    /// Directory holding this job's log and bitstream, relative to the output root.
    #[must_use]
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(self.group.as_str())
            .join(&self.tool)
            .join(&self.sequence)
            .join(format!("QP{}", self.qp))
    }

    /// Bitstream file name, e.g. `RaceHorses_416x240_30_QP27.bin`.
    #[must_use]
    pub fn bitstream_name(&self) -> String {
        format!("{}_QP{}.bin", self.sequence, self.qp)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/QP{}", self.group, self.tool, self.sequence, self.qp)
    }
}

/// A fully resolved encode job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identity.
    pub id: JobId,
    /// Sequence to encode.
    pub sequence: Sequence,
    /// Resolved arguments: fixed arguments, then the anchor, then the tool
    /// overrides, merged last-wins with dependencies applied.
    pub args: Vec<String>,
    /// Per-job output directory.
    pub output_dir: PathBuf,
    /// Encoder log path.
    pub log_path: PathBuf,
    /// Bitstream output path.
    pub bitstream_path: PathBuf,
}

impl Job {
    fn new(spec: &ExperimentSpec, id: JobId, sequence: &Sequence, args: Vec<String>) -> Self {
        let output_dir = spec.output_dir.join(id.relative_dir());
        let log_path = output_dir.join(LOG_FILE_NAME);
        let bitstream_path = output_dir.join(id.bitstream_name());
        Self {
            id,
            sequence: sequence.clone(),
            args,
            output_dir,
            log_path,
            bitstream_path,
        }
    }
}

/// Knobs for trimming a plan without editing the experiment file.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Replace the experiment's QP list (e.g. a coarse two-QP first pass).
    pub qp_override: Option<Vec<i32>>,
    /// Plan only these tool groups. `None` plans all of them.
    pub groups: Option<Vec<Group>>,
    /// Do not plan anchor jobs.
    pub skip_baselines: bool,
}

impl PlanOptions {
    fn includes(&self, group: Group) -> bool {
        self.groups.as_ref().is_none_or(|groups| groups.contains(&group))
    }
}

/// Expand an experiment into a sorted list of jobs.
///
/// Anchor jobs are planned once per resolved anchor role in use. Each tool in
/// each group gets one job per (sequence, QP), with arguments merged over its
/// group's anchor.
///
/// # Errors
///
/// Returns [`Error::Config`] when a non-empty group has no resolvable anchor,
/// when two jobs share an identity, or when the QP override is empty, and
/// [`Error::InvalidArgument`] for malformed argument tokens.
pub fn plan(spec: &ExperimentSpec, options: &PlanOptions) -> Result<Vec<Job>> {
    spec.validate()?;

    let qps = options.qp_override.as_deref().unwrap_or(&spec.qp_list);
    if qps.is_empty() {
        return Err(Error::Config("QP override must not be empty".to_string()));
    }

    let active_groups: Vec<Group> = Group::TOOL_GROUPS
        .into_iter()
        .filter(|g| options.includes(*g) && !spec.tools(*g).is_empty())
        .collect();

    let mut roles: BTreeSet<AnchorRole> = BTreeSet::new();
    for group in &active_groups {
        if let Some(role) = group.anchor_role() {
            if spec.anchor(role).is_none() {
                return Err(Error::Config(format!(
                    "group {group} needs a {role} baseline but none could be resolved"
                )));
            }
            roles.insert(role);
        }
    }
    if options.groups.is_none() {
        for role in [AnchorRole::Reference, AnchorRole::Minimal] {
            if spec.anchor(role).is_some() {
                roles.insert(role);
            }
        }
    }

    let mut jobs = Vec::new();

    if !options.skip_baselines {
        let mut planned_anchors = BTreeSet::new();
        for role in &roles {
            let Some(anchor) = spec.anchor(*role) else {
                continue;
            };
            if !planned_anchors.insert(anchor.name.as_str()) {
                continue;
            }
            let args = merge_args(&spec.fixed_args, &[anchor.args.as_slice()])?;
            for sequence in &spec.sequences {
                for &qp in qps {
                    let id = JobId {
                        group: Group::Baseline,
                        tool: anchor.name.clone(),
                        sequence: sequence.name.clone(),
                        qp,
                    };
                    jobs.push(Job::new(spec, id, sequence, args.clone()));
                }
            }
        }
    }

    for group in &active_groups {
        let Some(anchor) = group.anchor_role().and_then(|role| spec.anchor(role)) else {
            continue;
        };
        for tool in spec.tools(*group) {
            let args = merge_args(
                &spec.fixed_args,
                &[anchor.args.as_slice(), tool.args.as_slice()],
            )?;
            debug!(group = %group, tool = %tool.name, args = ?args, "resolved tool arguments");
            for sequence in &spec.sequences {
                for &qp in qps {
                    let id = JobId {
                        group: *group,
                        tool: tool.name.clone(),
                        sequence: sequence.name.clone(),
                        qp,
                    };
                    jobs.push(Job::new(spec, id, sequence, args.clone()));
                }
            }
        }
    }

    jobs.sort_by(|a, b| a.id.cmp(&b.id));
    if let Some(pair) = jobs.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(Error::Config(format!("duplicate job identity {}", pair[0].id)));
    }

    info!(
        jobs = jobs.len(),
        sequences = spec.sequences.len(),
        qps = qps.len(),
        "planned experiment"
    );
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::tests::{SAMPLE_YAML, sample_spec};
    use proptest::prelude::*;

    #[test]
    fn test_plan_counts() {
        let spec = sample_spec();
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        // 2 anchors + 3 tools, each over 2 sequences x 4 QPs
        assert_eq!(jobs.len(), 5 * 2 * 4);
        let baseline_jobs = jobs.iter().filter(|j| j.id.group == Group::Baseline).count();
        assert_eq!(baseline_jobs, 2 * 2 * 4);
    }

    #[test]
    fn test_plan_is_sorted_and_unique() {
        let jobs = plan(&sample_spec(), &PlanOptions::default()).unwrap();
        for pair in jobs.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
        assert_eq!(jobs[0].id.group, Group::Baseline);
        assert_eq!(jobs.last().unwrap().id.group, Group::PerfAblate);
    }

    #[test]
    fn test_plan_merges_anchor_args() {
        let jobs = plan(&sample_spec(), &PlanOptions::default()).unwrap();

        let add = jobs.iter().find(|j| j.id.tool == "ADD_ALF").unwrap();
        assert_eq!(
            add.args,
            vec![
                "--TemporalSubsampleRatio=8",
                "--SAO=0",
                "--RDOQ=0",
                "--ALF=1",
                "--CCALF=1",
                "--DepQuant=0"
            ]
        );

        let ablate = jobs.iter().find(|j| j.id.tool == "ABLATE_SAO").unwrap();
        assert_eq!(ablate.args, vec!["--TemporalSubsampleRatio=8", "--SAO=0"]);
    }

    #[test]
    fn test_plan_merges_fixed_args() {
        let mut spec = sample_spec();
        spec.fixed_args = vec!["--SAO=1".to_string(), "--RDOQTS=0".to_string()];
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();

        let reference = jobs.iter().find(|j| j.id.tool == "Baseline_Ref").unwrap();
        assert_eq!(reference.args, vec!["--SAO=1", "--RDOQTS=0", "--DepQuant=0"]);

        let ablate = jobs.iter().find(|j| j.id.tool == "ABLATE_SAO").unwrap();
        assert_eq!(ablate.args, vec!["--RDOQTS=0", "--SAO=0", "--DepQuant=0"]);
    }

    #[test]
    fn test_plan_paths() {
        let jobs = plan(&sample_spec(), &PlanOptions::default()).unwrap();
        let job = jobs
            .iter()
            .find(|j| j.id.tool == "ABLATE_ALF" && j.id.qp == 27 && j.id.sequence.starts_with("Race"))
            .unwrap();
        let dir = PathBuf::from("/tmp/ablate-out/perf_ablate/ABLATE_ALF/RaceHorses_416x240_30/QP27");
        assert_eq!(job.output_dir, dir);
        assert_eq!(job.log_path, dir.join("enc.log"));
        assert_eq!(job.bitstream_path, dir.join("RaceHorses_416x240_30_QP27.bin"));
    }

    #[test]
    fn test_plan_options() {
        let spec = sample_spec();
        let options = PlanOptions {
            qp_override: Some(vec![37, 22]),
            groups: Some(vec![Group::PerfAblate]),
            skip_baselines: false,
        };
        let jobs = plan(&spec, &options).unwrap();
        // Reference anchor + 2 ablation tools, 2 sequences x 2 QPs
        assert_eq!(jobs.len(), 3 * 2 * 2);
        assert!(jobs.iter().all(|j| j.id.tool != "Baseline_Min"));

        let options = PlanOptions {
            skip_baselines: true,
            ..PlanOptions::default()
        };
        let jobs = plan(&spec, &options).unwrap();
        assert!(jobs.iter().all(|j| j.id.group != Group::Baseline));
    }

    #[test]
    fn test_plan_missing_anchor() {
        let yaml = SAMPLE_YAML.replace("Baseline_Min", "Baseline_Stripped");
        let spec = ExperimentSpec::from_yaml(&yaml).unwrap();
        let err = plan(&spec, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_plan_shared_anchor_planned_once() {
        let mut spec = sample_spec();
        spec.reference_baseline = Some("Baseline_Ref".to_string());
        spec.minimal_baseline = Some("Baseline_Ref".to_string());
        let jobs = plan(&spec, &PlanOptions::default()).unwrap();
        let baseline_jobs = jobs.iter().filter(|j| j.id.group == Group::Baseline).count();
        assert_eq!(baseline_jobs, 2 * 4);
    }

    proptest! {
        #[test]
        fn prop_plan_is_deterministic(
            qps in prop::collection::btree_set(0i32..64, 1..6),
            reverse in any::<bool>(),
        ) {
            let mut spec = sample_spec();
            let mut qps: Vec<i32> = qps.into_iter().collect();
            if reverse {
                qps.reverse();
            }
            spec.qp_list = qps;
            let first = plan(&spec, &PlanOptions::default()).unwrap();
            let second = plan(&spec.clone(), &PlanOptions::default()).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
