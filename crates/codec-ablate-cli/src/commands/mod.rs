//! Subcommand implementations.

pub mod bd;
pub mod collect;
pub mod plan;
pub mod rank;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args;
use codec_ablate::experiment::plan::PlanOptions;
use codec_ablate::{ExperimentSpec, Group};

/// Job filters shared by `plan` and `run`.
#[derive(Args, Debug, Clone)]
pub struct JobSelection {
    /// Replace the experiment's QP list (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub qp: Vec<i32>,

    /// Only plan these groups (perf_add, perf_ablate, speed_add, speed_ablate)
    #[arg(long, value_delimiter = ',')]
    pub group: Vec<String>,

    /// Do not plan anchor jobs
    #[arg(long)]
    pub skip_baselines: bool,
}

impl JobSelection {
    pub fn to_options(&self) -> Result<PlanOptions> {
        let groups = if self.group.is_empty() {
            None
        } else {
            let mut groups = Vec::with_capacity(self.group.len());
            for name in &self.group {
                match Group::parse(name) {
                    Some(group) if group != Group::Baseline => groups.push(group),
                    _ => bail!("unknown tool group: {name}"),
                }
            }
            Some(groups)
        };
        Ok(PlanOptions {
            qp_override: (!self.qp.is_empty()).then(|| self.qp.clone()),
            groups,
            skip_baselines: self.skip_baselines,
        })
    }
}

pub fn load_spec(path: &Path) -> Result<ExperimentSpec> {
    ExperimentSpec::load(path)
        .with_context(|| format!("Failed to load experiment {}", path.display()))
}
