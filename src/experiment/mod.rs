//! Experiment files and job planning.
//!
//! An experiment file declares the encoder, the test sequences, the QP sweep,
//! the anchor baselines and four groups of tool variants. This module loads
//! and validates that file; [`plan`] expands it into a flat job list and
//! [`args`] merges argument lists.
//!
//! ## Example
//!
//! ```rust,ignore
//! use codec_ablate::experiment::{ExperimentSpec, plan::{plan, PlanOptions}};
//!
//! let spec = ExperimentSpec::load("experiment_ablation.yaml")?;
//! let jobs = plan(&spec, &PlanOptions::default())?;
//! println!("{} jobs", jobs.len());
//! ```

pub mod args;
pub mod plan;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A test clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name, e.g. `BasketballDrive_1920x1080_50`.
    pub name: String,
    /// Path or locator of the raw source media.
    #[serde(alias = "yuv")]
    pub media_locator: String,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Frames per second.
    #[serde(alias = "fps")]
    pub frame_rate: u32,
    /// Number of frames to encode.
    #[serde(alias = "frames")]
    pub frame_count: u32,
}

/// A named anchor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Baseline name, e.g. `Baseline_Ref`.
    pub name: String,
    /// Encoder arguments (`--Key=Value`).
    #[serde(default)]
    pub args: Vec<String>,
}

/// A tool variant inside one of the four tool groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVariant {
    /// Variant name, e.g. `ABLATE_ALF`.
    pub name: String,
    /// Argument overrides applied on top of the group's anchor.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flags to emit when this tool ends up in a recommended preset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

/// Which anchor a group of tools is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorRole {
    /// Full-featured reference configuration.
    Reference,
    /// Stripped-down configuration with most tools disabled.
    Minimal,
}

impl fmt::Display for AnchorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Minimal => write!(f, "minimal"),
        }
    }
}

/// Job group. `Baseline` holds the anchor runs themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    /// Anchor runs.
    Baseline,
    /// Tools switched on over the minimal anchor (efficiency).
    PerfAdd,
    /// Tools switched off from the reference anchor (efficiency).
    PerfAblate,
    /// Tools switched on over the minimal anchor (speed).
    SpeedAdd,
    /// Tools switched off from the reference anchor (speed).
    SpeedAblate,
}

impl Group {
    /// The four tool groups, in declaration order.
    pub const TOOL_GROUPS: [Group; 4] = [
        Group::PerfAdd,
        Group::PerfAblate,
        Group::SpeedAdd,
        Group::SpeedAblate,
    ];

    /// Stable snake_case name, matching the experiment file keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::PerfAdd => "perf_add",
            Self::PerfAblate => "perf_ablate",
            Self::SpeedAdd => "speed_add",
            Self::SpeedAblate => "speed_ablate",
        }
    }

    /// Parse a group name as written in experiment files and ledgers.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" | "baselines" => Some(Self::Baseline),
            "perf_add" | "perfadd" => Some(Self::PerfAdd),
            "perf_ablate" | "perfablate" => Some(Self::PerfAblate),
            "speed_add" | "speedadd" => Some(Self::SpeedAdd),
            "speed_ablate" | "speedablate" => Some(Self::SpeedAblate),
            _ => None,
        }
    }

    /// Anchor this group is compared against. `None` for `Baseline`.
    #[must_use]
    pub fn anchor_role(&self) -> Option<AnchorRole> {
        match self {
            Self::Baseline => None,
            Self::PerfAblate | Self::SpeedAblate => Some(AnchorRole::Reference),
            Self::PerfAdd | Self::SpeedAdd => Some(AnchorRole::Minimal),
        }
    }

    /// Whether the group measures a tool by removing it.
    #[must_use]
    pub fn is_ablation(&self) -> bool {
        matches!(self, Self::PerfAblate | Self::SpeedAblate)
    }

    /// Sign that turns a BD-Rate into "benefit when the tool is on".
    ///
    /// Removing a useful tool raises BD-Rate, so ablation benefit is `+bd`.
    /// Adding a useful tool lowers BD-Rate, so addition benefit is `-bd`.
    #[must_use]
    pub fn benefit_sign(&self) -> f64 {
        if self.is_ablation() { 1.0 } else { -1.0 }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_qps() -> Vec<i32> {
    vec![37, 32, 27, 22]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./runs_out_ablation")
}

/// A declarative ablation experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Path to the encoder executable.
    #[serde(alias = "vtm_bin")]
    pub encoder_binary: PathBuf,
    /// Encoder configuration file passed with `-c`.
    #[serde(alias = "base_cfg")]
    pub base_config: String,
    /// Root directory for per-job outputs and the results ledger.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// QP sweep.
    #[serde(default = "default_qps", alias = "qps")]
    pub qp_list: Vec<i32>,
    /// Tokens appended to every invocation before the resolved tool arguments.
    #[serde(default)]
    pub fixed_args: Vec<String>,
    /// Test sequences.
    #[serde(default)]
    pub sequences: Vec<Sequence>,
    /// Anchor configurations.
    #[serde(default)]
    pub baselines: Vec<Baseline>,
    /// Explicit name of the reference anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_baseline: Option<String>,
    /// Explicit name of the minimal anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimal_baseline: Option<String>,
    /// Tools added over the minimal anchor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perf_add: Vec<ToolVariant>,
    /// Tools removed from the reference anchor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perf_ablate: Vec<ToolVariant>,
    /// Speed tools added over the minimal anchor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speed_add: Vec<ToolVariant>,
    /// Speed tools removed from the reference anchor.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub speed_ablate: Vec<ToolVariant>,
}

impl ExperimentSpec {
    /// Load and validate an experiment from YAML (or JSON for `.json` files).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let spec = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_yaml(&content)?
        };
        Ok(spec)
    }

    /// Parse and validate a YAML experiment.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Parse and validate a JSON experiment.
    pub fn from_json(text: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(text)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Write the experiment as YAML.
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Tool variants of a group. Empty for `Group::Baseline`.
    #[must_use]
    pub fn tools(&self, group: Group) -> &[ToolVariant] {
        match group {
            Group::Baseline => &[],
            Group::PerfAdd => &self.perf_add,
            Group::PerfAblate => &self.perf_ablate,
            Group::SpeedAdd => &self.speed_add,
            Group::SpeedAblate => &self.speed_ablate,
        }
    }

    /// Find a tool variant by group and name.
    #[must_use]
    pub fn tool(&self, group: Group, name: &str) -> Option<&ToolVariant> {
        self.tools(group).iter().find(|t| t.name == name)
    }

    /// Find a sequence by name.
    #[must_use]
    pub fn sequence(&self, name: &str) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.name == name)
    }

    /// Resolve the baseline playing an anchor role.
    ///
    /// An explicit `reference_baseline` / `minimal_baseline` wins; otherwise
    /// the first baseline whose name contains `Ref` / `Min` (case-insensitive).
    #[must_use]
    pub fn anchor(&self, role: AnchorRole) -> Option<&Baseline> {
        let explicit = match role {
            AnchorRole::Reference => self.reference_baseline.as_deref(),
            AnchorRole::Minimal => self.minimal_baseline.as_deref(),
        };
        if let Some(name) = explicit {
            return self.baselines.iter().find(|b| b.name == name);
        }
        let needle = match role {
            AnchorRole::Reference => "ref",
            AnchorRole::Minimal => "min",
        };
        self.baselines
            .iter()
            .find(|b| b.name.to_ascii_lowercase().contains(needle))
    }

    /// Name of the baseline playing an anchor role, if any.
    #[must_use]
    pub fn anchor_name(&self, role: AnchorRole) -> Option<&str> {
        self.anchor(role).map(|b| b.name.as_str())
    }

    /// Check the experiment for structural errors.
    pub fn validate(&self) -> Result<()> {
        if self.qp_list.is_empty() {
            return Err(Error::Config("qp_list must not be empty".to_string()));
        }
        let mut qps = HashSet::new();
        for qp in &self.qp_list {
            if !qps.insert(*qp) {
                return Err(Error::Config(format!("duplicate QP {qp} in qp_list")));
            }
        }

        if self.sequences.is_empty() {
            return Err(Error::Config("at least one sequence is required".to_string()));
        }
        let mut names = HashSet::new();
        for seq in &self.sequences {
            if seq.name.trim().is_empty() {
                return Err(Error::Config("sequence with empty name".to_string()));
            }
            if !names.insert(seq.name.as_str()) {
                return Err(Error::Config(format!("duplicate sequence {:?}", seq.name)));
            }
            if seq.width == 0 || seq.height == 0 {
                return Err(Error::Config(format!(
                    "sequence {:?} has zero dimension {}x{}",
                    seq.name, seq.width, seq.height
                )));
            }
            if seq.frame_rate == 0 || seq.frame_count == 0 {
                return Err(Error::Config(format!(
                    "sequence {:?} needs a positive frame rate and frame count",
                    seq.name
                )));
            }
        }

        for token in self.fixed_args.iter().filter(|t| !t.trim().is_empty()) {
            args::parse_arg(token)?;
        }

        let mut baseline_names = HashSet::new();
        for baseline in &self.baselines {
            if !baseline_names.insert(baseline.name.as_str()) {
                return Err(Error::Config(format!("duplicate baseline {:?}", baseline.name)));
            }
            for token in &baseline.args {
                args::parse_arg(token)?;
            }
        }
        for (role, name) in [
            (AnchorRole::Reference, &self.reference_baseline),
            (AnchorRole::Minimal, &self.minimal_baseline),
        ] {
            if let Some(name) = name {
                if !baseline_names.contains(name.as_str()) {
                    return Err(Error::Config(format!(
                        "{role} baseline {name:?} is not declared in baselines"
                    )));
                }
            }
        }

        for group in Group::TOOL_GROUPS {
            let mut tool_names = HashSet::new();
            for tool in self.tools(group) {
                if tool.name.trim().is_empty() {
                    return Err(Error::Config(format!("tool with empty name in {group}")));
                }
                if !tool_names.insert(tool.name.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate tool {:?} in {group}",
                        tool.name
                    )));
                }
                for token in &tool.args {
                    args::parse_arg(token)?;
                }
            }
        }

        Ok(())
    }
}
