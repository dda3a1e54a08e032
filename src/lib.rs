//! # codec-ablate
//!
//! Ablation studies for video encoders.
//!
//! An [`ExperimentSpec`] names sequences, a QP sweep, anchor configurations
//! and groups of tool variants. The library expands it into encode jobs,
//! runs them against an external encoder with bounded parallelism, reads
//! rate and quality out of the encoder logs and compares every tool against
//! its anchor with Bjøntegaard-Delta metrics. Per-tool benefits are then
//! ranked, tiered and turned into flag presets.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use codec_ablate::{ExperimentSpec, RunConfig, Runner};
//! use codec_ablate::experiment::plan::{plan, PlanOptions};
//! use codec_ablate::analysis::{compute_bd_metrics, AnalysisConfig};
//!
//! let spec = ExperimentSpec::load("experiment.yaml")?;
//! let jobs = plan(&spec, &PlanOptions::default())?;
//!
//! let config = RunConfig::builder().max_parallel(8).build();
//! let summary = Runner::new(config).run(&spec, &jobs)?;
//!
//! let rows = codec_ablate::run::ResultsLedger::load(&summary.ledger_path)?;
//! let metrics = compute_bd_metrics(&rows, &AnalysisConfig::from_spec(&spec));
//! ```
//!
//! ## Modules
//!
//! - [`error`]: Error types for the library
//! - [`experiment`]: Experiment files, argument merging and job planning
//! - [`run`]: Encoder execution, results ledger, progress and log collection
//! - [`metrics`]: Rate and quality extraction from encoder logs
//! - [`stats`]: Descriptive statistics and BD-Rate / BD-PSNR
//! - [`analysis`]: BD metrics per tool, ranking and reports

pub mod analysis;
pub mod error;
pub mod experiment;
pub mod metrics;
pub mod run;
pub mod stats;

// Re-export commonly used types
pub use analysis::{AnalysisConfig, BdMetric, OverviewRow, RankingConfig, Thresholds, ToolEffect};
pub use error::{Error, Result};
pub use experiment::plan::{Job, JobId, PlanOptions};
pub use experiment::{ExperimentSpec, Group, Sequence, ToolVariant};
pub use metrics::{LogMetrics, MetricExtractor};
pub use run::{JobResult, JobStatus, RunConfig, RunSummary, Runner};
pub use stats::{BdStatus, RdPoint, RdSet, Summary};
