//! Plan command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use codec_ablate::experiment::plan::plan;

use super::{JobSelection, load_spec};

pub fn run(spec_path: &Path, output: Option<PathBuf>, select: &JobSelection) -> Result<()> {
    let spec = load_spec(spec_path)?;
    let jobs = plan(&spec, &select.to_options()?).context("Failed to plan jobs")?;

    let mut by_tool: BTreeMap<(String, &str), usize> = BTreeMap::new();
    for job in &jobs {
        *by_tool
            .entry((job.id.group.to_string(), job.id.tool.as_str()))
            .or_default() += 1;
    }

    println!("Planned {} jobs into {}", jobs.len(), spec.output_dir.display());
    println!("{:<15} {:<30} {:>6}", "Group", "Tool", "Jobs");
    println!("{:-<53}", "");
    for ((group, tool), count) in &by_tool {
        println!("{:<15} {:<30} {:>6}", group, tool, count);
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&jobs)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Job list written to: {}", path.display());
    }

    Ok(())
}
