//! CLI pipeline subcommands.
//!
//! Pipelines live as YAML files under `{data_dir}/pipelines/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use loomflow_core::workflow::definition::{build_run_plan, load_pipeline_file, save_pipeline_file};
use loomflow_infra::filesystem::pipelines_dir;
use loomflow_types::config::EngineConfig;
use loomflow_types::pipeline::{PipelineDefinition, PlanSegment};

use crate::state::AppState;

/// Pipeline subcommands.
#[derive(Subcommand)]
pub enum PipelineCommand {
    /// List loaded pipelines.
    #[command(alias = "ls")]
    List,

    /// Show a loaded pipeline's resolved plan.
    Show { name: String },

    /// Parse and validate a pipeline file without installing it.
    Validate { file: PathBuf },

    /// Validate a pipeline file and install it into the data directory.
    Add {
        file: PathBuf,
        /// Replace an installed pipeline with the same name.
        #[arg(long)]
        force: bool,
    },
}

/// Handle a pipeline subcommand.
pub async fn handle_pipeline_command(
    cmd: PipelineCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        PipelineCommand::List => handle_list(state, json),
        PipelineCommand::Show { name } => {
            let def = state.catalog.get(&name)?;
            print_plan(def, &state.config, json)
        }
        PipelineCommand::Validate { file } => {
            let def = load_pipeline_file(&file)
                .with_context(|| format!("Pipeline file '{}' is invalid", file.display()))?;
            if !json {
                println!(
                    "  {} '{}' v{} is valid",
                    style("✓").green(),
                    style(&def.name).cyan(),
                    def.version
                );
            }
            print_plan(&def, &state.config, json)
        }
        PipelineCommand::Add { file, force } => handle_add(&file, force, state, json),
    }
}

fn handle_list(state: &AppState, json: bool) -> Result<()> {
    if json {
        let defs: Vec<&PipelineDefinition> = state.catalog.list().collect();
        println!("{}", serde_json::to_string_pretty(&defs)?);
        return Ok(());
    }

    if state.catalog.is_empty() {
        println!();
        println!("  No pipelines loaded.");
        println!(
            "  Add one with: {}",
            style("lflow pipeline add <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Segments"),
            Cell::new("Description"),
        ]);

    for def in state.catalog.list() {
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(&def.version),
            Cell::new(def.segments.len()),
            Cell::new(def.description.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn handle_add(file: &Path, force: bool, state: &AppState, json: bool) -> Result<()> {
    let def = load_pipeline_file(file)
        .with_context(|| format!("Pipeline file '{}' is invalid", file.display()))?;
    if state.catalog.get(&def.name).is_ok() && !force {
        bail!(
            "Pipeline '{}' is already installed. Pass --force to replace it.",
            def.name
        );
    }

    let target = install_path(&state.data_dir, &def.name);
    save_pipeline_file(&target, &def)?;

    if json {
        println!(
            "{}",
            serde_json::json!({"installed": def.name, "path": target.display().to_string()})
        );
    } else {
        println!();
        println!(
            "  {} Installed '{}' at {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            style(target.display()).dim()
        );
        println!();
    }
    Ok(())
}

fn install_path(data_dir: &Path, name: &str) -> PathBuf {
    pipelines_dir(data_dir).join(format!("{name}.yaml"))
}

fn print_plan(def: &PipelineDefinition, config: &EngineConfig, json: bool) -> Result<()> {
    let plan = build_run_plan(def, config);
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#").fg(Color::Cyan),
            Cell::new("Segment"),
            Cell::new("Kind"),
            Cell::new("Steps"),
            Cell::new("Retry"),
            Cell::new("Timeout"),
        ]);

    for (index, segment) in plan.segments.iter().enumerate() {
        let kind = match segment {
            PlanSegment::Step { .. } => "step".to_string(),
            PlanSegment::Parallel { review: true, .. } => "parallel (reviewed)".to_string(),
            PlanSegment::Parallel { .. } => "parallel".to_string(),
            PlanSegment::Approval { on_reject, .. } if !on_reject.is_empty() => {
                format!("approval (rework: {})", on_reject.join(", "))
            }
            PlanSegment::Approval { .. } => "approval".to_string(),
            PlanSegment::Phased { .. } => "phased".to_string(),
        };
        let steps = segment.steps();
        let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        let retry = steps
            .first()
            .map(|s| s.retry.max_attempts.to_string())
            .unwrap_or_else(|| "-".to_string());
        let timeout = steps
            .first()
            .map(|s| format!("{}s", s.timeout_secs))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(index),
            Cell::new(segment.id()),
            Cell::new(kind),
            Cell::new(if names.is_empty() { "-".to_string() } else { names.join(", ") }),
            Cell::new(retry),
            Cell::new(timeout),
        ]);
    }

    println!();
    println!("  {} v{}", style(&plan.pipeline).cyan().bold(), plan.version);
    println!("{table}");
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_path_uses_pipeline_name() {
        let path = install_path(Path::new("/data"), "brief");
        assert_eq!(path, PathBuf::from("/data/pipelines/brief.yaml"));
    }
}
