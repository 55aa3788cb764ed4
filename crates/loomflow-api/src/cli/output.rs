//! Shared terminal rendering for run commands.

use std::time::Duration;

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use loomflow_types::run::{Run, RunSnapshot, RunStatus, StepStatus};

/// First eight characters of an ID, for tables.
pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn spinner(message: impl Into<String>) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(message.into());
    spinner.enable_steady_tick(Duration::from_millis(80));
    Ok(spinner)
}

pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::WaitingApproval | RunStatus::WaitingImageInput => Color::Magenta,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
        RunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::Yellow,
        StepStatus::Running => Color::Blue,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::DarkGrey,
    };
    Cell::new(status.as_str()).fg(color)
}

/// One-line hint for what the operator can do next.
pub fn next_action(run: &Run) -> Option<String> {
    let id = run.id;
    match run.status {
        RunStatus::WaitingApproval => Some(format!(
            "lflow run approve {id}  |  lflow run reject {id} --reason <text>"
        )),
        RunStatus::WaitingImageInput => {
            let step = run.current_step.as_deref().unwrap_or("<step>");
            Some(format!("lflow run phase {id} {step} '<event json>'"))
        }
        RunStatus::Failed => {
            let step = run
                .failure
                .as_ref()
                .map(|f| f.step.as_str())
                .unwrap_or("<step>");
            Some(format!("lflow run retry {id} {step}  |  lflow run resume {id} {step}"))
        }
        _ => None,
    }
}

/// Print a run header: ID, pipeline, status, failure and next action.
pub fn print_run(run: &Run, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({})",
        style("Run").bold(),
        style(run.id.to_string()).cyan(),
        run.pipeline
    );
    println!("  Status:  {}", style(run.status).bold());
    println!("  Tenant:  {}", run.tenant_id);
    if let Some(step) = &run.current_step {
        println!("  At:      {step}");
    }
    if let Some(source) = &run.forked_from {
        println!("  Forked from: {}", style(source.to_string()).dim());
    }
    if let Some(failure) = &run.failure {
        println!(
            "  Failure: {} at '{}': {}",
            style(failure.code.as_str()).red(),
            failure.step,
            failure.message
        );
    }
    if let Some(hint) = next_action(run) {
        println!("  Next:    {}", style(hint).dim());
    }
    println!();
    Ok(())
}

/// Print a full snapshot: run header plus a step table and gate decisions.
pub fn print_snapshot(snapshot: &RunSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    print_run(&snapshot.run, false)?;

    if !snapshot.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Rev"),
                Cell::new("Attempts"),
                Cell::new("Output"),
                Cell::new("Error"),
            ]);

        for entry in &snapshot.steps {
            let output = entry
                .artifact
                .as_ref()
                .map(|a| {
                    let digest: String = a.digest.chars().take(12).collect();
                    format!("{digest} {}", a.summary)
                })
                .unwrap_or_else(|| "-".to_string());
            let error = entry
                .step
                .error
                .as_ref()
                .map(|e| e.message.chars().take(40).collect::<String>())
                .unwrap_or_else(|| "-".to_string());

            table.add_row(vec![
                Cell::new(&entry.step.name),
                step_status_cell(entry.step.status),
                Cell::new(entry.step.revision),
                Cell::new(entry.attempts.len()),
                Cell::new(output),
                Cell::new(error),
            ]);
        }
        println!("{table}");
        println!();
    }

    for decision in &snapshot.decisions {
        println!(
            "  {} {} by {}{}",
            style(decision.decision.as_str()).bold(),
            decision.gate_id,
            decision.actor,
            decision
                .reason
                .as_ref()
                .map(|r| format!(": {r}"))
                .unwrap_or_default()
        );
    }
    for phase in &snapshot.phases {
        println!(
            "  {} phase: {}",
            style(&phase.step).cyan(),
            phase.state.phase.kind()
        );
    }
    if !snapshot.decisions.is_empty() || !snapshot.phases.is_empty() {
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loomflow_types::pipeline::RunPlan;
    use loomflow_types::run::{ErrorCode, RunFailure};

    fn run(status: RunStatus) -> Run {
        Run {
            id: Uuid::now_v7(),
            tenant_id: "acme".to_string(),
            pipeline: "brief".to_string(),
            status,
            cursor: 0,
            current_step: None,
            plan: RunPlan {
                pipeline: "brief".to_string(),
                version: "1.0.0".to_string(),
                segments: vec![],
            },
            input: serde_json::Value::Null,
            forked_from: None,
            failure: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_short_id() {
        let id = Uuid::now_v7();
        assert_eq!(short_id(&id), id.to_string()[..8]);
    }

    #[test]
    fn test_next_action_names_failed_step() {
        let mut failed = run(RunStatus::Failed);
        failed.failure = Some(RunFailure {
            step: "outline".to_string(),
            code: ErrorCode::NonRetryable,
            message: "unauthorized".to_string(),
        });
        let hint = next_action(&failed).unwrap();
        assert!(hint.contains("retry"));
        assert!(hint.contains("outline"));
    }

    #[test]
    fn test_no_next_action_for_finished_runs() {
        assert!(next_action(&run(RunStatus::Completed)).is_none());
        assert!(next_action(&run(RunStatus::Cancelled)).is_none());
        assert!(next_action(&run(RunStatus::WaitingApproval)).is_some());
    }
}
