//! CLI run subcommands.
//!
//! Operations that let a run move on (start, approve, reject, review, retry,
//! resume, phase) drive it in-process until it suspends or finishes.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use dialoguer::Confirm;
use uuid::Uuid;

use loomflow_types::approval::ReviewVerdict;
use loomflow_types::phase::PhaseEvent;
use loomflow_types::run::Run;

use crate::cli::output::{print_run, print_snapshot, run_status_cell, short_id, spinner};
use crate::state::AppState;

/// Run subcommands.
#[derive(Subcommand)]
pub enum RunCommand {
    /// Start a run of a loaded pipeline.
    Start {
        /// Pipeline name.
        pipeline: String,

        /// Run input as JSON.
        #[arg(long)]
        input: Option<String>,

        /// Create the run without driving it (a server or `recover` picks it up).
        #[arg(long)]
        detach: bool,
    },

    /// List recent runs, newest first.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show a run with its steps, attempts, decisions and phases.
    Show { run_id: String },

    /// Approve the gate a run waits on.
    Approve {
        run_id: String,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Reject the gate a run waits on and re-run its rework steps.
    Reject {
        run_id: String,
        /// Why the output was rejected (required).
        #[arg(long)]
        reason: String,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Review the members of a parallel group.
    Review {
        run_id: String,
        /// Accept a member's output (repeatable).
        #[arg(long = "approve", value_name = "STEP")]
        approve: Vec<String>,
        /// Re-run a member with an instruction, as STEP=INSTRUCTION (repeatable).
        #[arg(long = "retry", value_name = "STEP=INSTRUCTION")]
        retry: Vec<String>,
        #[arg(long)]
        actor: Option<String>,
    },

    /// Re-run a step of a failed or waiting run under a new revision.
    Retry { run_id: String, step: String },

    /// Fork a new run that reuses outputs before STEP and starts there.
    Resume { run_id: String, step: String },

    /// Cancel a run. Committed outputs are kept.
    Cancel {
        run_id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Send an event to a run's phased step, e.g. '{"event":"skip"}'.
    Phase {
        run_id: String,
        step: String,
        /// Phase event as JSON.
        event: String,
    },
}

/// Handle a run subcommand.
pub async fn handle_run_command(
    cmd: RunCommand,
    tenant: &str,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        RunCommand::Start {
            pipeline,
            input,
            detach,
        } => handle_start(&pipeline, input.as_deref(), detach, tenant, state, json).await,
        RunCommand::List { limit } => handle_list(limit, tenant, state, json).await,
        RunCommand::Show { run_id } => {
            let snapshot = state
                .coordinator
                .snapshot(parse_run_id(&run_id)?, tenant)
                .await?;
            print_snapshot(&snapshot, json)
        }
        RunCommand::Approve { run_id, actor } => {
            let run_id = parse_run_id(&run_id)?;
            let actor = actor_or_default(actor);
            state.coordinator.approve(run_id, tenant, &actor).await?;
            drive_and_report(state, run_id, json).await
        }
        RunCommand::Reject {
            run_id,
            reason,
            actor,
        } => {
            let run_id = parse_run_id(&run_id)?;
            let actor = actor_or_default(actor);
            state
                .coordinator
                .reject(run_id, tenant, &reason, &actor)
                .await?;
            drive_and_report(state, run_id, json).await
        }
        RunCommand::Review {
            run_id,
            approve,
            retry,
            actor,
        } => {
            let run_id = parse_run_id(&run_id)?;
            let decisions = build_review(&approve, &retry)?;
            let actor = actor_or_default(actor);
            state
                .coordinator
                .review_group(run_id, tenant, decisions, &actor)
                .await?;
            drive_and_report(state, run_id, json).await
        }
        RunCommand::Retry { run_id, step } => {
            let run_id = parse_run_id(&run_id)?;
            state.coordinator.retry_step(run_id, tenant, &step).await?;
            drive_and_report(state, run_id, json).await
        }
        RunCommand::Resume { run_id, step } => {
            let forked = state
                .coordinator
                .resume(parse_run_id(&run_id)?, tenant, &step)
                .await?;
            if !json {
                println!(
                    "  {} Forked run {} from {}",
                    style("*").green().bold(),
                    style(short_id(&forked.id)).cyan(),
                    run_id
                );
            }
            drive_and_report(state, forked.id, json).await
        }
        RunCommand::Cancel { run_id, force } => handle_cancel(&run_id, force, tenant, state, json).await,
        RunCommand::Phase {
            run_id,
            step,
            event,
        } => {
            let run_id = parse_run_id(&run_id)?;
            let event: PhaseEvent = serde_json::from_str(&event)
                .with_context(|| format!("Invalid phase event JSON: '{event}'"))?;
            let record = state
                .coordinator
                .submit_phase_event(run_id, tenant, &step, event)
                .await?;
            if !json {
                println!(
                    "  {} '{}' is now {}",
                    style("*").green().bold(),
                    step,
                    style(record.state.phase.kind()).cyan()
                );
            }
            drive_and_report(state, run_id, json).await
        }
    }
}

// ---------------------------------------------------------------------------
// Start / list / cancel
// ---------------------------------------------------------------------------

async fn handle_start(
    pipeline: &str,
    input: Option<&str>,
    detach: bool,
    tenant: &str,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let input = match input {
        Some(raw) => serde_json::from_str(raw)
            .with_context(|| format!("Invalid input JSON: '{raw}'"))?,
        None => serde_json::Value::Null,
    };
    let def = state.catalog.get(pipeline)?;
    let run = state.coordinator.create_run(tenant, def, input).await?;

    if detach {
        return print_run(&run, json);
    }
    if !json {
        println!(
            "  {} Started run {} of '{}'",
            style("*").green().bold(),
            style(short_id(&run.id)).cyan(),
            pipeline
        );
    }
    drive_and_report(state, run.id, json).await
}

async fn handle_list(limit: u32, tenant: &str, state: &AppState, json: bool) -> Result<()> {
    let runs = state.coordinator.list_runs(tenant, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for tenant '{tenant}'.");
        println!(
            "  Start one with: {}",
            style("lflow run start <pipeline>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Pipeline"),
            Cell::new("Status"),
            Cell::new("At"),
            Cell::new("Updated"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            Cell::new(&run.pipeline),
            run_status_cell(run.status),
            Cell::new(run.current_step.as_deref().unwrap_or("-")),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_cancel(
    run_id_str: &str,
    force: bool,
    tenant: &str,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;

    if !force && !json {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Cancel run '{}'? Committed outputs are kept.",
                style(short_id(&run_id)).red().bold()
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("  Aborted.");
            return Ok(());
        }
    }

    let run = state.coordinator.cancel(run_id, tenant).await?;
    if json {
        return print_run(&run, true);
    }
    println!();
    println!(
        "  {} Cancelled run '{}'",
        style("*").green().bold(),
        style(short_id(&run_id)).cyan()
    );
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Drive a run in-process until it suspends or finishes, then print it.
async fn drive_and_report(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let run = drive_with_spinner(state, run_id, json).await?;
    print_run(&run, json)
}

async fn drive_with_spinner(state: &AppState, run_id: Uuid, json: bool) -> Result<Run> {
    if json {
        return Ok(state.coordinator.drive(run_id).await?);
    }
    let spinner = spinner(format!("Driving run {}...", short_id(&run_id)))?;
    let result = state.coordinator.drive(run_id).await;
    spinner.finish_and_clear();
    Ok(result?)
}

fn parse_run_id(raw: &str) -> Result<Uuid> {
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid run ID: '{raw}'"))
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string())
}

/// Build review verdicts from `--approve STEP` and `--retry STEP=INSTRUCTION`.
fn build_review(approve: &[String], retry: &[String]) -> Result<BTreeMap<String, ReviewVerdict>> {
    let mut decisions = BTreeMap::new();
    for step in approve {
        decisions.insert(step.trim().to_string(), ReviewVerdict::Approve);
    }
    for raw in retry {
        let Some((step, instruction)) = raw.split_once('=') else {
            bail!("Expected STEP=INSTRUCTION, got '{raw}'");
        };
        let step = step.trim().to_string();
        if decisions.contains_key(&step) {
            bail!("Step '{step}' is both approved and retried");
        }
        decisions.insert(
            step,
            ReviewVerdict::Retry {
                instruction: instruction.trim().to_string(),
            },
        );
    }
    if decisions.is_empty() {
        bail!("Give at least one --approve or --retry decision");
    }
    Ok(decisions)
}
