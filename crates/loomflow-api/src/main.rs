//! Loomflow CLI and REST API entry point.
//!
//! Binary name: `lflow`
//!
//! Parses CLI arguments, loads configuration, initializes logging, the
//! database and the engine, then dispatches to the command handler or
//! starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};

use loomflow_infra::config::load_engine_config;
use loomflow_infra::filesystem::resolve_data_dir;
use loomflow_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

use cli::output::{run_status_cell, short_id};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need engine state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "lflow", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = resolve_data_dir();
    let config = load_engine_config(&data_dir).await;

    if let Err(e) = init_tracing(config.enable_otel, verbosity_filter(cli.verbose, cli.quiet)) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli, data_dir, config).await;
    shutdown_tracing();
    result
}

async fn run(
    cli: Cli,
    data_dir: std::path::PathBuf,
    config: loomflow_types::config::EngineConfig,
) -> anyhow::Result<()> {
    let state = AppState::init(data_dir, config).await?;

    match cli.command {
        Commands::Pipeline { action } => {
            cli::pipeline::handle_pipeline_command(action, &state, cli.json).await?;
        }

        Commands::Run { tenant, action } => {
            cli::run::handle_run_command(action, &tenant, &state, cli.json).await?;
        }

        Commands::Recover => recover(&state, cli.json).await?,

        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);

            if state.config.recover_on_start {
                let resumed = state.recover_in_background().await?;
                if resumed > 0 {
                    println!(
                        "  {} Re-driving {resumed} interrupted run(s)",
                        console::style("↻").bold()
                    );
                }
            }

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} Loomflow API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!(
                "  {} pipeline(s) loaded from {}",
                state.catalog.len(),
                console::style(state.data_dir.display()).dim()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Repair crash leftovers, then drive each interrupted run in-process.
async fn recover(state: &AppState, json: bool) -> anyhow::Result<()> {
    let run_ids = state.coordinator.recover_interrupted_runs().await?;

    let mut runs = Vec::with_capacity(run_ids.len());
    for run_id in run_ids {
        match state.coordinator.drive(run_id).await {
            Ok(run) => runs.push(run),
            Err(e) => tracing::error!(run_id = %run_id, error = %e, "recovered run failed to drive"),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No interrupted runs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Tenant"),
            Cell::new("Pipeline"),
            Cell::new("Status"),
        ]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            Cell::new(&run.tenant_id),
            Cell::new(&run.pipeline),
            run_status_cell(run.status),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
