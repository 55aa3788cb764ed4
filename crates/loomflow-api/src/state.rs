//! Application state wiring the engine together.
//!
//! AppState holds the concrete engine used by both CLI and REST API. The
//! coordinator is generic over repository and artifact store traits; AppState
//! pins it to the SQLite implementations and the HTTP work adapters.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use loomflow_core::workflow::coordinator::RunCoordinator;
use loomflow_core::workflow::definition::PipelineCatalog;
use loomflow_core::workflow::work::{BoxPhaseWork, BoxStepWork};
use loomflow_infra::crypto::hash::Sha256ContentHasher;
use loomflow_infra::filesystem::{db_path, ensure_layout, pipelines_dir};
use loomflow_infra::sqlite::artifact::SqliteArtifactStore;
use loomflow_infra::sqlite::pool::DatabasePool;
use loomflow_infra::sqlite::run::SqliteRunRepository;
use loomflow_infra::work::http::{HttpPhaseWork, HttpStepWork, HttpWorkClient};
use loomflow_types::config::EngineConfig;

/// Coordinator pinned to the infra implementations.
pub type ConcreteCoordinator = RunCoordinator<SqliteRunRepository, SqliteArtifactStore>;

/// Shared application state.
///
/// Used by both CLI commands and REST API handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ConcreteCoordinator>,
    pub catalog: Arc<PipelineCatalog>,
    pub config: Arc<EngineConfig>,
    pub data_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: lay out the data dir, connect to
    /// the database, load pipelines and wire the HTTP work adapters.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let client = HttpWorkClient::new(&config.work)
            .context("Failed to build the work HTTP client")?;
        Self::with_work(
            data_dir,
            config,
            BoxStepWork::new(HttpStepWork::new(client.clone())),
            BoxPhaseWork::new(HttpPhaseWork::new(client)),
        )
        .await
    }

    /// Same as [`AppState::init`] with caller-supplied work functions.
    pub async fn with_work(
        data_dir: PathBuf,
        config: EngineConfig,
        work: BoxStepWork,
        phase_work: BoxPhaseWork,
    ) -> anyhow::Result<Self> {
        ensure_layout(&data_dir).await?;

        let db_url = format!("sqlite://{}?mode=rwc", db_path(&data_dir).display());
        let db_pool = DatabasePool::new(&db_url).await?;

        let catalog = PipelineCatalog::load_dir(&pipelines_dir(&data_dir))?;
        tracing::info!(pipelines = catalog.len(), data_dir = %data_dir.display(), "engine state ready");

        let coordinator = RunCoordinator::new(
            SqliteRunRepository::new(db_pool.clone()),
            SqliteArtifactStore::new(db_pool.clone()),
            Arc::new(Sha256ContentHasher::new()),
            work,
            phase_work,
            config.clone(),
        );

        Ok(Self {
            coordinator: Arc::new(coordinator),
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            data_dir,
            db_pool,
        })
    }

    /// Repair crash leftovers and drive every interrupted run in the background.
    pub async fn recover_in_background(&self) -> anyhow::Result<usize> {
        let run_ids = self.coordinator.recover_interrupted_runs().await?;
        for run_id in &run_ids {
            self.coordinator.spawn_drive(*run_id);
        }
        if !run_ids.is_empty() {
            tracing::info!(count = run_ids.len(), "re-driving interrupted runs");
        }
        Ok(run_ids.len())
    }
}
