//! Harvest orchestration: cursor reader, detail processor and merge writer wired into a
//! fault-tolerant chunked step, plus the launcher, run coordinator and cron triggers.

use std::sync::Arc;

use anyhow::{Context, Result};
use harvest_adapters::{DetailSource, HtmlCompanySite, ListingSource, SiteConfig};
use harvest_storage::{
    connect_pool, run_migrations, CompanyStore, CursorStore, ExecutionStore, FileCursorStore,
    HttpFetcher, PgCompanyStore, PgExecutionStore,
};
use tracing::info;

pub mod config;
pub mod coordinator;
pub mod job;
pub mod launcher;
pub mod pipeline;
pub mod processor;
pub mod reader;
pub mod scheduler;
pub mod similarity;
pub mod writer;

#[cfg(test)]
mod testing;

pub use config::HarvestConfig;
pub use coordinator::{status_message, CoordinatorSettings, RunCoordinator};
pub use job::{HarvestJob, StepSettings};
pub use launcher::{Job, JobLauncher, LaunchError};
pub use pipeline::{
    ChunkedStep, FaultMode, FaultTolerancePolicy, ItemProcessor, ItemReader, ItemWriter,
    StepReport, StopSignal,
};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use similarity::address_similarity;
pub use writer::{MergeWriter, DEFAULT_MERGE_THRESHOLD};

pub const CRATE_NAME: &str = "harvest-sync";

/// Store and site collaborators of one harvester.
pub struct Components {
    pub listing: Arc<dyn ListingSource>,
    pub details: Arc<dyn DetailSource>,
    pub companies: Arc<dyn CompanyStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

/// Fully wired harvester shared by the CLI, the scheduler and the web surface.
#[derive(Clone)]
pub struct HarvestRuntime {
    pub config: HarvestConfig,
    pub coordinator: Arc<RunCoordinator>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl HarvestRuntime {
    pub fn assemble(config: HarvestConfig, components: Components) -> Self {
        let job = HarvestJob::new(
            components.listing,
            components.details,
            components.companies,
            components.cursors,
            config.step_settings(),
        );
        let launcher = JobLauncher::new(components.executions.clone(), config.stale_after());
        let coordinator = RunCoordinator::new(
            Arc::new(launcher),
            Arc::new(job),
            config.coordinator_settings(),
        );
        Self {
            config,
            coordinator: Arc::new(coordinator),
            executions: components.executions,
        }
    }

    /// Postgres stores, file cursors and the live site.
    pub async fn from_config(config: HarvestConfig) -> Result<Self> {
        let pool = connect_pool(&config.database_url).await?;
        let site_config = match &config.site_config {
            Some(path) => SiteConfig::from_yaml_file(path)?,
            None => SiteConfig::default(),
        };
        let http = Arc::new(HttpFetcher::new(config.http_config()).context("building http fetcher")?);
        let site = Arc::new(HtmlCompanySite::new(http, site_config));
        info!(
            cursor_dir = %config.cursor_dir.display(),
            max_page = config.max_page,
            chunk_size = config.chunk_size,
            "harvest runtime ready"
        );
        let components = Components {
            listing: site.clone(),
            details: site,
            companies: Arc::new(PgCompanyStore::new(pool.clone())),
            cursors: Arc::new(FileCursorStore::new(config.cursor_dir.clone())),
            executions: Arc::new(PgExecutionStore::new(pool)),
        };
        Ok(Self::assemble(config, components))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(HarvestConfig::from_env()).await
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.coordinator.launcher().stop_signal()
    }
}

pub async fn migrate_from_env() -> Result<()> {
    let config = HarvestConfig::from_env();
    let pool = connect_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    info!("migrations applied");
    Ok(())
}
