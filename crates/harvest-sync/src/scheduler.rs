use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::HarvestConfig;
use crate::coordinator::{status_message, RunCoordinator};

/// Weekly full run plus daily recover-or-run. The scheduler is returned unstarted.
pub async fn build_scheduler(
    coordinator: Arc<RunCoordinator>,
    run_cron: &str,
    recover_cron: &str,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let run_job = {
        let coordinator = coordinator.clone();
        Job::new_async(run_cron, move |_uuid, _l| {
            let coordinator = coordinator.clone();
            Box::pin(async move {
                info!("scheduled harvest run triggered");
                match coordinator.run_now().await {
                    Ok(status) => info!("{}", status_message(status)),
                    Err(err) => error!(error = %err, "scheduled harvest run could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {run_cron}"))?
    };
    sched.add(run_job).await.context("adding run job")?;

    let recover_job = Job::new_async(recover_cron, move |_uuid, _l| {
        let coordinator = coordinator.clone();
        Box::pin(async move {
            info!("scheduled recover-or-run triggered");
            if let Some(execution) = coordinator.recover_or_run().await {
                info!(execution_id = %execution.id, "{}", status_message(execution.status));
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {recover_cron}"))?;
    sched.add(recover_job).await.context("adding recover job")?;

    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &HarvestConfig,
    coordinator: Arc<RunCoordinator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        warn!("scheduler disabled; set HARVEST_SCHEDULER_ENABLED=true to enable cron triggers");
        return Ok(None);
    }
    build_scheduler(coordinator, &config.run_cron, &config.recover_cron)
        .await
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorSettings;
    use crate::launcher::JobLauncher;
    use crate::{HarvestJob, StepSettings};
    use harvest_storage::{MemoryCompanyStore, MemoryCursorStore, MemoryExecutionStore};

    fn coordinator() -> Arc<RunCoordinator> {
        let site = Arc::new(crate::testing::ScriptedSite::with_pages(&[]));
        let job = HarvestJob::new(
            site.clone(),
            site,
            Arc::new(MemoryCompanyStore::new()),
            Arc::new(MemoryCursorStore::new()),
            StepSettings::default(),
        );
        let launcher = JobLauncher::new(
            Arc::new(MemoryExecutionStore::new()),
            chrono::Duration::hours(6),
        );
        Arc::new(RunCoordinator::new(
            Arc::new(launcher),
            Arc::new(job),
            CoordinatorSettings::default(),
        ))
    }

    #[tokio::test]
    async fn default_crons_are_accepted() {
        let config = HarvestConfig::default();
        build_scheduler(coordinator(), &config.run_cron, &config.recover_cron)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let err = build_scheduler(coordinator(), "every saturday", "0 0 2 * * *")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("every saturday"));
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = HarvestConfig::default();
        assert!(maybe_build_scheduler(&config, coordinator())
            .await
            .unwrap()
            .is_none());
    }
}
