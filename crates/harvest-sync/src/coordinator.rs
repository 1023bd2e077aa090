use std::sync::Arc;

use chrono::{Duration, SecondsFormat, Utc};
use harvest_core::{BatchStatus, JobExecutionRecord, JobParameters};
use harvest_storage::{ExecutionStore, StoreError};
use tracing::{error, info};

use crate::launcher::{Job, JobLauncher, LaunchError};

/// Response text of the manual trigger.
pub fn status_message(status: BatchStatus) -> String {
    format!("Job status: {status}")
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Failed executions older than this are not recovered.
    pub lookback: Duration,
    /// How many recent instances recovery inspects.
    pub instance_scan: usize,
    /// Add `run.id` = previous + 1 to fresh parameter sets.
    pub auto_increment: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            lookback: Duration::hours(24),
            instance_scan: 100,
            auto_increment: false,
        }
    }
}

/// Entry points for triggers: a fresh run, or a relaunch of the latest recent failure.
pub struct RunCoordinator {
    launcher: Arc<JobLauncher>,
    job: Arc<dyn Job>,
    settings: CoordinatorSettings,
}

impl RunCoordinator {
    pub fn new(launcher: Arc<JobLauncher>, job: Arc<dyn Job>, settings: CoordinatorSettings) -> Self {
        Self {
            launcher,
            job,
            settings,
        }
    }

    pub fn launcher(&self) -> &Arc<JobLauncher> {
        &self.launcher
    }

    pub fn job_name(&self) -> &str {
        self.job.name()
    }

    fn executions(&self) -> Arc<dyn ExecutionStore> {
        self.launcher.executions()
    }

    /// Launch with fresh parameters and wait for the final status.
    pub async fn run_now(&self) -> Result<BatchStatus, LaunchError> {
        let parameters = self.fresh_parameters().await?;
        let execution = self.launcher.run(self.job.as_ref(), parameters).await?;
        Ok(execution.status)
    }

    /// Relaunch the most recent FAILED execution inside the lookback window, or start a
    /// fresh run when there is none. Errors are logged, never returned.
    pub async fn recover_or_run(&self) -> Option<JobExecutionRecord> {
        match self.try_recover_or_run().await {
            Ok(execution) => Some(execution),
            Err(err) => {
                error!(job = %self.job.name(), error = %err, "recover-or-run failed");
                None
            }
        }
    }

    async fn try_recover_or_run(&self) -> Result<JobExecutionRecord, LaunchError> {
        let parameters = match self.latest_recoverable_failure().await? {
            Some(failed) => {
                info!(
                    execution_id = %failed.id,
                    started = ?failed.start_time,
                    parameters = %failed.parameters,
                    "recovering failed execution"
                );
                failed
                    .parameters
                    .with_long(JobParameters::TIME, Utc::now().timestamp_millis())
            }
            None => {
                info!("no recent failed execution; starting fresh run");
                self.fresh_parameters().await?
            }
        };
        self.launcher.run(self.job.as_ref(), parameters).await
    }

    pub async fn latest_recoverable_failure(&self) -> Result<Option<JobExecutionRecord>, StoreError> {
        let store = self.executions();
        let cutoff = Utc::now() - self.settings.lookback;
        let instances = store
            .find_instances_by_job_name(self.job.name(), 0, self.settings.instance_scan)
            .await?;

        let mut latest: Option<JobExecutionRecord> = None;
        for instance in instances {
            let executions = store.executions_for_instance(&instance).await?;
            // A completed instance cannot be relaunched, whatever failed before it.
            if executions.iter().any(|e| e.status == BatchStatus::Completed) {
                continue;
            }
            let Some(last) = executions.into_iter().max_by_key(|e| e.start_time) else {
                continue;
            };
            let Some(started) = last.start_time else {
                continue;
            };
            if last.status != BatchStatus::Failed || started < cutoff {
                continue;
            }
            if latest
                .as_ref()
                .and_then(|l| l.start_time)
                .map_or(true, |best| started > best)
            {
                latest = Some(last);
            }
        }
        Ok(latest)
    }

    async fn fresh_parameters(&self) -> Result<JobParameters, StoreError> {
        let now = Utc::now();
        let mut parameters = JobParameters::new()
            .with_string(
                JobParameters::DATE,
                now.to_rfc3339_opts(SecondsFormat::Nanos, true),
            )
            .with_long(JobParameters::TIME, now.timestamp_millis());
        if self.settings.auto_increment {
            let previous = self
                .executions()
                .find_executions_by_job_name(self.job.name(), 0, 1)
                .await?
                .first()
                .and_then(|e| e.parameters.get_long(JobParameters::RUN_ID))
                .unwrap_or(0);
            parameters = parameters.with_long(JobParameters::RUN_ID, previous + 1);
        }
        Ok(parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::StepCounters;
    use harvest_storage::MemoryExecutionStore;
    use std::sync::Mutex;

    use crate::pipeline::{StepReport, StopSignal};

    #[derive(Default)]
    struct RecordingJob {
        launched: Mutex<Vec<JobParameters>>,
    }

    #[async_trait]
    impl Job for RecordingJob {
        fn name(&self) -> &str {
            "harvest"
        }

        async fn execute(&self, execution: &JobExecutionRecord, _stop: &StopSignal) -> StepReport {
            self.launched
                .lock()
                .unwrap()
                .push(execution.parameters.clone());
            StepReport {
                status: BatchStatus::Completed,
                counters: StepCounters::default(),
                failure: None,
            }
        }
    }

    fn history(date: &str, hours_ago: i64, status: BatchStatus) -> JobExecutionRecord {
        let mut e = JobExecutionRecord::starting(
            "harvest",
            JobParameters::new()
                .with_string(JobParameters::DATE, date)
                .with_long(JobParameters::TIME, 1),
        );
        e.start_time = Some(Utc::now() - Duration::hours(hours_ago));
        e.end_time = e.start_time;
        e.status = status;
        e
    }

    fn coordinator(
        store: &MemoryExecutionStore,
        settings: CoordinatorSettings,
    ) -> (RunCoordinator, Arc<RecordingJob>) {
        let job = Arc::new(RecordingJob::default());
        let launcher = Arc::new(JobLauncher::new(Arc::new(store.clone()), Duration::hours(6)));
        (RunCoordinator::new(launcher, job.clone(), settings), job)
    }

    #[tokio::test]
    async fn run_now_reports_final_status() {
        let store = MemoryExecutionStore::new();
        let (coordinator, job) = coordinator(&store, CoordinatorSettings::default());
        let status = coordinator.run_now().await.unwrap();
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(status_message(status), "Job status: COMPLETED");

        let launched = job.launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        assert!(launched[0].get(JobParameters::DATE).is_some());
        assert!(launched[0].get_long(JobParameters::TIME).is_some());
        assert!(launched[0].get(JobParameters::RUN_ID).is_none());
    }

    #[tokio::test]
    async fn recovers_latest_failure_within_window() {
        let store = MemoryExecutionStore::new();
        let failed = history("failed-run", 2, BatchStatus::Failed);
        let failed_key = failed.instance_key.clone();
        store.seed(failed).await;
        store
            .seed(history("completed-run", 1, BatchStatus::Completed))
            .await;

        let (coordinator, job) = coordinator(&store, CoordinatorSettings::default());
        let execution = coordinator.recover_or_run().await.unwrap();

        assert_eq!(execution.instance_key, failed_key);
        assert_eq!(execution.status, BatchStatus::Completed);
        let launched = job.launched.lock().unwrap().clone();
        assert_eq!(
            launched[0].get(JobParameters::DATE).unwrap().to_string(),
            "failed-run"
        );
        assert_ne!(launched[0].get_long(JobParameters::TIME), Some(1));
    }

    #[tokio::test]
    async fn picks_most_recent_of_several_failures() {
        let store = MemoryExecutionStore::new();
        store.seed(history("older", 5, BatchStatus::Failed)).await;
        store.seed(history("newer", 3, BatchStatus::Failed)).await;

        let (coordinator, _job) = coordinator(&store, CoordinatorSettings::default());
        let failure = coordinator.latest_recoverable_failure().await.unwrap().unwrap();
        assert_eq!(
            failure.parameters.get(JobParameters::DATE).unwrap().to_string(),
            "newer"
        );
    }

    #[tokio::test]
    async fn failure_later_completed_is_not_recovered() {
        let store = MemoryExecutionStore::new();
        let failed = history("retried-run", 3, BatchStatus::Failed);
        let finished_key = failed.instance_key.clone();
        store.seed(failed).await;
        store
            .seed(history("retried-run", 2, BatchStatus::Completed))
            .await;

        let (coordinator, job) = coordinator(&store, CoordinatorSettings::default());
        assert!(coordinator.latest_recoverable_failure().await.unwrap().is_none());

        let execution = coordinator.recover_or_run().await.unwrap();
        assert_ne!(execution.instance_key, finished_key);
        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(job.launched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_fresh_run_outside_window() {
        let store = MemoryExecutionStore::new();
        let stale = history("last-week", 30, BatchStatus::Failed);
        let stale_key = stale.instance_key.clone();
        store.seed(stale).await;

        let (coordinator, job) = coordinator(&store, CoordinatorSettings::default());
        let execution = coordinator.recover_or_run().await.unwrap();

        assert_ne!(execution.instance_key, stale_key);
        let launched = job.launched.lock().unwrap().clone();
        assert_ne!(
            launched[0].get(JobParameters::DATE).unwrap().to_string(),
            "last-week"
        );
    }

    #[tokio::test]
    async fn recover_swallows_launch_errors() {
        let store = MemoryExecutionStore::new();
        let mut active = history("busy", 0, BatchStatus::Running);
        active.end_time = None;
        store.seed(active).await;

        let (coordinator, job) = coordinator(&store, CoordinatorSettings::default());
        assert!(coordinator.recover_or_run().await.is_none());
        assert!(job.launched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_increment_bumps_run_id() {
        let store = MemoryExecutionStore::new();
        let (coordinator, job) = coordinator(
            &store,
            CoordinatorSettings {
                auto_increment: true,
                ..CoordinatorSettings::default()
            },
        );
        coordinator.run_now().await.unwrap();
        coordinator.run_now().await.unwrap();

        let run_ids: Vec<Option<i64>> = job
            .launched
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.get_long(JobParameters::RUN_ID))
            .collect();
        assert_eq!(run_ids, vec![Some(1), Some(2)]);
    }
}
