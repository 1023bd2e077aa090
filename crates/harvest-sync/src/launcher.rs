use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use harvest_core::{BatchStatus, JobExecutionRecord, JobInstance, JobParameters};
use harvest_storage::{ExecutionStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::pipeline::{StepReport, StopSignal};

pub const ABANDONED_EXIT_MESSAGE: &str = "abandoned";

/// A launchable unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, execution: &JobExecutionRecord, stop: &StopSignal) -> StepReport;
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("job {job_name} already has an active execution")]
    AlreadyRunning { job_name: String },
    #[error("job instance {instance_key} already completed")]
    AlreadyComplete { instance_key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs jobs one at a time and records every execution.
pub struct JobLauncher {
    executions: Arc<dyn ExecutionStore>,
    running: Mutex<()>,
    stale_after: Duration,
    stop: StopSignal,
}

impl JobLauncher {
    pub fn new(executions: Arc<dyn ExecutionStore>, stale_after: Duration) -> Self {
        Self {
            executions,
            running: Mutex::new(()),
            stale_after,
            stop: StopSignal::new(),
        }
    }

    /// Shared by every execution this launcher starts; raising it stops the current run
    /// after its chunk and any later run before its first chunk.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn executions(&self) -> Arc<dyn ExecutionStore> {
        self.executions.clone()
    }

    pub async fn run(
        &self,
        job: &dyn Job,
        parameters: JobParameters,
    ) -> Result<JobExecutionRecord, LaunchError> {
        let job_name = job.name().to_string();
        let _running = self
            .running
            .try_lock()
            .map_err(|_| LaunchError::AlreadyRunning {
                job_name: job_name.clone(),
            })?;

        self.abandon_stale(&job_name).await?;
        if !self.executions.find_active_executions(&job_name).await?.is_empty() {
            return Err(LaunchError::AlreadyRunning { job_name });
        }

        let instance = JobInstance {
            job_name: job_name.clone(),
            instance_key: parameters.instance_key(),
        };
        let history = self.executions.executions_for_instance(&instance).await?;
        if history.iter().any(|e| e.status == BatchStatus::Completed) {
            return Err(LaunchError::AlreadyComplete {
                instance_key: instance.instance_key,
            });
        }

        let mut execution = JobExecutionRecord::starting(&job_name, parameters);
        self.executions.create_execution(&execution).await?;
        execution.status = BatchStatus::Running;
        self.executions.update_execution(&execution).await?;
        info!(
            job = %job_name,
            execution_id = %execution.id,
            parameters = %execution.parameters,
            restart = !history.is_empty(),
            "job launched"
        );

        let span = info_span!("job_run", job = %job_name, execution_id = %execution.id);
        let report = job.execute(&execution, &self.stop).instrument(span).await;

        execution.status = report.status;
        execution.end_time = Some(Utc::now());
        execution.counters = report.counters;
        execution.exit_message = report.failure.map(|err| err.to_string());
        if let Err(err) = self.executions.update_execution(&execution).await {
            error!(execution_id = %execution.id, error = %err, "failed to record job outcome");
            return Err(err.into());
        }
        info!(
            job = %job_name,
            execution_id = %execution.id,
            status = %execution.status,
            written = execution.counters.write_count,
            skipped = execution.counters.skip_count(),
            "job finished"
        );
        Ok(execution)
    }

    /// Mark executions that stayed active past the staleness bound as FAILED.
    async fn abandon_stale(&self, job_name: &str) -> Result<(), StoreError> {
        let cutoff = Utc::now() - self.stale_after;
        for mut execution in self.executions.find_active_executions(job_name).await? {
            if execution.start_time.is_some_and(|started| started < cutoff) {
                warn!(execution_id = %execution.id, started = ?execution.start_time, "abandoning stale execution");
                execution.status = BatchStatus::Failed;
                execution.end_time = Some(Utc::now());
                execution.exit_message = Some(ABANDONED_EXIT_MESSAGE.to_string());
                self.executions.update_execution(&execution).await?;
            }
        }
        Ok(())
    }
}
