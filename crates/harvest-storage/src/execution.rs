use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{JobExecutionRecord, JobInstance};
use tokio::sync::Mutex;

use crate::StoreError;

/// Run history written by the launcher and read by the coordinator.
///
/// Listings are newest first by start time.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError>;

    async fn update_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError>;

    async fn find_executions_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobExecutionRecord>, StoreError>;

    /// Instances ordered by their most recent execution.
    async fn find_instances_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobInstance>, StoreError>;

    async fn executions_for_instance(
        &self,
        instance: &JobInstance,
    ) -> Result<Vec<JobExecutionRecord>, StoreError>;

    /// Executions still STARTING or RUNNING.
    async fn find_active_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecutionRecord>, StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryExecutionStore {
    executions: Arc<Mutex<Vec<JobExecutionRecord>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a historical execution as-is (tests seed history with arbitrary start times).
    pub async fn seed(&self, execution: JobExecutionRecord) {
        self.executions.lock().await.push(execution);
    }

    pub async fn all(&self) -> Vec<JobExecutionRecord> {
        let mut all = self.executions.lock().await.clone();
        sort_newest_first(&mut all);
        all
    }
}

fn sort_newest_first(executions: &mut [JobExecutionRecord]) {
    executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.lock().await;
        if executions.iter().any(|e| e.id == execution.id) {
            return Err(StoreError::Access(format!(
                "execution {} already exists",
                execution.id
            )));
        }
        executions.push(execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &JobExecutionRecord) -> Result<(), StoreError> {
        let mut executions = self.executions.lock().await;
        let slot = executions
            .iter_mut()
            .find(|e| e.id == execution.id)
            .ok_or_else(|| StoreError::Access(format!("unknown execution {}", execution.id)))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn find_executions_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        let mut matching: Vec<_> = self
            .executions
            .lock()
            .await
            .iter()
            .filter(|e| e.job_name == job_name)
            .cloned()
            .collect();
        sort_newest_first(&mut matching);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn find_instances_by_job_name(
        &self,
        job_name: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<JobInstance>, StoreError> {
        let newest = self
            .find_executions_by_job_name(job_name, 0, usize::MAX)
            .await?;
        let mut instances: Vec<JobInstance> = Vec::new();
        for execution in newest {
            let instance = execution.instance();
            if !instances.contains(&instance) {
                instances.push(instance);
            }
        }
        Ok(instances.into_iter().skip(offset).take(limit).collect())
    }

    async fn executions_for_instance(
        &self,
        instance: &JobInstance,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        let mut matching: Vec<_> = self
            .executions
            .lock()
            .await
            .iter()
            .filter(|e| e.job_name == instance.job_name && e.instance_key == instance.instance_key)
            .cloned()
            .collect();
        sort_newest_first(&mut matching);
        Ok(matching)
    }

    async fn find_active_executions(
        &self,
        job_name: &str,
    ) -> Result<Vec<JobExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .lock()
            .await
            .iter()
            .filter(|e| e.job_name == job_name && e.status.is_active())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use harvest_core::{BatchStatus, JobParameters};

    fn execution(date: &str, hours_ago: i64, status: BatchStatus) -> JobExecutionRecord {
        let mut e = JobExecutionRecord::starting(
            "job",
            JobParameters::new().with_string(JobParameters::DATE, date),
        );
        e.start_time = Some(Utc::now() - Duration::hours(hours_ago));
        e.status = status;
        e
    }

    #[tokio::test]
    async fn instances_are_ordered_by_latest_execution() {
        let store = MemoryExecutionStore::new();
        store.seed(execution("a", 5, BatchStatus::Failed)).await;
        store.seed(execution("b", 3, BatchStatus::Completed)).await;
        store.seed(execution("a", 1, BatchStatus::Running)).await;

        let instances = store.find_instances_by_job_name("job", 0, 10).await.unwrap();
        assert_eq!(instances.len(), 2);
        let a_key = JobParameters::new()
            .with_string(JobParameters::DATE, "a")
            .instance_key();
        assert_eq!(instances[0].instance_key, a_key);

        let for_a = store.executions_for_instance(&instances[0]).await.unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].status, BatchStatus::Running);

        let active = store.find_active_executions("job").await.unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn executions_page_newest_first() {
        let store = MemoryExecutionStore::new();
        for h in [4, 1, 3, 2] {
            store.seed(execution(&h.to_string(), h, BatchStatus::Completed)).await;
        }
        let page = store.find_executions_by_job_name("job", 1, 2).await.unwrap();
        let dates: Vec<String> = page
            .iter()
            .map(|e| e.parameters.get(JobParameters::DATE).unwrap().to_string())
            .collect();
        assert_eq!(dates, vec!["2", "3"]);
    }
}
