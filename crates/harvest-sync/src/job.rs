use std::sync::Arc;

use async_trait::async_trait;
use harvest_adapters::{DetailSource, ListingSource};
use harvest_core::{JobExecutionRecord, HARVEST_JOB_NAME};
use harvest_storage::{CompanyStore, CursorStore};

use crate::launcher::Job;
use crate::pipeline::{ChunkedStep, FaultTolerancePolicy, StepReport, StopSignal};
use crate::processor::CompanyDetailProcessor;
use crate::reader::CursorReader;
use crate::writer::{MergeWriter, DEFAULT_MERGE_THRESHOLD};

pub const HARVEST_STEP_NAME: &str = "companyHarvestStep";

#[derive(Debug, Clone)]
pub struct StepSettings {
    pub chunk_size: usize,
    pub max_page: u32,
    pub fetch_concurrency: usize,
    pub merge_threshold: f64,
    pub policy: FaultTolerancePolicy,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            max_page: 100,
            fetch_concurrency: 1,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
            policy: FaultTolerancePolicy::default(),
        }
    }
}

/// Listing → detail → merge, one chunked step. The crawl cursor is keyed by the job
/// instance so a relaunch with the same identifying parameters resumes it.
pub struct HarvestJob {
    listing: Arc<dyn ListingSource>,
    details: Arc<dyn DetailSource>,
    companies: Arc<dyn CompanyStore>,
    cursors: Arc<dyn CursorStore>,
    settings: StepSettings,
}

impl HarvestJob {
    pub fn new(
        listing: Arc<dyn ListingSource>,
        details: Arc<dyn DetailSource>,
        companies: Arc<dyn CompanyStore>,
        cursors: Arc<dyn CursorStore>,
        settings: StepSettings,
    ) -> Self {
        Self {
            listing,
            details,
            companies,
            cursors,
            settings,
        }
    }
}

#[async_trait]
impl Job for HarvestJob {
    fn name(&self) -> &str {
        HARVEST_JOB_NAME
    }

    async fn execute(&self, execution: &JobExecutionRecord, stop: &StopSignal) -> StepReport {
        let reader = CursorReader::new(
            self.listing.clone(),
            self.cursors.clone(),
            execution.instance_key.clone(),
            self.settings.max_page,
        );
        let processor = CompanyDetailProcessor::new(self.details.clone());
        let writer = MergeWriter::new(self.companies.clone(), self.settings.merge_threshold);

        ChunkedStep::new(
            HARVEST_STEP_NAME,
            reader,
            processor,
            writer,
            self.settings.policy.clone(),
        )
        .with_chunk_size(self.settings.chunk_size)
        .with_concurrency(self.settings.fetch_concurrency)
        .run(stop)
        .await
    }
}
