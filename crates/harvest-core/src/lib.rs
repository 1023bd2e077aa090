//! Core domain model for the company harvester: extracted records, the resumable crawl
//! cursor, job parameters and execution history, and the batch error taxonomy.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Value stored for any field the detail page did not provide.
pub const PLACEHOLDER: &str = "-";

/// Job name under which every harvest run is recorded.
pub const HARVEST_JOB_NAME: &str = "companyHarvestJob";

/// Extracted (or persisted) company row.
///
/// Every text field is total: a missing value is [`PLACEHOLDER`], never empty-by-absence,
/// so merge comparisons never have to special-case nulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: Option<i64>,
    pub company: String,
    pub key_executive: String,
    pub industry: String,
    pub address: String,
    pub homepage: String,
    pub email: String,
    pub phone_number: String,
    pub sales: String,
    pub total_funding: String,
    pub logo_url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for CompanyRecord {
    fn default() -> Self {
        Self::placeholder()
    }
}

impl CompanyRecord {
    /// A record with every field set to the placeholder and no identity.
    pub fn placeholder() -> Self {
        Self {
            id: None,
            company: PLACEHOLDER.to_string(),
            key_executive: PLACEHOLDER.to_string(),
            industry: PLACEHOLDER.to_string(),
            address: PLACEHOLDER.to_string(),
            homepage: PLACEHOLDER.to_string(),
            email: PLACEHOLDER.to_string(),
            phone_number: PLACEHOLDER.to_string(),
            sales: PLACEHOLDER.to_string(),
            total_funding: PLACEHOLDER.to_string(),
            logo_url: PLACEHOLDER.to_string(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Shorthand used by tests and fixtures: name + address, everything else placeholder.
    pub fn named(company: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            address: address.into(),
            ..Self::placeholder()
        }
    }

    /// Copy the fields the harvester owns from a fresh extraction.
    ///
    /// Contact fields (email, phone number, total funding) and identity are left alone.
    pub fn apply_extraction(&mut self, fresh: &CompanyRecord) {
        self.company = fresh.company.clone();
        self.key_executive = fresh.key_executive.clone();
        self.industry = fresh.industry.clone();
        self.address = fresh.address.clone();
        self.homepage = fresh.homepage.clone();
        self.sales = fresh.sales.clone();
        self.logo_url = fresh.logo_url.clone();
    }
}

/// Resumable pagination state of the listing crawl.
///
/// `current_page` is the next page to fetch (1-based). `next_index` points into
/// `identifiers`, the buffered ids of the last fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCursor {
    pub current_page: u32,
    pub max_page: u32,
    pub next_index: usize,
    #[serde(default)]
    pub identifiers: Vec<String>,
}

impl CrawlCursor {
    pub fn new(max_page: u32) -> Self {
        Self {
            current_page: 1,
            max_page,
            next_index: 0,
            identifiers: Vec::new(),
        }
    }

    pub fn buffer_exhausted(&self) -> bool {
        self.next_index >= self.identifiers.len()
    }

    pub fn pages_exhausted(&self) -> bool {
        self.current_page > self.max_page
    }

    /// Replace the buffer with a freshly fetched page and move to the following page.
    pub fn load_page(&mut self, identifiers: Vec<String>) {
        self.identifiers = identifiers;
        self.next_index = 0;
        self.current_page = self.current_page.saturating_add(1);
    }

    pub fn pop(&mut self) -> Option<String> {
        let id = self.identifiers.get(self.next_index)?.clone();
        self.next_index += 1;
        Some(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Running)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTING" => Some(BatchStatus::Starting),
            "RUNNING" => Some(BatchStatus::Running),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            "STOPPED" => Some(BatchStatus::Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobParameter {
    Long(i64),
    Text(String),
}

impl fmt::Display for JobParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobParameter::Long(v) => write!(f, "{v}"),
            JobParameter::Text(v) => f.write_str(v),
        }
    }
}

/// Named parameters of one launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, JobParameter>);

impl JobParameters {
    /// Uniqueness value; never part of the instance key.
    pub const TIME: &'static str = "time";
    pub const DATE: &'static str = "date";
    pub const RUN_ID: &'static str = "run.id";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0
            .insert(key.to_string(), JobParameter::Text(value.into()));
        self
    }

    pub fn with_long(mut self, key: &str, value: i64) -> Self {
        self.0.insert(key.to_string(), JobParameter::Long(value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&JobParameter> {
        self.0.get(key)
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            JobParameter::Long(v) => Some(*v),
            JobParameter::Text(v) => v.parse().ok(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.0.iter()
    }

    /// Hex SHA-256 over the identifying parameters (everything but `time`).
    pub fn instance_key(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.0.iter().filter(|(k, _)| k.as_str() != Self::TIME) {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.to_string().as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for JobParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobInstance {
    pub job_name: String,
    pub instance_key: String,
}

/// Per-run step counters, stored with the execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounters {
    pub read_count: u64,
    pub filter_count: u64,
    pub write_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
}

impl StepCounters {
    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

/// One historical run of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub id: Uuid,
    pub job_name: String,
    pub instance_key: String,
    pub status: BatchStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub parameters: JobParameters,
    pub exit_message: Option<String>,
    pub counters: StepCounters,
}

impl JobExecutionRecord {
    pub fn starting(job_name: &str, parameters: JobParameters) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            instance_key: parameters.instance_key(),
            status: BatchStatus::Starting,
            start_time: Some(Utc::now()),
            end_time: None,
            parameters,
            exit_message: None,
            counters: StepCounters::default(),
        }
    }

    pub fn instance(&self) -> JobInstance {
        JobInstance {
            job_name: self.job_name.clone(),
            instance_key: self.instance_key.clone(),
        }
    }
}

/// Error classes the pipeline's fault-tolerance policy is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Io,
    StoreTransient,
    StoreAccess,
    IllegalArgument,
    MissingReference,
    Other,
}

#[derive(Debug, Clone, Error)]
pub enum BatchError {
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("transient store failure: {0}")]
    StoreTransient(String),
    #[error("store access failure: {0}")]
    StoreAccess(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("missing reference: {0}")]
    MissingReference(String),
    #[error("{0}")]
    Other(String),
}

impl BatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BatchError::Io(_) => ErrorKind::Io,
            BatchError::StoreTransient(_) => ErrorKind::StoreTransient,
            BatchError::StoreAccess(_) => ErrorKind::StoreAccess,
            BatchError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            BatchError::MissingReference(_) => ErrorKind::MissingReference,
            BatchError::Other(_) => ErrorKind::Other,
        }
    }
}
