use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use harvest_core::CompanyRecord;
use tokio::sync::Mutex;

use crate::StoreError;

/// Company table. All reads and writes of one chunk go through one [`CompanyTx`].
#[async_trait]
pub trait CompanyStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn CompanyTx>, StoreError>;
}

/// Unit of work over the company table. Dropping without `commit` rolls back.
///
/// A failing call must leave the transaction usable for the remaining calls.
#[async_trait]
pub trait CompanyTx: Send {
    async fn find_by_company_name(
        &mut self,
        company: &str,
    ) -> Result<Vec<CompanyRecord>, StoreError>;

    /// Update the row with `record.id`, or insert when the record has no id.
    async fn save(&mut self, record: &CompanyRecord) -> Result<CompanyRecord, StoreError>;

    /// Insert all records; either every one is stored or none is.
    async fn save_all(
        &mut self,
        records: &[CompanyRecord],
    ) -> Result<Vec<CompanyRecord>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct CompanyTable {
    rows: BTreeMap<i64, CompanyRecord>,
    next_id: i64,
}

impl CompanyTable {
    fn upsert(&mut self, record: &CompanyRecord) -> Result<CompanyRecord, StoreError> {
        let now = Utc::now();
        let mut stored = record.clone();
        match record.id {
            Some(id) => {
                let existing = self
                    .rows
                    .get(&id)
                    .ok_or_else(|| StoreError::Access(format!("no company row with id {id}")))?;
                stored.created_at = existing.created_at;
            }
            None => {
                self.next_id += 1;
                stored.id = Some(self.next_id);
                stored.created_at = Some(now);
            }
        }
        stored.updated_at = Some(now);
        if let Some(id) = stored.id {
            self.rows.insert(id, stored.clone());
        }
        Ok(stored)
    }
}

/// In-process store. A transaction works on a snapshot and publishes it on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryCompanyStore {
    table: Arc<Mutex<CompanyTable>>,
}

impl MemoryCompanyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row outside any transaction; returns it with its assigned id.
    pub async fn insert(&self, record: CompanyRecord) -> CompanyRecord {
        let mut table = self.table.lock().await;
        let mut record = record;
        record.id = None;
        match table.upsert(&record) {
            Ok(stored) => stored,
            Err(_) => record,
        }
    }

    pub async fn all(&self) -> Vec<CompanyRecord> {
        self.table.lock().await.rows.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }
}

#[async_trait]
impl CompanyStore for MemoryCompanyStore {
    async fn begin(&self) -> Result<Box<dyn CompanyTx>, StoreError> {
        let snapshot = self.table.lock().await.clone();
        Ok(Box::new(MemoryCompanyTx {
            table: self.table.clone(),
            staged: snapshot,
        }))
    }
}

struct MemoryCompanyTx {
    table: Arc<Mutex<CompanyTable>>,
    staged: CompanyTable,
}

#[async_trait]
impl CompanyTx for MemoryCompanyTx {
    async fn find_by_company_name(
        &mut self,
        company: &str,
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        Ok(self
            .staged
            .rows
            .values()
            .filter(|row| row.company == company)
            .cloned()
            .collect())
    }

    async fn save(&mut self, record: &CompanyRecord) -> Result<CompanyRecord, StoreError> {
        self.staged.upsert(record)
    }

    async fn save_all(
        &mut self,
        records: &[CompanyRecord],
    ) -> Result<Vec<CompanyRecord>, StoreError> {
        let mut attempt = self.staged.clone();
        let stored = records
            .iter()
            .map(|r| attempt.upsert(r))
            .collect::<Result<Vec<_>, _>>()?;
        self.staged = attempt;
        Ok(stored)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryCompanyTx { table, staged } = *self;
        *table.lock().await = staged;
        Ok(())
    }
}
