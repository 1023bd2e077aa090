use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::{BatchError, CompanyRecord};
use harvest_storage::{CompanyStore, CompanyTx, StoreError};
use tracing::{debug, error, info, warn};

use crate::pipeline::ItemWriter;
use crate::similarity::address_similarity;

pub const DEFAULT_MERGE_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq)]
enum MergeOutcome {
    Updated { id: i64, score: f64 },
    /// Folded into a record already queued for insert in this chunk.
    Folded { score: f64 },
    Queued,
}

/// Folds extracted records into the company table: same exact name and an address
/// similar enough updates the best matching row, anything else is inserted.
pub struct MergeWriter {
    store: Arc<dyn CompanyStore>,
    threshold: f64,
}

impl MergeWriter {
    pub fn new(store: Arc<dyn CompanyStore>, threshold: f64) -> Self {
        Self { store, threshold }
    }

    async fn merge_one(
        &self,
        tx: &mut dyn CompanyTx,
        fresh: &CompanyRecord,
        pending: &mut Vec<CompanyRecord>,
    ) -> Result<MergeOutcome, StoreError> {
        let existing = tx.find_by_company_name(&fresh.company).await?;

        let best_existing = existing
            .into_iter()
            .map(|row| (address_similarity(&row.address, &fresh.address), row))
            .max_by(|a, b| a.0.total_cmp(&b.0));
        let best_pending = pending
            .iter()
            .enumerate()
            .filter(|(_, queued)| queued.company == fresh.company)
            .map(|(idx, queued)| (address_similarity(&queued.address, &fresh.address), idx))
            .max_by(|a, b| a.0.total_cmp(&b.0));

        let existing_score = best_existing.as_ref().map_or(f64::MIN, |(score, _)| *score);
        let pending_score = best_pending.map_or(f64::MIN, |(score, _)| score);

        if existing_score >= pending_score && existing_score > self.threshold {
            if let Some((score, mut row)) = best_existing {
                row.apply_extraction(fresh);
                let saved = tx.save(&row).await?;
                let id = saved.id.or(row.id).unwrap_or_default();
                return Ok(MergeOutcome::Updated { id, score });
            }
        }
        if let Some((score, idx)) = best_pending.filter(|(score, _)| *score > self.threshold) {
            pending[idx].apply_extraction(fresh);
            return Ok(MergeOutcome::Folded { score });
        }

        let mut insert = fresh.clone();
        insert.id = None;
        pending.push(insert);
        Ok(MergeOutcome::Queued)
    }
}

#[async_trait]
impl ItemWriter for MergeWriter {
    type Item = CompanyRecord;

    async fn write(&self, items: &[CompanyRecord]) -> Result<(), BatchError> {
        let mut tx = self.store.begin().await?;
        let mut pending = Vec::new();
        let mut updated = 0usize;
        let mut failed = 0usize;

        for fresh in items {
            match self.merge_one(tx.as_mut(), fresh, &mut pending).await {
                Ok(MergeOutcome::Updated { id, score }) => {
                    updated += 1;
                    debug!(company = %fresh.company, id, score, "updated existing company");
                }
                Ok(MergeOutcome::Folded { score }) => {
                    debug!(company = %fresh.company, score, "merged into queued insert");
                }
                Ok(MergeOutcome::Queued) => {}
                Err(err) => {
                    failed += 1;
                    warn!(company = %fresh.company, error = %err, "failed to merge company record");
                }
            }
        }

        let mut inserted = 0usize;
        if !pending.is_empty() {
            match tx.save_all(&pending).await {
                Ok(saved) => inserted = saved.len(),
                Err(err) => {
                    error!(count = pending.len(), error = %err, "failed to insert new companies")
                }
            }
        }

        tx.commit().await?;
        info!(
            received = items.len(),
            updated, inserted, failed, "merged chunk into company table"
        );
        Ok(())
    }
}
