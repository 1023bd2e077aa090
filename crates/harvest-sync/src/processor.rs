use std::sync::Arc;

use async_trait::async_trait;
use harvest_adapters::DetailSource;
use harvest_core::{BatchError, CompanyRecord};
use tracing::{debug, warn};

use crate::pipeline::ItemProcessor;

/// Identifier → parsed detail record. Fetch and parse failures filter the item out;
/// missing fields, the name included, stay as placeholders.
pub struct CompanyDetailProcessor {
    details: Arc<dyn DetailSource>,
}

impl CompanyDetailProcessor {
    pub fn new(details: Arc<dyn DetailSource>) -> Self {
        Self { details }
    }
}

#[async_trait]
impl ItemProcessor for CompanyDetailProcessor {
    type Input = String;
    type Output = CompanyRecord;

    async fn process(&self, identifier: &String) -> Result<Option<CompanyRecord>, BatchError> {
        match self.details.fetch_company(identifier).await {
            Ok(record) => {
                debug!(%identifier, company = %record.company, "fetched company detail");
                Ok(Some(record))
            }
            Err(err) => {
                warn!(%identifier, error = %err, "detail fetch failed; skipping record");
                Ok(None)
            }
        }
    }
}
