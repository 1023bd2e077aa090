//! Scripted site used by unit tests across the crate.

use std::sync::Mutex;

use async_trait::async_trait;
use harvest_adapters::{AdapterError, DetailSource, ListingSource};
use harvest_core::CompanyRecord;
use harvest_storage::FetchError;

/// Listing page `n` holds `sizes[n - 1]` identifiers; detail pages echo the identifier.
pub struct ScriptedSite {
    pages: Vec<Vec<String>>,
    pub failing_details: Mutex<Vec<String>>,
}

impl ScriptedSite {
    pub fn with_pages(sizes: &[usize]) -> Self {
        let pages = sizes
            .iter()
            .enumerate()
            .map(|(p, &n)| (0..n).map(|i| format!("c{}-{i}", p + 1)).collect())
            .collect();
        Self {
            pages,
            failing_details: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ListingSource for ScriptedSite {
    async fn fetch_identifiers(&self, page: u32) -> Result<Vec<String>, AdapterError> {
        Ok(self
            .pages
            .get((page as usize).saturating_sub(1))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DetailSource for ScriptedSite {
    async fn fetch_company(&self, identifier: &str) -> Result<CompanyRecord, AdapterError> {
        if self
            .failing_details
            .lock()
            .unwrap()
            .iter()
            .any(|id| id == identifier)
        {
            return Err(AdapterError::Fetch(FetchError::HttpStatus {
                status: 404,
                url: identifier.to_string(),
            }));
        }
        Ok(CompanyRecord::named(
            format!("Company {identifier}"),
            format!("{identifier} Main St"),
        ))
    }
}
