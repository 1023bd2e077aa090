use std::sync::Arc;

use async_trait::async_trait;
use harvest_adapters::ListingSource;
use harvest_core::{BatchError, CrawlCursor};
use harvest_storage::CursorStore;
use tracing::{debug, info};

use crate::pipeline::ItemReader;

/// Streams listing identifiers page by page. The cursor moves in memory on every read and
/// is persisted at checkpoints, so a restart resumes after the last committed chunk.
pub struct CursorReader {
    listing: Arc<dyn ListingSource>,
    cursors: Arc<dyn CursorStore>,
    cursor_key: String,
    max_page: u32,
    cursor: Option<CrawlCursor>,
}

impl CursorReader {
    pub fn new(
        listing: Arc<dyn ListingSource>,
        cursors: Arc<dyn CursorStore>,
        cursor_key: impl Into<String>,
        max_page: u32,
    ) -> Self {
        Self {
            listing,
            cursors,
            cursor_key: cursor_key.into(),
            max_page,
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<&CrawlCursor> {
        self.cursor.as_ref()
    }
}

#[async_trait]
impl ItemReader for CursorReader {
    type Item = String;

    async fn open(&mut self) -> Result<(), BatchError> {
        let cursor = match self.cursors.load(&self.cursor_key).await? {
            Some(saved) => {
                info!(
                    page = saved.current_page,
                    index = saved.next_index,
                    buffered = saved.identifiers.len(),
                    "resuming crawl cursor"
                );
                saved
            }
            None => CrawlCursor::new(self.max_page),
        };
        self.cursor = Some(cursor);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<String>, BatchError> {
        let Some(current) = self.cursor.as_ref() else {
            return Err(BatchError::IllegalArgument(
                "cursor reader used before open".to_string(),
            ));
        };
        // Work on a copy so a failed fetch leaves the live cursor untouched.
        let mut next = current.clone();
        if next.buffer_exhausted() {
            if next.pages_exhausted() {
                debug!(page = next.current_page, "max page reached");
                return Ok(None);
            }
            let identifiers = self.listing.fetch_identifiers(next.current_page).await?;
            if identifiers.is_empty() {
                info!(page = next.current_page, "empty listing page; end of stream");
                return Ok(None);
            }
            next.load_page(identifiers);
        }

        let Some(identifier) = next.pop() else {
            return Ok(None);
        };
        self.cursor = Some(next);
        Ok(Some(identifier))
    }

    async fn checkpoint(&mut self) -> Result<(), BatchError> {
        if let Some(cursor) = &self.cursor {
            self.cursors.save(&self.cursor_key, cursor).await?;
            debug!(
                page = cursor.current_page,
                index = cursor.next_index,
                "crawl cursor saved"
            );
        }
        Ok(())
    }

    async fn close(&mut self, completed: bool) -> Result<(), BatchError> {
        if completed {
            self.cursors.clear(&self.cursor_key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_adapters::AdapterError;
    use harvest_core::ErrorKind;
    use harvest_storage::{FetchError, FileCursorStore, MemoryCursorStore, StoreError};
    use std::sync::Mutex;

    /// `pages[i]` is the listing for page `i + 1`; pages past the end are empty.
    struct PagedListing {
        pages: Vec<Vec<String>>,
        fail_pages: Mutex<Vec<u32>>,
        fetched: Mutex<Vec<u32>>,
    }

    impl PagedListing {
        fn new(sizes: &[usize]) -> Self {
            let pages = sizes
                .iter()
                .enumerate()
                .map(|(p, &n)| (0..n).map(|i| format!("p{}-{i}", p + 1)).collect())
                .collect();
            Self {
                pages,
                fail_pages: Mutex::new(Vec::new()),
                fetched: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ListingSource for PagedListing {
        async fn fetch_identifiers(&self, page: u32) -> Result<Vec<String>, AdapterError> {
            self.fetched.lock().unwrap().push(page);
            let should_fail = {
                let mut fail = self.fail_pages.lock().unwrap();
                match fail.iter().position(|p| *p == page) {
                    Some(pos) => {
                        fail.remove(pos);
                        true
                    }
                    None => false,
                }
            };
            if should_fail {
                return Err(AdapterError::Fetch(FetchError::HttpStatus {
                    status: 503,
                    url: format!("page {page}"),
                }));
            }
            Ok(self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Cursor store whose saves can be made to fail.
    #[derive(Default)]
    struct FlakyCursorStore {
        inner: MemoryCursorStore,
        fail_next_save: Mutex<bool>,
    }

    #[async_trait]
    impl CursorStore for FlakyCursorStore {
        async fn load(&self, key: &str) -> Result<Option<CrawlCursor>, StoreError> {
            self.inner.load(key).await
        }

        async fn save(&self, key: &str, cursor: &CrawlCursor) -> Result<(), StoreError> {
            let fail = std::mem::take(&mut *self.fail_next_save.lock().unwrap());
            if fail {
                return Err(StoreError::Transient("disk full".into()));
            }
            self.inner.save(key, cursor).await
        }

        async fn clear(&self, key: &str) -> Result<(), StoreError> {
            self.inner.clear(key).await
        }
    }

    async fn drain(reader: &mut CursorReader) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(id) = reader.read().await.unwrap() {
            out.push(id);
        }
        out
    }

    #[tokio::test]
    async fn reads_every_page_then_ends_on_empty_page() {
        let listing = Arc::new(PagedListing::new(&[3, 3, 3, 0, 5]));
        let mut reader = CursorReader::new(
            listing.clone(),
            Arc::new(MemoryCursorStore::new()),
            "k",
            10,
        );
        reader.open().await.unwrap();
        let ids = drain(&mut reader).await;

        assert_eq!(ids.len(), 9);
        assert_eq!(ids[0], "p1-0");
        assert_eq!(ids[8], "p3-2");
        assert_eq!(*listing.fetched.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stops_after_max_page() {
        let listing = Arc::new(PagedListing::new(&[2, 2, 2]));
        let mut reader = CursorReader::new(
            listing.clone(),
            Arc::new(MemoryCursorStore::new()),
            "k",
            2,
        );
        reader.open().await.unwrap();
        assert_eq!(drain(&mut reader).await.len(), 4);
        assert_eq!(*listing.fetched.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn interrupted_read_resumes_without_gaps_or_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let listing = Arc::new(PagedListing::new(&[4, 4, 4]));
        let cursors: Arc<dyn CursorStore> = Arc::new(FileCursorStore::new(dir.path()));

        let mut first = CursorReader::new(listing.clone(), cursors.clone(), "run", 10);
        first.open().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(first.read().await.unwrap().unwrap());
        }
        first.checkpoint().await.unwrap();
        // read past the checkpoint, then crash without close
        first.read().await.unwrap();
        first.read().await.unwrap();
        drop(first);

        let mut second = CursorReader::new(listing.clone(), cursors.clone(), "run", 10);
        second.open().await.unwrap();
        seen.extend(drain(&mut second).await);
        second.close(true).await.unwrap();

        let expected: Vec<String> = (1..=3)
            .flat_map(|p| (0..4).map(move |i| format!("p{p}-{i}")))
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(cursors.load("run").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_move_the_cursor() {
        let listing = Arc::new(PagedListing::new(&[2, 2]));
        listing.fail_pages.lock().unwrap().push(2);
        let store = Arc::new(MemoryCursorStore::new());
        let mut reader = CursorReader::new(listing.clone(), store.clone(), "k", 10);
        reader.open().await.unwrap();

        assert_eq!(reader.read().await.unwrap().as_deref(), Some("p1-0"));
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("p1-1"));
        reader.checkpoint().await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        reader.checkpoint().await.unwrap();
        let saved = store.load("k").await.unwrap().unwrap();
        assert_eq!(saved.current_page, 2);
        assert_eq!(saved.next_index, 2);

        assert_eq!(reader.read().await.unwrap().as_deref(), Some("p2-0"));
    }

    #[tokio::test]
    async fn reads_are_not_persisted_until_checkpoint() {
        let listing = Arc::new(PagedListing::new(&[3]));
        let store = Arc::new(MemoryCursorStore::new());
        let mut reader = CursorReader::new(listing, store.clone(), "k", 10);
        reader.open().await.unwrap();
        reader.read().await.unwrap();
        reader.read().await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), None);

        reader.checkpoint().await.unwrap();
        assert_eq!(store.load("k").await.unwrap().unwrap().next_index, 2);
    }

    #[tokio::test]
    async fn failed_checkpoint_can_be_retried() {
        let listing = Arc::new(PagedListing::new(&[3]));
        let store = Arc::new(FlakyCursorStore::default());
        let mut reader = CursorReader::new(listing, store.clone(), "k", 10);
        reader.open().await.unwrap();
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("p1-0"));

        *store.fail_next_save.lock().unwrap() = true;
        let err = reader.checkpoint().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreTransient);
        assert_eq!(store.load("k").await.unwrap(), None);
        assert_eq!(reader.cursor().unwrap().next_index, 1);

        reader.checkpoint().await.unwrap();
        assert_eq!(store.load("k").await.unwrap().unwrap().next_index, 1);
        assert_eq!(reader.read().await.unwrap().as_deref(), Some("p1-1"));
    }

    #[tokio::test]
    async fn stopped_run_keeps_its_cursor() {
        let listing = Arc::new(PagedListing::new(&[3]));
        let store = Arc::new(MemoryCursorStore::new());
        let mut reader = CursorReader::new(listing, store.clone(), "k", 10);
        reader.open().await.unwrap();
        reader.read().await.unwrap();
        reader.checkpoint().await.unwrap();
        reader.close(false).await.unwrap();
        assert!(store.load("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_before_open_is_a_contract_violation() {
        let mut reader = CursorReader::new(
            Arc::new(PagedListing::new(&[1])),
            Arc::new(MemoryCursorStore::new()),
            "k",
            1,
        );
        assert_eq!(
            reader.read().await.unwrap_err().kind(),
            ErrorKind::IllegalArgument
        );
    }
}
