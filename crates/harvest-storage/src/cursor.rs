use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use harvest_core::CrawlCursor;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::StoreError;

/// Durable home of crawl cursors, keyed by job instance.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CrawlCursor>, StoreError>;
    async fn save(&self, key: &str, cursor: &CrawlCursor) -> Result<(), StoreError>;
    async fn clear(&self, key: &str) -> Result<(), StoreError>;
}

/// One JSON file per key, replaced atomically through a temp file + rename.
#[derive(Debug, Clone)]
pub struct FileCursorStore {
    root: PathBuf,
}

impl FileCursorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.cursor.json"))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, key: &str) -> Result<Option<CrawlCursor>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, key: &str, cursor: &CrawlCursor) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(key);
        let bytes = serde_json::to_vec(cursor)?;
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let replaced = replace_via_temp(&temp_path, &path, &bytes).await;
        if replaced.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        replaced.map_err(StoreError::from)
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

async fn replace_via_temp(temp_path: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCursorStore {
    cursors: Arc<Mutex<HashMap<String, CrawlCursor>>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, key: &str) -> Result<Option<CrawlCursor>, StoreError> {
        Ok(self.cursors.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, cursor: &CrawlCursor) -> Result<(), StoreError> {
        self.cursors
            .lock()
            .await
            .insert(key.to_string(), cursor.clone());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.cursors.lock().await.remove(key);
        Ok(())
    }
}
