//! Persistence of the "processed up to" watermark.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use ytr_core::Watermark;

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// `None` when nothing has been processed yet.
    async fn read(&self) -> anyhow::Result<Option<Watermark>>;

    /// Observers see either the previous or the new value, never a torn write.
    async fn write(&self, watermark: Watermark) -> anyhow::Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    last_processed: Watermark,
}

/// JSON state file replaced through a temp file + rename.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read(&self) -> anyhow::Result<Option<Watermark>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let state: WatermarkFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(state.last_processed))
    }

    async fn write(&self, watermark: Watermark) -> anyhow::Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "watermark.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(&WatermarkFile {
            last_processed: watermark,
        })
        .context("serializing watermark")?;

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        let written = async {
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing {}", temp_path.display()));
        }
        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        tracing::info!(path = %self.path.display(), %watermark, "watermark updated");
        Ok(())
    }
}

/// In-process store, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    current: Option<Watermark>,
    writes: usize,
}

impl MemoryWatermarkStore {
    pub fn new(initial: Option<Watermark>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                current: initial,
                writes: 0,
            }),
        }
    }

    pub fn current(&self) -> Option<Watermark> {
        self.lock().current
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn read(&self) -> anyhow::Result<Option<Watermark>> {
        Ok(self.lock().current)
    }

    async fn write(&self, watermark: Watermark) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.current = Some(watermark);
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_state_file_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = FileWatermarkStore::new(dir.path().join("state").join("watermark.json"));
        assert_eq!(store.read().await.expect("read"), None);
    }

    #[tokio::test]
    async fn file_store_replaces_value_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("watermark.json");
        let store = FileWatermarkStore::new(&path);

        let first: Watermark = "2024-01-01T00:00:00Z".parse().unwrap();
        let second: Watermark = "2024-02-01T06:30:00Z".parse().unwrap();
        store.write(first).await.expect("first write");
        store.write(second).await.expect("second write");

        assert_eq!(store.read().await.expect("read"), Some(second));
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"last_processed\": \"2024-02-01T06:30:00Z\""));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn corrupt_state_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("watermark.json");
        std::fs::write(&path, b"{\"last_processed\": \"yesterday\"}").unwrap();
        assert!(FileWatermarkStore::new(path).read().await.is_err());
    }
}
