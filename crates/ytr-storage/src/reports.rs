//! Report directory with atomic, deterministically named artifacts.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use ytr_core::{ReportFileName, ReportStage};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredReport {
    pub name: ReportFileName,
    pub path: PathBuf,
    pub byte_size: u64,
    pub content_hash: String,
}

/// Flat directory holding `raw-*` and `processed-*` report files.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &ReportFileName) -> PathBuf {
        self.root.join(name.file_name())
    }

    fn temp_prefix(name: &ReportFileName) -> String {
        format!(".{}.", name.file_name())
    }

    /// Removes `.part` leftovers of earlier, interrupted writes of `name`.
    pub async fn remove_stale_parts(&self, name: &ReportFileName) -> anyhow::Result<usize> {
        let prefix = Self::temp_prefix(name);
        let mut removed = 0usize;
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(&prefix) && file_name.ends_with(".part") {
                fs::remove_file(entry.path())
                    .await
                    .with_context(|| format!("removing stale part {}", entry.path().display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Opens an exclusive temp file that becomes `name` only on [`PartialReport::commit`].
    pub async fn begin(&self, name: ReportFileName) -> anyhow::Result<PartialReport> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating report directory {}", self.root.display()))?;
        let stale = self.remove_stale_parts(&name).await?;
        if stale > 0 {
            tracing::debug!(report = %name, stale, "removed stale partial report files");
        }

        let temp_path = self
            .root
            .join(format!("{}{}.part", Self::temp_prefix(&name), Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;

        Ok(PartialReport {
            final_path: self.path_for(&name),
            name,
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Writes a whole report atomically, replacing any previous version.
    pub async fn write(&self, name: ReportFileName, bytes: &[u8]) -> anyhow::Result<StoredReport> {
        let mut partial = self.begin(name).await?;
        partial.write_chunk(bytes).await?;
        partial.commit().await
    }

    /// Report files of one stage and family, ascending by coverage date.
    pub async fn list(&self, stage: ReportStage, family: &str) -> anyhow::Result<Vec<ReportFileName>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => {
                return Err(err).with_context(|| format!("listing {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(name) = ReportFileName::parse(&file_name) {
                if name.stage == stage && name.family == family {
                    names.push(name);
                }
            }
        }
        names.sort_by_key(|n| n.coverage_date);
        Ok(names)
    }

    pub async fn read(&self, name: &ReportFileName) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(name);
        fs::read(&path)
            .await
            .with_context(|| format!("reading report {}", path.display()))
    }
}

/// An in-progress report write. Dropping it without committing removes the temp file.
#[derive(Debug)]
pub struct PartialReport {
    name: ReportFileName,
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    hasher: Sha256,
    written: u64,
}

impl PartialReport {
    pub fn name(&self) -> &ReportFileName {
        &self.name
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        let file = self
            .file
            .as_mut()
            .context("report write already finished")?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", self.temp_path.display()))?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub async fn commit(mut self) -> anyhow::Result<StoredReport> {
        let mut file = self
            .file
            .take()
            .context("report write already finished")?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", self.temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp report file {}", self.temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&self.temp_path, &self.final_path).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp report {} -> {}",
                    self.temp_path.display(),
                    self.final_path.display()
                )
            });
        }

        let content_hash = hex::encode(std::mem::take(&mut self.hasher).finalize());
        Ok(StoredReport {
            name: self.name.clone(),
            path: self.final_path.clone(),
            byte_size: self.written,
            content_hash,
        })
    }

    pub async fn abort(mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

impl Drop for PartialReport {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn raw_name(day: u32) -> ReportFileName {
        ReportFileName::new(
            ReportStage::Raw,
            "revenue",
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
        )
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn committed_report_appears_under_final_name_only() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());

        let mut partial = store.begin(raw_name(1)).await.expect("begin");
        partial.write_chunk(b"date,views\n").await.expect("chunk 1");
        assert!(!store.path_for(&raw_name(1)).exists());
        partial.write_chunk(b"20240101,3\n").await.expect("chunk 2");
        let stored = partial.commit().await.expect("commit");

        assert_eq!(stored.byte_size, 22);
        assert_eq!(stored.content_hash, sha256_hex(b"date,views\n20240101,3\n"));
        assert_eq!(
            std::fs::read(&stored.path).unwrap(),
            b"date,views\n20240101,3\n".to_vec()
        );
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn aborted_and_dropped_writes_leave_nothing_behind() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());

        let mut aborted = store.begin(raw_name(2)).await.expect("begin");
        aborted.write_chunk(b"partial").await.expect("chunk");
        aborted.abort().await;

        let mut dropped = store.begin(raw_name(3)).await.expect("begin");
        dropped.write_chunk(b"partial").await.expect("chunk");
        drop(dropped);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn begin_clears_stale_parts_and_rewrite_replaces() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        let stale = dir.path().join(".raw-revenue-20240104.csv.crashed.part");
        std::fs::write(&stale, b"junk").unwrap();

        store.write(raw_name(4), b"old").await.expect("first write");
        assert!(!stale.exists());
        let stored = store.write(raw_name(4), b"new").await.expect("second write");
        assert_eq!(std::fs::read(stored.path).unwrap(), b"new".to_vec());
    }

    #[tokio::test]
    async fn list_filters_by_stage_and_family_in_date_order() {
        let dir = tempdir().expect("tempdir");
        let store = ReportStore::new(dir.path());
        store.write(raw_name(9), b"a").await.unwrap();
        store.write(raw_name(2), b"b").await.unwrap();
        store
            .write(raw_name(5).with_stage(ReportStage::Processed), b"c")
            .await
            .unwrap();
        std::fs::write(dir.path().join("raw-other-20240101.csv"), b"d").unwrap();
        std::fs::write(dir.path().join("README.md"), b"e").unwrap();

        let raws = store.list(ReportStage::Raw, "revenue").await.unwrap();
        assert_eq!(raws, vec![raw_name(2), raw_name(9)]);
        let processed = store.list(ReportStage::Processed, "revenue").await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(store.list(ReportStage::Raw, "missing").await.unwrap().is_empty());
    }
}
