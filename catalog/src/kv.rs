//! Record persistence
//!
//! One JSON file per instruction. The catalog talks to disk only through the
//! [`RecordStore`] trait so tests can inject slow or failing backends.
//!
//! ## Layout
//!
//! ```text
//! <instructions_dir>/
//!   <id>.json                 InstructionRecord (pretty JSON)
//!   <id>.json.tmp-<uuid>      in-flight write, never loaded
//!   _*.json, .*               ignored (scratch, editor files)
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{CatalogError, ItemError, Result};
use crate::record::InstructionRecord;

const RECORD_EXT: &str = ".json";
const TMP_MARKER: &str = ".tmp-";

/// Outcome of a full directory scan.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<InstructionRecord>,
    /// Files that could not be read or parsed; never fatal for the scan
    pub corrupted: Vec<ItemError>,
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordStore Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Key-value persistence for instruction records, keyed by id.
///
/// `put` must be atomic with respect to `load_all`: a concurrent scan sees
/// either the previous record or the new one, never a partial file.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read every record; unreadable entries are reported, not returned
    async fn load_all(&self) -> Result<LoadReport>;

    /// Durably write `record` under `record.id`
    async fn put(&self, record: &InstructionRecord) -> Result<()>;

    /// Delete the record; `Ok(false)` when it was already absent
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Ids currently present on the backend
    async fn list_keys(&self) -> Result<Vec<String>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Filesystem backend
// ─────────────────────────────────────────────────────────────────────────────

pub struct FsRecordStore {
    dir: PathBuf,
}

impl FsRecordStore {
    /// Open (creating if needed) the instructions directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            CatalogError::io(
                format!("failed to create instructions dir {}", dir.display()),
                e,
            )
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{RECORD_EXT}"))
    }

    /// Record id for a directory entry name, or `None` for files the scan skips.
    fn record_id(file_name: &str) -> Option<&str> {
        if file_name.starts_with('.') || file_name.starts_with('_') {
            return None;
        }
        if file_name.contains(TMP_MARKER) {
            return None;
        }
        file_name
            .strip_suffix(RECORD_EXT)
            .filter(|stem| !stem.is_empty())
    }

    async fn read_record(path: &Path, id: &str) -> std::result::Result<InstructionRecord, String> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("read failed: {e}"))?;
        let record: InstructionRecord =
            serde_json::from_str(&raw).map_err(|e| format!("parse failed: {e}"))?;
        if record.id != id {
            return Err(format!(
                "file name says '{id}' but record id is '{}'",
                record.id
            ));
        }
        Ok(record)
    }

    async fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            CatalogError::io(format!("failed to scan {}", self.dir.display()), e)
        })?;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(CatalogError::io(
                        format!("failed to scan {}", self.dir.display()),
                        e,
                    ));
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = Self::record_id(name) {
                out.push((id.to_string(), entry.path()));
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        for (id, path) in self.entries().await? {
            match Self::read_record(&path, &id).await {
                Ok(record) => report.records.push(record),
                Err(reason) => {
                    tracing::warn!(id = %id, path = %path.display(), %reason, "Skipping corrupted record");
                    let err = CatalogError::CorruptedRecord {
                        path: path.display().to_string(),
                        reason,
                    };
                    report.corrupted.push(ItemError::from_error(id, &err));
                }
            }
        }
        Ok(report)
    }

    async fn put(&self, record: &InstructionRecord) -> Result<()> {
        let path = self.path_for(&record.id);
        let tmp = self
            .dir
            .join(format!("{}{RECORD_EXT}{TMP_MARKER}{}", record.id, uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(record)?;

        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CatalogError::io(
                format!("failed to write {}", tmp.display()),
                e,
            ));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CatalogError::io(
                format!("failed to rename into {}", path.display()),
                e,
            ));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CatalogError::io(
                format!("failed to delete {}", path.display()),
                e,
            )),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.entries().await?.into_iter().map(|(id, _)| id).collect())
    }
}
