//! Full-catalog dumps
//!
//! ```text
//! <snapshot_dir>/snapshot-20260301T120000123Z.json   { createdAt, hash, count, items }
//! ```
//!
//! Names sort chronologically, so pruning keeps the lexicographically newest.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CatalogError, Result};
use crate::record::InstructionRecord;

const PREFIX: &str = "snapshot-";
const SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotFile {
    pub created_at: DateTime<Utc>,
    pub hash: String,
    pub count: usize,
    pub items: Vec<InstructionRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub path: String,
    pub hash: String,
    pub count: usize,
    /// File names removed by retention pruning
    pub pruned: Vec<String>,
}

pub struct SnapshotWriter {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(at: DateTime<Utc>) -> String {
        format!("{PREFIX}{}{SUFFIX}", at.format("%Y%m%dT%H%M%S%3fZ"))
    }

    pub async fn write(
        &self,
        items: Vec<InstructionRecord>,
        hash: String,
        now: DateTime<Utc>,
    ) -> Result<SnapshotInfo> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            CatalogError::io(format!("failed to create snapshot dir {}", self.dir.display()), e)
        })?;

        let file = SnapshotFile {
            created_at: now,
            count: items.len(),
            hash,
            items,
        };
        let path = self.dir.join(Self::file_name(now));
        let tmp = self
            .dir
            .join(format!(".{}.tmp-{}", Self::file_name(now), uuid::Uuid::new_v4()));
        let json = serde_json::to_vec_pretty(&file)?;

        if let Err(e) = tokio::fs::write(&tmp, &json).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CatalogError::io(format!("failed to write {}", tmp.display()), e));
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CatalogError::io(
                format!("failed to rename into {}", path.display()),
                e,
            ));
        }

        let pruned = self.prune().await?;
        tracing::info!(
            path = %path.display(),
            count = file.count,
            pruned = pruned.len(),
            "Wrote catalog snapshot"
        );

        Ok(SnapshotInfo {
            path: path.display().to_string(),
            hash: file.hash,
            count: file.count,
            pruned,
        })
    }

    /// Snapshot file names, oldest first.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(CatalogError::io(
                    format!("failed to scan {}", self.dir.display()),
                    e,
                ));
            }
        };
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| CatalogError::io(format!("failed to scan {}", self.dir.display()), e))?
        {
            if let Some(name) = entry.file_name().to_str()
                && name.starts_with(PREFIX)
                && name.ends_with(SUFFIX)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn prune(&self) -> Result<Vec<String>> {
        let names = self.list().await?;
        let excess = names.len().saturating_sub(self.retention);
        let mut pruned = Vec::with_capacity(excess);
        for name in names.into_iter().take(excess) {
            let path = self.dir.join(&name);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => pruned.push(name),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to prune snapshot");
                }
            }
        }
        Ok(pruned)
    }
}
