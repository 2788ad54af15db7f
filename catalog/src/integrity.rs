//! Governance hash and integrity checks
//!
//! The governance hash fingerprints the governance-relevant slice of the
//! whole catalog (`{id, owner, priorityTier, version}` per record). Body-only
//! edits that leave those fields alone do not move it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::classifier::{ReservedIds, sha256_hex};
use crate::errors::{CatalogError, ItemError, Result};
use crate::record::{GovernanceProjection, InstructionRecord};

/// SHA-256 over the id-sorted canonical projections, one JSON object per line.
pub fn governance_hash<'a, I>(records: I) -> Result<String>
where
    I: IntoIterator<Item = &'a InstructionRecord>,
{
    let mut projections: Vec<GovernanceProjection> =
        records.into_iter().map(InstructionRecord::projection).collect();
    projections.sort();

    let mut hasher = Sha256::new();
    for (i, p) in projections.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\n");
        }
        hasher.update(serde_json::to_vec(p)?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Memoized governance hash keyed by a generation counter.
///
/// Writers bump the generation after publishing a projection-changing index;
/// a reader only stores its result if no bump happened while it computed.
#[derive(Debug, Default)]
pub struct GovernanceHashCache {
    generation: AtomicU64,
    cached: Mutex<Option<(u64, String)>>,
}

impl GovernanceHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(generation, "Governance hash invalidated");
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Return the cached hash, or run `compute` and cache its result.
    ///
    /// `compute` must take its index snapshot after this call reads the
    /// generation, so a concurrent invalidation forces the next reader to
    /// recompute.
    pub fn get_or_compute<F>(&self, compute: F) -> Result<String>
    where
        F: FnOnce() -> Result<String>,
    {
        let generation = self.generation();
        {
            let cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some((g, hash)) = cached.as_ref()
                && *g == generation
            {
                return Ok(hash.clone());
            }
        }

        let hash = compute()?;

        if self.generation() == generation {
            *self.cached.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((generation, hash.clone()));
        }
        Ok(hash)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub checked: usize,
    pub mismatches: Vec<ItemError>,
}

/// Check every `sourceHash` against its body. Findings only; nothing is repaired.
pub fn audit<'a, I>(records: I) -> AuditReport
where
    I: IntoIterator<Item = &'a InstructionRecord>,
{
    let mut checked = 0;
    let mut mismatches = Vec::new();
    for record in records {
        checked += 1;
        let actual = sha256_hex(&record.body);
        if actual != record.source_hash {
            let err = CatalogError::IntegrityMismatch {
                id: record.id.clone(),
                expected: record.source_hash.clone(),
                actual,
            };
            tracing::warn!(id = %record.id, "Source hash mismatch");
            mismatches.push(ItemError::from_error(&record.id, &err));
        }
    }
    AuditReport {
        checked,
        mismatches,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Leakage {
    pub leaked_ids: Vec<String>,
    pub leakage_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `"none"` when no bootstrap id reached the index, `"present"` otherwise
    pub recursion_risk: String,
    pub leakage: Leakage,
    /// Indexed ids with no file on disk
    pub missing: Vec<String>,
    /// Record files on disk that are not indexed
    pub extra: Vec<String>,
    pub hash_mismatches: usize,
    pub count: usize,
    /// `ok`, `drift` (missing/extra/mismatches) or `degraded` (leakage or disk error)
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    /// Compare the index against the on-disk key listing. Infallible: a disk
    /// listing error is reported as `degraded`.
    pub fn build<'a, I>(records: I, disk_keys: Result<Vec<String>>, reserved: &ReservedIds) -> Self
    where
        I: IntoIterator<Item = &'a InstructionRecord>,
    {
        let records: Vec<&InstructionRecord> = records.into_iter().collect();
        let indexed: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

        let leaked_ids: Vec<String> = indexed
            .iter()
            .filter(|id| reserved.is_reserved(id))
            .map(|id| (*id).to_string())
            .collect();
        let leakage_ratio = if indexed.is_empty() {
            0.0
        } else {
            leaked_ids.len() as f64 / indexed.len() as f64
        };

        let hash_mismatches = audit(records.iter().copied()).mismatches.len();

        let (missing, extra, error) = match disk_keys {
            Ok(keys) => {
                let on_disk: BTreeSet<&str> = keys
                    .iter()
                    .map(String::as_str)
                    .filter(|k| !reserved.is_reserved(k))
                    .collect();
                let missing = indexed
                    .difference(&on_disk)
                    .map(|s| (*s).to_string())
                    .collect();
                let extra = on_disk
                    .difference(&indexed)
                    .map(|s| (*s).to_string())
                    .collect();
                (missing, extra, None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Health check could not list record files");
                (Vec::new(), Vec::new(), Some(e.to_string()))
            }
        };

        let status = if error.is_some() || !leaked_ids.is_empty() {
            "degraded"
        } else if !missing.is_empty() || !extra.is_empty() || hash_mismatches > 0 {
            "drift"
        } else {
            "ok"
        };

        Self {
            recursion_risk: if leaked_ids.is_empty() { "none" } else { "present" }.to_string(),
            leakage: Leakage {
                leaked_ids,
                leakage_ratio,
            },
            missing,
            extra,
            hash_mismatches,
            count: indexed.len(),
            status: status.to_string(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::config::GovernanceConfig;
    use crate::record::InstructionEntry;
    use pretty_assertions::assert_eq;

    fn records(ids: &[&str]) -> Vec<InstructionRecord> {
        let c = Classifier::new(&GovernanceConfig::default());
        let now = chrono::Utc::now();
        ids.iter()
            .map(|id| c.normalize(&InstructionEntry::new(*id, format!("body of {id}")), now).unwrap())
            .collect()
    }

    fn reserved() -> ReservedIds {
        ReservedIds::new(&GovernanceConfig::default().reserved_ids)
    }

    #[test]
    fn test_hash_ignores_input_order_and_body() {
        let mut a = records(&["a", "b", "c"]);
        let forward = governance_hash(&a).unwrap();
        a.reverse();
        assert_eq!(governance_hash(&a).unwrap(), forward);

        a[0].body = "rewritten".to_string();
        a[0].source_hash = sha256_hex("rewritten");
        assert_eq!(governance_hash(&a).unwrap(), forward);

        a[0].owner = "someone".to_string();
        assert_ne!(governance_hash(&a).unwrap(), forward);
    }

    #[test]
    fn test_empty_catalog_hash_is_sha_of_nothing() {
        let empty: Vec<InstructionRecord> = Vec::new();
        assert_eq!(governance_hash(&empty).unwrap(), sha256_hex(""));
    }

    #[test]
    fn test_cache_recomputes_after_invalidate() {
        let cache = GovernanceHashCache::new();
        let mut snapshot = records(&["a"]);
        let first = cache.get_or_compute(|| governance_hash(&snapshot)).unwrap();

        snapshot[0].version = "2.0.0".to_string();
        // Stale until invalidated.
        assert_eq!(cache.get_or_compute(|| governance_hash(&snapshot)).unwrap(), first);

        cache.invalidate();
        let second = cache.get_or_compute(|| governance_hash(&snapshot)).unwrap();
        assert_ne!(second, first);
        assert_eq!(second, governance_hash(&snapshot).unwrap());
    }

    #[test]
    fn test_cache_skips_store_when_invalidated_mid_compute() {
        let cache = GovernanceHashCache::new();
        let snapshot = records(&["a"]);
        let _ = cache
            .get_or_compute(|| {
                cache.invalidate();
                governance_hash(&snapshot)
            })
            .unwrap();
        assert!(cache.cached.lock().unwrap().is_none());
    }

    #[test]
    fn test_audit_reports_mismatch_without_repair() {
        let mut rs = records(&["a", "b"]);
        rs[1].body = "tampered".to_string();
        let report = audit(&rs);
        assert_eq!(report.checked, 2);
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].id, "b");
        assert_eq!(report.mismatches[0].code, "INTEGRITY_MISMATCH");
        assert_ne!(rs[1].source_hash, sha256_hex("tampered"));
    }

    #[test]
    fn test_health_ok_and_drift() {
        let rs = records(&["a", "b"]);
        let ok = HealthReport::build(&rs, Ok(vec!["a".into(), "b".into()]), &reserved());
        assert_eq!(ok.status, "ok");
        assert_eq!(ok.recursion_risk, "none");

        let drift = HealthReport::build(&rs, Ok(vec!["a".into(), "z".into()]), &reserved());
        assert_eq!(drift.status, "drift");
        assert_eq!(drift.missing, vec!["b".to_string()]);
        assert_eq!(drift.extra, vec!["z".to_string()]);
    }

    #[test]
    fn test_health_leakage_and_disk_error() {
        let mut rs = records(&["a"]);
        let mut leaked = rs[0].clone();
        leaked.id = "000-bootstrapper".to_string();
        rs.push(leaked);

        let report = HealthReport::build(&rs, Ok(vec!["a".into()]), &reserved());
        assert_eq!(report.recursion_risk, "present");
        assert_eq!(report.leakage.leaked_ids, vec!["000-bootstrapper".to_string()]);
        assert!((report.leakage.leakage_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.status, "degraded");

        let err = CatalogError::io(
            "scan failed",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let degraded = HealthReport::build(&rs[..1], Err(err), &reserved());
        assert_eq!(degraded.status, "degraded");
        assert!(degraded.error.is_some());
    }
}
