//! CatalogStore: the in-memory index over the record backend.
//!
//! Reads are served from an immutable `Arc<BTreeMap>` snapshot and never wait
//! on a writer. Mutations take the per-id lock (plus the shared structural
//! lock), persist through the [`RecordStore`], and only then publish a new
//! index. A failed write leaves the index exactly as it was.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{Classifier, NoopResolver, OwnerResolver, OwnershipMap};
use crate::config::CatalogConfig;
use crate::errors::{CatalogError, ItemError, Result};
use crate::integrity::{AuditReport, GovernanceHashCache, HealthReport, audit, governance_hash};
use crate::kv::{FsRecordStore, RecordStore};
use crate::record::{
    GovernanceProjection, InstructionEntry, InstructionRecord, PriorityTier, Requirement, Status,
};
use crate::serializer::MutationSerializer;
use crate::snapshot::{SnapshotInfo, SnapshotWriter};

type Index = Arc<BTreeMap<String, InstructionRecord>>;

/// Default page size for `search` when the caller gives none.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs and outcomes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub priority_tier: Option<String>,
    #[serde(default)]
    pub requirement: Option<String>,
    #[serde(default)]
    pub id_prefix: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Filter with its vocabulary fields parsed.
struct ParsedFilter<'a> {
    category: Option<String>,
    status: Option<Status>,
    owner: Option<&'a str>,
    tier: Option<PriorityTier>,
    requirement: Option<Requirement>,
    id_prefix: Option<&'a str>,
}

impl ListFilter {
    fn parse(&self) -> Result<ParsedFilter<'_>> {
        let mut reasons = Vec::new();
        let status = self.status.as_deref().and_then(|s| {
            Status::parse(s).or_else(|| {
                reasons.push(format!("status '{s}' not one of {}", Status::accepted()));
                None
            })
        });
        let tier = self.priority_tier.as_deref().and_then(|t| {
            PriorityTier::parse(t).or_else(|| {
                reasons.push(format!("priorityTier '{t}' not one of P0|P1|P2|P3|P4"));
                None
            })
        });
        let requirement = self.requirement.as_deref().and_then(|r| {
            Requirement::parse(r).or_else(|| {
                reasons.push(format!(
                    "requirement '{r}' not one of {}",
                    Requirement::accepted()
                ));
                None
            })
        });
        if !reasons.is_empty() {
            return Err(CatalogError::validation("filter", reasons));
        }
        Ok(ParsedFilter {
            category: self.category.as_deref().map(|c| c.trim().to_lowercase()),
            status,
            owner: self.owner.as_deref(),
            tier,
            requirement,
            id_prefix: self.id_prefix.as_deref(),
        })
    }
}

impl ParsedFilter<'_> {
    fn matches(&self, r: &InstructionRecord) -> bool {
        self.category.as_ref().is_none_or(|c| r.categories.contains(c))
            && self.status.is_none_or(|s| r.status == s)
            && self.owner.is_none_or(|o| r.owner == o)
            && self.tier.is_none_or(|t| r.priority_tier == t)
            && self.requirement.is_none_or(|q| r.requirement == q)
            && self.id_prefix.is_none_or(|p| r.id.starts_with(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(InstructionRecord),
    Overwritten(InstructionRecord),
    /// Id already present and overwrite was off; nothing was validated or written
    Skipped { id: String },
}

impl CreateOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Created(r) | Self::Overwritten(r) => &r.id,
            Self::Skipped { id } => id,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Created(r) | Self::Overwritten(r) => Some(&r.version),
            Self::Skipped { .. } => None,
        }
    }

    /// The conflict behind a skip. Reported alongside the outcome, never as
    /// a failure of the call.
    pub fn conflict(&self) -> Option<CatalogError> {
        match self {
            Self::Skipped { id } => Some(CatalogError::Conflict { id: id.clone() }),
            Self::Created(_) | Self::Overwritten(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub id: String,
    pub updated: bool,
    pub version: String,
    /// Empty when the update matched the stored record and nothing was written
    pub changed_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub created: Vec<String>,
    pub overwritten: Vec<String>,
    pub skipped: Vec<String>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroomMode {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroomChange {
    pub id: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroomReport {
    pub dry_run: bool,
    pub examined: usize,
    pub changes: Vec<GroomChange>,
    pub errors: Vec<ItemError>,
    pub governance_hash: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub loaded: usize,
    pub corrupted: Vec<ItemError>,
    pub reserved_skipped: Vec<String>,
    pub owners_resolved: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ExportItems {
    Full(Vec<InstructionRecord>),
    Summary(Vec<GovernanceProjection>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    pub hash: String,
    pub count: usize,
    pub items: ExportItems,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceReport {
    pub governance_hash: String,
    pub count: usize,
    pub items: Vec<GovernanceProjection>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

pub struct CatalogStore {
    cfg: CatalogConfig,
    classifier: Classifier,
    backend: Arc<dyn RecordStore>,
    resolver: Arc<dyn OwnerResolver>,
    index: RwLock<Index>,
    serializer: MutationSerializer,
    hash_cache: GovernanceHashCache,
    snapshots: SnapshotWriter,
}

impl CatalogStore {
    /// Filesystem-backed store for `cfg`; the ownership map is loaded when
    /// configured. Call [`CatalogStore::load`] before serving.
    pub async fn open(cfg: CatalogConfig) -> Result<Self> {
        let backend = FsRecordStore::open(cfg.resolved_instructions_dir()).await?;
        let resolver: Arc<dyn OwnerResolver> = match &cfg.governance.ownership_file {
            Some(path) => Arc::new(OwnershipMap::load(std::path::Path::new(path))?),
            None => Arc::new(NoopResolver),
        };
        Ok(Self::with_backend(cfg, Arc::new(backend), resolver))
    }

    /// Store over an injected backend and owner resolver.
    pub fn with_backend(
        cfg: CatalogConfig,
        backend: Arc<dyn RecordStore>,
        resolver: Arc<dyn OwnerResolver>,
    ) -> Self {
        Self {
            classifier: Classifier::new(&cfg.governance),
            snapshots: SnapshotWriter::new(cfg.resolved_snapshot_dir(), cfg.snapshot_retention),
            cfg,
            backend,
            resolver,
            index: RwLock::new(Arc::new(BTreeMap::new())),
            serializer: MutationSerializer::new(),
            hash_cache: GovernanceHashCache::new(),
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.cfg
    }

    pub fn mutation_enabled(&self) -> bool {
        self.cfg.mutation_enabled
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.cfg.mutation_enabled {
            Ok(())
        } else {
            Err(CatalogError::MutationDisabled)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Current immutable index.
    pub fn index_snapshot(&self) -> Index {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn publish<F>(&self, apply: F)
    where
        F: FnOnce(&mut BTreeMap<String, InstructionRecord>),
    {
        let mut guard = self.index.write().unwrap_or_else(PoisonError::into_inner);
        apply(Arc::make_mut(&mut guard));
    }

    // ── Loading ──────────────────────────────────────────────────────────

    /// Scan the backend and replace the index.
    pub async fn load(&self) -> Result<LoadSummary> {
        let _structural = self.serializer.structural_exclusive().await;
        self.load_locked().await
    }

    /// Reload from disk, discarding the current index.
    pub async fn rescan(&self) -> Result<LoadSummary> {
        tracing::info!("Rescanning instruction catalog");
        self.load().await
    }

    async fn load_locked(&self) -> Result<LoadSummary> {
        let report = self.backend.load_all().await?;
        let now = Self::now();
        let mut summary = LoadSummary {
            corrupted: report.corrupted,
            ..LoadSummary::default()
        };
        let mut map = BTreeMap::new();

        for mut record in report.records {
            if self.classifier.reserved().is_reserved(&record.id) {
                tracing::warn!(id = %record.id, "Ignoring reserved bootstrap id on disk");
                summary.reserved_skipped.push(record.id);
                continue;
            }
            let original = record.clone();
            if self.classifier.enrich(&mut record, self.resolver.as_ref(), now) {
                match self.backend.put(&record).await {
                    Ok(()) => summary.owners_resolved += 1,
                    Err(e) => {
                        tracing::warn!(id = %record.id, error = %e, "Failed to persist resolved owner");
                        record = original;
                    }
                }
            }
            map.insert(record.id.clone(), record);
        }

        summary.loaded = map.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
        self.hash_cache.invalidate();

        tracing::info!(
            loaded = summary.loaded,
            corrupted = summary.corrupted.len(),
            reserved_skipped = summary.reserved_skipped.len(),
            owners_resolved = summary.owners_resolved,
            "Loaded instruction catalog"
        );
        Ok(summary)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Result<InstructionRecord> {
        self.index_snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::not_found(id))
    }

    pub fn len(&self) -> usize {
        self.index_snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index_snapshot().is_empty()
    }

    /// Matching records sorted by id, paged by `offset`/`limit`.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<InstructionRecord>> {
        let parsed = filter.parse()?;
        let index = self.index_snapshot();
        Ok(index
            .values()
            .filter(|r| parsed.matches(r))
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    /// Case-insensitive substring match over id, title, body and categories.
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<InstructionRecord>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(CatalogError::validation(
                "search",
                vec!["query must not be empty".to_string()],
            ));
        }
        let index = self.index_snapshot();
        Ok(index
            .values()
            .filter(|r| {
                r.id.to_lowercase().contains(&needle)
                    || r.title.to_lowercase().contains(&needle)
                    || r.body.to_lowercase().contains(&needle)
                    || r.categories.iter().any(|c| c.contains(&needle))
            })
            .take(limit.unwrap_or(DEFAULT_SEARCH_LIMIT))
            .cloned()
            .collect())
    }

    pub fn categories(&self) -> Vec<CategoryCount> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in self.index_snapshot().values() {
            for c in &record.categories {
                *counts.entry(c.clone()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(name, count)| CategoryCount { name, count })
            .collect()
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Add one instruction. With `overwrite = false` an existing id is
    /// reported as skipped without validating the entry.
    pub async fn create(&self, entry: InstructionEntry, overwrite: bool) -> Result<CreateOutcome> {
        self.ensure_mutable()?;
        let _structural = self.serializer.structural_shared().await;
        let _id_lock = self.serializer.lock_id(&entry.id).await;

        let existing = self.index_snapshot().get(&entry.id).cloned();
        if existing.is_some() && !overwrite {
            tracing::debug!(id = %entry.id, "Skipping existing instruction");
            return Ok(CreateOutcome::Skipped { id: entry.id });
        }

        let now = Self::now();
        let mut record = match &existing {
            Some(prev) => self.classifier.overwrite(prev, &entry, now)?,
            None => self.classifier.normalize(&entry, now)?,
        };
        self.classifier
            .enrich(&mut record, self.resolver.as_ref(), now);

        self.backend.put(&record).await?;

        let projection_changed = existing
            .as_ref()
            .is_none_or(|prev| prev.projection() != record.projection());
        let published = record.clone();
        self.publish(|map| {
            map.insert(published.id.clone(), published);
        });
        if projection_changed {
            self.hash_cache.invalidate();
        }

        tracing::info!(
            id = %record.id,
            version = %record.version,
            tier = %record.priority_tier,
            overwritten = existing.is_some(),
            "Stored instruction"
        );
        Ok(match existing {
            Some(_) => CreateOutcome::Overwritten(record),
            None => CreateOutcome::Created(record),
        })
    }

    /// Merge the supplied fields into an existing instruction.
    pub async fn update(&self, patch: InstructionEntry) -> Result<UpdateOutcome> {
        self.ensure_mutable()?;
        let _structural = self.serializer.structural_shared().await;
        let _id_lock = self.serializer.lock_id(&patch.id).await;

        let existing = self.get(&patch.id)?;
        let now = Self::now();
        let mut merged = self.classifier.merge_update(&existing, &patch, now)?;

        if merged.changed_fields.is_empty() {
            tracing::debug!(id = %patch.id, "Update matched stored record");
            return Ok(UpdateOutcome {
                id: existing.id,
                updated: true,
                version: existing.version,
                changed_fields: Vec::new(),
            });
        }

        if self
            .classifier
            .enrich(&mut merged.record, self.resolver.as_ref(), now)
        {
            merged.changed_fields.push("owner".to_string());
        }

        self.backend.put(&merged.record).await?;

        let projection_changed = existing.projection() != merged.record.projection();
        let record = merged.record;
        let outcome = UpdateOutcome {
            id: record.id.clone(),
            updated: true,
            version: record.version.clone(),
            changed_fields: merged.changed_fields,
        };
        self.publish(|map| {
            map.insert(record.id.clone(), record);
        });
        if projection_changed {
            self.hash_cache.invalidate();
        }

        tracing::info!(
            id = %outcome.id,
            version = %outcome.version,
            fields = ?outcome.changed_fields,
            body_changed = merged.body_changed,
            "Updated instruction"
        );
        Ok(outcome)
    }

    /// Bulk add. A bad entry is reported and the batch continues; only
    /// errors that would fail every remaining entry abort it.
    pub async fn import(&self, entries: Vec<InstructionEntry>, overwrite: bool) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for entry in entries {
            let id = entry.id.clone();
            match self.create(entry, overwrite).await {
                Ok(CreateOutcome::Created(_)) => report.created.push(id),
                Ok(CreateOutcome::Overwritten(_)) => report.overwritten.push(id),
                Ok(CreateOutcome::Skipped { .. }) => report.skipped.push(id),
                Err(e) if !e.category().item_recoverable() => {
                    tracing::warn!(id = %id, error = %e, "Import aborted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(id = %id, error = %e, "Import entry rejected");
                    report.errors.push(ItemError::from_error(id, &e));
                }
            }
        }
        tracing::info!(
            created = report.created.len(),
            overwritten = report.overwritten.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "Imported instructions"
        );
        Ok(report)
    }

    /// Delete instructions; absent ids are errors unless `missing_ok`.
    pub async fn remove(&self, ids: &[String], missing_ok: bool) -> Result<RemoveReport> {
        self.ensure_mutable()?;
        let _structural = self.serializer.structural_shared().await;
        let mut report = RemoveReport::default();

        for id in ids {
            let _id_lock = self.serializer.lock_id(id).await;
            if !self.index_snapshot().contains_key(id) {
                if !missing_ok {
                    report
                        .errors
                        .push(ItemError::from_error(id, &CatalogError::not_found(id)));
                }
                continue;
            }
            match self.backend.delete(id).await {
                Ok(existed) => {
                    if !existed {
                        tracing::warn!(id = %id, "Indexed instruction had no file");
                    }
                    self.publish(|map| {
                        map.remove(id);
                    });
                    self.hash_cache.invalidate();
                    report.removed.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Failed to remove instruction");
                    report.errors.push(ItemError::from_error(id, &e));
                }
            }
        }
        tracing::info!(
            removed = report.removed.len(),
            errors = report.errors.len(),
            "Removed instructions"
        );
        Ok(report)
    }

    /// Whole-catalog maintenance pass. A dry run reports the same changes
    /// without writing.
    pub async fn groom(&self, mode: GroomMode) -> Result<GroomReport> {
        if !mode.dry_run {
            self.ensure_mutable()?;
        }
        let _structural = self.serializer.structural_exclusive().await;

        let index = self.index_snapshot();
        let now = Self::now();
        let mut report = GroomReport {
            dry_run: mode.dry_run,
            examined: index.len(),
            ..GroomReport::default()
        };
        let mut repaired = Vec::new();
        let mut projection_changed = false;

        for record in index.values() {
            let repair = match self.classifier.groom(record, self.resolver.as_ref(), now) {
                Ok(Some(repair)) => repair,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(id = %record.id, error = %e, "Record cannot be groomed");
                    report.errors.push(ItemError::from_error(&record.id, &e));
                    continue;
                }
            };
            if !mode.dry_run {
                if let Err(e) = self.backend.put(&repair.record).await {
                    tracing::warn!(id = %record.id, error = %e, "Failed to persist groom repair");
                    report.errors.push(ItemError::from_error(&record.id, &e));
                    continue;
                }
                projection_changed |= record.projection() != repair.record.projection();
                repaired.push(repair.record);
            }
            report.changes.push(GroomChange {
                id: record.id.clone(),
                fields: repair.fields,
            });
        }

        if !repaired.is_empty() {
            self.publish(|map| {
                for record in repaired {
                    map.insert(record.id.clone(), record);
                }
            });
        }
        if projection_changed {
            self.hash_cache.invalidate();
        }
        report.governance_hash = self.governance_hash()?;

        tracing::info!(
            dry_run = mode.dry_run,
            examined = report.examined,
            changed = report.changes.len(),
            errors = report.errors.len(),
            "Groomed instruction catalog"
        );
        Ok(report)
    }

    // ── Integrity ────────────────────────────────────────────────────────

    pub fn governance_hash(&self) -> Result<String> {
        self.hash_cache
            .get_or_compute(|| governance_hash(self.index_snapshot().values()))
    }

    pub fn governance_report(&self) -> Result<GovernanceReport> {
        let index = self.index_snapshot();
        Ok(GovernanceReport {
            governance_hash: self.governance_hash()?,
            count: index.len(),
            items: index.values().map(InstructionRecord::projection).collect(),
        })
    }

    pub fn audit(&self) -> AuditReport {
        audit(self.index_snapshot().values())
    }

    /// Never fails; backend errors surface as a degraded report.
    pub async fn health(&self) -> HealthReport {
        let index = self.index_snapshot();
        let keys = self.backend.list_keys().await;
        HealthReport::build(index.values(), keys, self.classifier.reserved())
    }

    pub fn export(&self, summary: bool) -> Result<ExportReport> {
        let index = self.index_snapshot();
        let items = if summary {
            ExportItems::Summary(index.values().map(InstructionRecord::projection).collect())
        } else {
            ExportItems::Full(index.values().cloned().collect())
        };
        Ok(ExportReport {
            hash: self.governance_hash()?,
            count: index.len(),
            items,
        })
    }

    /// Write a full dump to the snapshot directory and prune old dumps.
    pub async fn write_snapshot(&self) -> Result<SnapshotInfo> {
        let index = self.index_snapshot();
        let hash = self.governance_hash()?;
        self.snapshots
            .write(index.values().cloned().collect(), hash, Self::now())
            .await
    }
}
