//! Governance classifier
//!
//! Turns minimal author input into a fully governed [`InstructionRecord`].
//! Two phases:
//!
//! 1. [`Classifier::normalize`] is pure: validates the entry and fills every
//!    governance field from the entry, the config and `now`.
//! 2. [`Classifier::enrich`] is effectful: asks the injected [`OwnerResolver`]
//!    for an owner when the record is still `unowned`.
//!
//! Normalizing the same entry twice with the same `now` yields identical
//! records.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use wildmatch::WildMatch;

use crate::config::GovernanceConfig;
use crate::errors::{CatalogError, Result};
use crate::record::{
    Audience, ChangeLogEntry, Classification, INITIAL_VERSION, InstructionEntry,
    InstructionRecord, PriorityTier, Requirement, SemVer, Status, UNOWNED, bump_patch,
};

/// Longest accepted instruction id.
pub const MAX_ID_LEN: usize = 120;

/// Longest accepted category label.
pub const MAX_CATEGORY_LEN: usize = 64;

/// Upper bound for per-record review interval overrides (ten years).
pub const MAX_REVIEW_INTERVAL_DAYS: u32 = 3650;

/// Priority used when the author supplies none.
pub const DEFAULT_PRIORITY: u8 = 50;

/// Lowercase hex SHA-256 of `body`.
pub fn sha256_hex(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ─────────────────────────────────────────────────────────────────────────────
// Owner resolution (delegated capability)
// ─────────────────────────────────────────────────────────────────────────────

/// Best-effort owner lookup for records still marked `unowned`.
pub trait OwnerResolver: Send + Sync {
    fn resolve(&self, id: &str) -> Option<String>;
}

/// Resolver that never knows an owner.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolver;

impl OwnerResolver for NoopResolver {
    fn resolve(&self, _id: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct OwnershipFile {
    #[serde(default)]
    rules: Vec<OwnershipRule>,
}

#[derive(Debug, Deserialize)]
struct OwnershipRule {
    pattern: String,
    owner: String,
}

/// Glob-pattern ownership map; the first matching rule wins.
#[derive(Debug, Default)]
pub struct OwnershipMap {
    rules: Vec<(WildMatch, String)>,
}

impl OwnershipMap {
    pub fn new<I, P, O>(rules: I) -> Self
    where
        I: IntoIterator<Item = (P, O)>,
        P: AsRef<str>,
        O: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(p, o)| (WildMatch::new(p.as_ref()), o.into()))
                .collect(),
        }
    }

    /// Load `{ "rules": [{ "pattern": "...", "owner": "..." }] }`
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::config_with_source(
                format!("failed to read ownership map at {}", path.display()),
                e,
            )
        })?;
        let file: OwnershipFile = serde_json::from_str(&raw).map_err(|e| {
            CatalogError::config_with_source(
                format!("failed to parse ownership map at {}", path.display()),
                e,
            )
        })?;
        tracing::debug!(rules = file.rules.len(), path = %path.display(), "Loaded ownership map");
        Ok(Self::new(file.rules.into_iter().map(|r| (r.pattern, r.owner))))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl OwnerResolver for OwnershipMap {
    fn resolve(&self, id: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.matches(id))
            .map(|(_, owner)| owner.clone())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reserved bootstrap ids
// ─────────────────────────────────────────────────────────────────────────────

/// Bootstrap/governance seed ids that must never surface in the catalog.
#[derive(Debug, Clone)]
pub struct ReservedIds {
    patterns: Vec<String>,
}

impl ReservedIds {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns.to_vec(),
        }
    }

    pub fn is_reserved(&self, id: &str) -> bool {
        self.patterns.iter().any(|p| WildMatch::new(p).matches(id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Classifier
// ─────────────────────────────────────────────────────────────────────────────

/// Result of merging an update into an existing record.
#[derive(Debug, Clone)]
pub struct MergedUpdate {
    pub record: InstructionRecord,
    pub changed_fields: Vec<String>,
    pub body_changed: bool,
}

/// Repairs computed by a groom pass for one record.
#[derive(Debug, Clone)]
pub struct GroomRepair {
    pub record: InstructionRecord,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    tiers: [u8; 4],
    review_interval_days: u32,
    summary_max_chars: usize,
    reserved: ReservedIds,
}

impl Classifier {
    pub fn new(cfg: &GovernanceConfig) -> Self {
        Self {
            tiers: cfg.tiers,
            review_interval_days: cfg.review_interval_days,
            summary_max_chars: cfg.summary_max_chars.max(4),
            reserved: ReservedIds::new(&cfg.reserved_ids),
        }
    }

    pub fn reserved(&self) -> &ReservedIds {
        &self.reserved
    }

    /// Map a 0–100 priority onto its tier.
    pub fn tier_for(&self, priority: u8) -> PriorityTier {
        let [p0, p1, p2, p3] = self.tiers;
        if priority >= p0 {
            PriorityTier::P0
        } else if priority >= p1 {
            PriorityTier::P1
        } else if priority >= p2 {
            PriorityTier::P2
        } else if priority >= p3 {
            PriorityTier::P3
        } else {
            PriorityTier::P4
        }
    }

    /// First non-empty line of `body`, bounded to the configured length.
    pub fn summarize(&self, body: &str, fallback: &str) -> String {
        let line = body
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or(fallback)
            .trim_start_matches('#')
            .trim();
        let line = if line.is_empty() { fallback } else { line };

        if line.chars().count() <= self.summary_max_chars {
            return line.to_string();
        }
        let mut out: String = line.chars().take(self.summary_max_chars - 3).collect();
        out.push_str("...");
        out
    }

    /// `last_reviewed_at` plus the record's interval; fails when the sum
    /// leaves the representable date range.
    pub fn review_due(
        &self,
        id: &str,
        last_reviewed_at: DateTime<Utc>,
        override_days: Option<u32>,
    ) -> Result<DateTime<Utc>> {
        let days = override_days.unwrap_or(self.review_interval_days);
        chrono::TimeDelta::try_days(i64::from(days))
            .and_then(|interval| last_reviewed_at.checked_add_signed(interval))
            .ok_or_else(|| {
                CatalogError::validation(
                    id,
                    vec![format!(
                        "reviewIntervalDays {days} from {last_reviewed_at} overflows the date range"
                    )],
                )
            })
    }

    /// Field-level validation of an entry.
    ///
    /// `require_body` is true for creation; updates may omit the body.
    pub fn validate(&self, entry: &InstructionEntry, require_body: bool) -> Result<()> {
        let mut reasons = Vec::new();
        let id = entry.id.as_str();

        if id.is_empty() {
            reasons.push("id must not be empty".to_string());
        } else {
            if id.len() > MAX_ID_LEN {
                reasons.push(format!("id longer than {MAX_ID_LEN} characters"));
            }
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
            {
                reasons.push("id may only contain [A-Za-z0-9._-]".to_string());
            }
            if id.starts_with('.') || id.starts_with('_') {
                reasons.push("id must not start with '.' or '_'".to_string());
            }
            if self.reserved.is_reserved(id) {
                reasons.push(format!("id '{id}' is a reserved bootstrap id"));
            }
        }

        match &entry.body {
            Some(body) if body.trim().is_empty() => {
                reasons.push("body must not be blank".to_string());
            }
            None if require_body => reasons.push("body is required".to_string()),
            _ => {}
        }

        if let Some(p) = entry.priority
            && !(0..=100).contains(&p)
        {
            reasons.push(format!("priority {p} outside 0..=100"));
        }

        if let Some(v) = &entry.version
            && SemVer::parse(v).is_none()
        {
            reasons.push(format!("version '{v}' is not MAJOR.MINOR.PATCH"));
        }

        if let Some(owner) = &entry.owner
            && owner.trim().is_empty()
        {
            reasons.push("owner must not be blank".to_string());
        }

        if let Some(days) = entry.review_interval_days
            && !(1..=MAX_REVIEW_INTERVAL_DAYS).contains(&days)
        {
            reasons.push(format!(
                "reviewIntervalDays {days} outside 1..={MAX_REVIEW_INTERVAL_DAYS}"
            ));
        }

        if let Some(categories) = &entry.categories {
            for c in categories {
                let c = c.trim();
                if c.is_empty() {
                    reasons.push("categories must not contain blank labels".to_string());
                } else if c.chars().count() > MAX_CATEGORY_LEN {
                    reasons.push(format!("category '{c}' longer than {MAX_CATEGORY_LEN}"));
                }
            }
        }

        check_vocab::<Status>(&entry.status, "status", Status::parse, Status::accepted, &mut reasons);
        check_vocab::<Classification>(
            &entry.classification,
            "classification",
            Classification::parse,
            Classification::accepted,
            &mut reasons,
        );
        check_vocab::<Audience>(&entry.audience, "audience", Audience::parse, Audience::accepted, &mut reasons);
        check_vocab::<Requirement>(
            &entry.requirement,
            "requirement",
            Requirement::parse,
            Requirement::accepted,
            &mut reasons,
        );

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::validation(id, reasons))
        }
    }

    /// Phase one: validate and fill every governance field.
    pub fn normalize(&self, entry: &InstructionEntry, now: DateTime<Utc>) -> Result<InstructionRecord> {
        self.validate(entry, true)?;

        let body = entry.body.clone().unwrap_or_default();
        let title = entry
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&entry.id)
            .to_string();
        let priority = entry.priority.map_or(DEFAULT_PRIORITY, clamp_priority);
        let version = entry
            .version
            .as_deref()
            .and_then(SemVer::parse)
            .map_or_else(|| INITIAL_VERSION.to_string(), |v| v.to_string());

        Ok(InstructionRecord {
            id: entry.id.clone(),
            priority_tier: self.tier_for(priority),
            priority,
            categories: normalize_categories(entry.categories.as_deref().unwrap_or_default()),
            owner: entry
                .owner
                .as_deref()
                .map(str::trim)
                .unwrap_or(UNOWNED)
                .to_string(),
            status: parse_or(&entry.status, Status::parse, Status::Approved),
            classification: parse_or(
                &entry.classification,
                Classification::parse,
                Classification::Internal,
            ),
            audience: parse_or(&entry.audience, Audience::parse, Audience::All),
            requirement: parse_or(&entry.requirement, Requirement::parse, Requirement::Optional),
            source_hash: sha256_hex(&body),
            semantic_summary: self.summarize(&body, &title),
            created_at: now,
            updated_at: now,
            last_reviewed_at: now,
            next_review_due: self.review_due(&entry.id, now, entry.review_interval_days)?,
            review_interval_days: entry.review_interval_days,
            change_log: vec![ChangeLogEntry {
                version: version.clone(),
                changed_at: now,
                summary: entry
                    .change_summary
                    .clone()
                    .unwrap_or_else(|| "initial".to_string()),
            }],
            version,
            title,
            body,
        })
    }

    /// Phase two: resolve the owner of an `unowned` record.
    ///
    /// Returns true when the owner changed, which changes the record's
    /// governance projection.
    pub fn enrich(
        &self,
        record: &mut InstructionRecord,
        resolver: &dyn OwnerResolver,
        now: DateTime<Utc>,
    ) -> bool {
        if !record.is_unowned() {
            return false;
        }
        match resolver.resolve(&record.id) {
            Some(owner) if !owner.trim().is_empty() && owner != UNOWNED => {
                tracing::debug!(id = %record.id, owner = %owner, "Resolved instruction owner");
                record.owner = owner;
                record.updated_at = now;
                true
            }
            _ => false,
        }
    }

    /// Replace `existing` wholesale with `entry` (add/import with overwrite).
    ///
    /// Keeps `createdAt`, the change log and a resolved owner; bumps the patch
    /// version when the body changed and the entry pins no version.
    pub fn overwrite(
        &self,
        existing: &InstructionRecord,
        entry: &InstructionEntry,
        now: DateTime<Utc>,
    ) -> Result<InstructionRecord> {
        let mut record = self.normalize(entry, now)?;
        let body_changed = record.body != existing.body;

        record.version = match entry.version.as_deref().and_then(SemVer::parse) {
            Some(v) => v.to_string(),
            None if body_changed => bump_patch(&existing.version),
            None => existing.version.clone(),
        };
        if entry.owner.is_none() {
            record.owner = existing.owner.clone();
        }
        record.created_at = existing.created_at;
        record.change_log = existing.change_log.clone();
        record.change_log.push(ChangeLogEntry {
            version: record.version.clone(),
            changed_at: now,
            summary: entry
                .change_summary
                .clone()
                .unwrap_or_else(|| "overwritten".to_string()),
        });
        Ok(record)
    }

    /// Merge the fields present in `patch` into `existing`.
    ///
    /// Returns the merged record with the list of changed fields; an empty
    /// list means the update is a no-op and nothing should be persisted.
    pub fn merge_update(
        &self,
        existing: &InstructionRecord,
        patch: &InstructionEntry,
        now: DateTime<Utc>,
    ) -> Result<MergedUpdate> {
        self.validate(patch, false)?;

        let mut next = existing.clone();
        let mut changed = Vec::new();

        if let Some(body) = &patch.body
            && *body != existing.body
        {
            next.body = body.clone();
            next.source_hash = sha256_hex(body);
            changed.push("body".to_string());
        }
        if let Some(title) = patch.title.as_deref().map(str::trim)
            && !title.is_empty()
            && title != existing.title
        {
            next.title = title.to_string();
            changed.push("title".to_string());
        }
        if let Some(p) = patch.priority.map(clamp_priority)
            && p != existing.priority
        {
            next.priority = p;
            changed.push("priority".to_string());
        }
        if let Some(categories) = &patch.categories {
            let normalized = normalize_categories(categories);
            if normalized != existing.categories {
                next.categories = normalized;
                changed.push("categories".to_string());
            }
        }
        if let Some(owner) = patch.owner.as_deref().map(str::trim)
            && owner != existing.owner
        {
            next.owner = owner.to_string();
            changed.push("owner".to_string());
        }
        if let Some(status) = patch.status.as_deref().and_then(Status::parse)
            && status != existing.status
        {
            next.status = status;
            changed.push("status".to_string());
        }
        if let Some(c) = patch.classification.as_deref().and_then(Classification::parse)
            && c != existing.classification
        {
            next.classification = c;
            changed.push("classification".to_string());
        }
        if let Some(a) = patch.audience.as_deref().and_then(Audience::parse)
            && a != existing.audience
        {
            next.audience = a;
            changed.push("audience".to_string());
        }
        if let Some(r) = patch.requirement.as_deref().and_then(Requirement::parse)
            && r != existing.requirement
        {
            next.requirement = r;
            changed.push("requirement".to_string());
        }
        if patch.review_interval_days.is_some()
            && patch.review_interval_days != existing.review_interval_days
        {
            next.review_interval_days = patch.review_interval_days;
            changed.push("reviewIntervalDays".to_string());
        }

        let body_changed = changed.iter().any(|f| f == "body");
        let pinned = patch.version.as_deref().and_then(SemVer::parse);
        match pinned {
            Some(v) if v.to_string() != existing.version => {
                next.version = v.to_string();
                changed.push("version".to_string());
            }
            Some(_) => {}
            None if body_changed => {
                next.version = bump_patch(&existing.version);
                changed.push("version".to_string());
            }
            None => {}
        }

        if changed.is_empty() {
            return Ok(MergedUpdate {
                record: next,
                changed_fields: changed,
                body_changed: false,
            });
        }

        next.priority_tier = self.tier_for(next.priority);
        next.semantic_summary = self.summarize(&next.body, &next.title);
        next.updated_at = now;
        next.last_reviewed_at = now;
        next.next_review_due = self.review_due(&next.id, now, next.review_interval_days)?;
        next.change_log.push(ChangeLogEntry {
            version: next.version.clone(),
            changed_at: now,
            summary: patch
                .change_summary
                .clone()
                .unwrap_or_else(|| format!("updated: {}", changed.join(", "))),
        });

        Ok(MergedUpdate {
            record: next,
            changed_fields: changed,
            body_changed,
        })
    }

    /// Compute maintenance repairs for one record, or `None` when it is clean.
    ///
    /// Fails for a record whose review schedule cannot be computed.
    pub fn groom(
        &self,
        record: &InstructionRecord,
        resolver: &dyn OwnerResolver,
        now: DateTime<Utc>,
    ) -> Result<Option<GroomRepair>> {
        let mut next = record.clone();
        let mut fields = Vec::new();

        let actual = sha256_hex(&record.body);
        if actual != record.source_hash {
            next.source_hash = actual;
            fields.push("sourceHash".to_string());
        }
        let tier = self.tier_for(record.priority);
        if tier != record.priority_tier {
            next.priority_tier = tier;
            fields.push("priorityTier".to_string());
        }
        let due = self.review_due(&record.id, record.last_reviewed_at, record.review_interval_days)?;
        if due != record.next_review_due {
            next.next_review_due = due;
            fields.push("nextReviewDue".to_string());
        }
        let categories = normalize_categories(&record.categories.iter().cloned().collect::<Vec<_>>());
        if categories != record.categories {
            next.categories = categories;
            fields.push("categories".to_string());
        }
        if record.semantic_summary.trim().is_empty() {
            next.semantic_summary = self.summarize(&record.body, &record.title);
            fields.push("semanticSummary".to_string());
        }
        if self.enrich(&mut next, resolver, now) {
            fields.push("owner".to_string());
        }

        if fields.is_empty() {
            return Ok(None);
        }
        next.updated_at = now;
        next.change_log.push(ChangeLogEntry {
            version: next.version.clone(),
            changed_at: now,
            summary: format!("groom: {}", fields.join(", ")),
        });
        Ok(Some(GroomRepair {
            record: next,
            fields,
        }))
    }
}

fn clamp_priority(p: i64) -> u8 {
    u8::try_from(p.clamp(0, 100)).unwrap_or(DEFAULT_PRIORITY)
}

fn normalize_categories(raw: &[String]) -> BTreeSet<String> {
    raw.iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

fn parse_or<T>(raw: &Option<String>, parse: fn(&str) -> Option<T>, default: T) -> T {
    raw.as_deref().and_then(parse).unwrap_or(default)
}

fn check_vocab<T>(
    raw: &Option<String>,
    field: &str,
    parse: fn(&str) -> Option<T>,
    accepted: fn() -> String,
    reasons: &mut Vec<String>,
) {
    if let Some(value) = raw
        && parse(value).is_none()
    {
        reasons.push(format!("{field} '{value}' not one of {}", accepted()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn classifier() -> Classifier {
        Classifier::new(&GovernanceConfig::default())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn test_tier_banding_matches_observed_boundaries() {
        let c = classifier();
        assert_eq!(c.tier_for(100), PriorityTier::P0);
        assert_eq!(c.tier_for(90), PriorityTier::P0);
        assert_eq!(c.tier_for(89), PriorityTier::P1);
        assert_eq!(c.tier_for(75), PriorityTier::P1);
        assert_eq!(c.tier_for(60), PriorityTier::P2);
        assert_eq!(c.tier_for(55), PriorityTier::P3);
        assert_eq!(c.tier_for(30), PriorityTier::P3);
        assert_eq!(c.tier_for(29), PriorityTier::P4);
        assert_eq!(c.tier_for(5), PriorityTier::P4);
        assert_eq!(c.tier_for(0), PriorityTier::P4);
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let c = classifier();
        let now = fixed_now();
        let record = c
            .normalize(&InstructionEntry::new("x1", "hello").with_priority(5), now)
            .unwrap();

        assert_eq!(record.title, "x1");
        assert_eq!(record.owner, UNOWNED);
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.priority_tier, PriorityTier::P4);
        assert_eq!(record.status, Status::Approved);
        assert_eq!(record.classification, Classification::Internal);
        assert_eq!(record.audience, Audience::All);
        assert_eq!(record.requirement, Requirement::Optional);
        assert_eq!(record.source_hash, sha256_hex("hello"));
        assert_eq!(record.semantic_summary, "hello");
        assert_eq!(record.last_reviewed_at, now);
        assert_eq!(record.next_review_due, now + chrono::Duration::days(180));
        assert_eq!(record.change_log.len(), 1);
        assert_eq!(record.change_log[0].summary, "initial");
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let c = classifier();
        let entry = InstructionEntry::new("det", "# Heading\nbody text")
            .with_categories(["Rust", " rust ", "Testing"])
            .with_priority(55);
        let a = c.normalize(&entry, fixed_now()).unwrap();
        let b = c.normalize(&entry, fixed_now()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.priority_tier, PriorityTier::P3);
        assert_eq!(a.semantic_summary, "Heading");
        assert_eq!(
            a.categories.iter().cloned().collect::<Vec<_>>(),
            vec!["rust".to_string(), "testing".to_string()]
        );
    }

    #[test]
    fn test_summary_is_bounded() {
        let mut cfg = GovernanceConfig::default();
        cfg.summary_max_chars = 10;
        let c = Classifier::new(&cfg);
        let summary = c.summarize("\n\n  abcdefghijklmnop  \nsecond", "fallback");
        assert_eq!(summary, "abcdefg...");
        assert_eq!(summary.chars().count(), 10);
    }

    #[test]
    fn test_validate_collects_all_reasons() {
        let c = classifier();
        let mut entry = InstructionEntry::new("../etc", "   ");
        entry.priority = Some(150);
        entry.status = Some("published".to_string());
        entry.version = Some("v1".to_string());

        let err = c.validate(&entry, true).unwrap_err();
        let reasons = err.reasons();
        assert!(reasons.iter().any(|r| r.contains("[A-Za-z0-9._-]")));
        assert!(reasons.iter().any(|r| r.contains("body must not be blank")));
        assert!(reasons.iter().any(|r| r.contains("priority 150")));
        assert!(reasons.iter().any(|r| r.contains("status 'published'")));
        assert!(reasons.iter().any(|r| r.contains("version 'v1'")));
    }

    #[test]
    fn test_validate_rejects_reserved_ids() {
        let c = classifier();
        let err = c
            .validate(&InstructionEntry::new("000-bootstrapper", "seed"), true)
            .unwrap_err();
        assert!(err.to_string().contains("reserved bootstrap id"));
    }

    #[test]
    fn test_enrich_only_touches_unowned() {
        let c = classifier();
        let map = OwnershipMap::new([("security-*", "secops"), ("*", "platform")]);
        let now = fixed_now();

        let mut record = c.normalize(&InstructionEntry::new("security-tls", "pin tls"), now).unwrap();
        let later = now + chrono::Duration::seconds(5);
        assert!(c.enrich(&mut record, &map, later));
        assert_eq!(record.owner, "secops");
        assert_eq!(record.updated_at, later);

        // Already owned: no second resolution.
        assert!(!c.enrich(&mut record, &map, later));

        let mut noop = c.normalize(&InstructionEntry::new("other", "text"), now).unwrap();
        assert!(!c.enrich(&mut noop, &NoopResolver, later));
        assert_eq!(noop.owner, UNOWNED);
    }

    #[test]
    fn test_merge_update_bumps_version_on_body_change() {
        let c = classifier();
        let now = fixed_now();
        let record = c.normalize(&InstructionEntry::new("u1", "v1 body"), now).unwrap();

        let mut patch = InstructionEntry::patch("u1");
        patch.body = Some("v2 body".to_string());
        let merged = c.merge_update(&record, &patch, now).unwrap();

        assert!(merged.body_changed);
        assert_eq!(merged.record.version, "1.0.1");
        assert_eq!(merged.record.source_hash, sha256_hex("v2 body"));
        assert_eq!(merged.record.change_log.len(), 2);
        assert_eq!(merged.changed_fields, vec!["body".to_string(), "version".to_string()]);
    }

    #[test]
    fn test_merge_update_metadata_only_keeps_version() {
        let c = classifier();
        let now = fixed_now();
        let record = c.normalize(&InstructionEntry::new("u2", "body"), now).unwrap();

        let patch = InstructionEntry::patch("u2").with_owner("docs-team");
        let merged = c.merge_update(&record, &patch, now).unwrap();
        assert!(!merged.body_changed);
        assert_eq!(merged.record.version, "1.0.0");
        assert_eq!(merged.record.owner, "docs-team");
    }

    #[test]
    fn test_merge_update_noop_reports_no_changes() {
        let c = classifier();
        let now = fixed_now();
        let record = c.normalize(&InstructionEntry::new("u3", "same"), now).unwrap();
        let mut patch = InstructionEntry::patch("u3");
        patch.body = Some("same".to_string());
        let merged = c.merge_update(&record, &patch, now).unwrap();
        assert!(merged.changed_fields.is_empty());
        assert_eq!(merged.record, record);
    }

    #[test]
    fn test_overwrite_keeps_history_and_owner() {
        let c = classifier();
        let now = fixed_now();
        let mut original = c.normalize(&InstructionEntry::new("o1", "first"), now).unwrap();
        original.owner = "team-a".to_string();

        let later = now + chrono::Duration::hours(1);
        let replaced = c
            .overwrite(&original, &InstructionEntry::new("o1", "second"), later)
            .unwrap();
        assert_eq!(replaced.owner, "team-a");
        assert_eq!(replaced.created_at, now);
        assert_eq!(replaced.version, "1.0.1");
        assert_eq!(replaced.change_log.len(), 2);
        assert_eq!(replaced.change_log[1].summary, "overwritten");
    }

    #[test]
    fn test_groom_repairs_drifted_fields() {
        let c = classifier();
        let now = fixed_now();
        let mut record = c.normalize(&InstructionEntry::new("g1", "body").with_priority(95), now).unwrap();
        record.source_hash = "deadbeef".to_string();
        record.priority_tier = PriorityTier::P4;
        record.next_review_due = now;

        let repair = c.groom(&record, &NoopResolver, now).unwrap().unwrap();
        assert_eq!(
            repair.fields,
            vec![
                "sourceHash".to_string(),
                "priorityTier".to_string(),
                "nextReviewDue".to_string()
            ]
        );
        assert_eq!(repair.record.priority_tier, PriorityTier::P0);
        assert_eq!(repair.record.version, record.version);

        assert!(c.groom(&repair.record, &NoopResolver, now).unwrap().is_none());
    }

    #[test]
    fn test_groom_rejects_review_schedule_past_date_range() {
        let c = classifier();
        let now = fixed_now();
        let mut record = c.normalize(&InstructionEntry::new("far", "body"), now).unwrap();
        record.review_interval_days = Some(u32::MAX);

        let err = c.groom(&record, &NoopResolver, now).unwrap_err();
        assert!(matches!(err, CatalogError::ValidationFailed { ref id, .. } if id == "far"));
        assert!(c.review_due("far", now, Some(u32::MAX)).is_err());
        assert_eq!(
            c.review_due("far", now, Some(30)).unwrap(),
            now + chrono::Duration::days(30)
        );
    }

    #[test]
    fn test_ownership_map_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("owners.json");
        std::fs::write(
            &path,
            r#"{"rules":[{"pattern":"api-*","owner":"api-guild"}]}"#,
        )
        .unwrap();
        let map = OwnershipMap::load(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.resolve("api-versioning").as_deref(), Some("api-guild"));
        assert_eq!(map.resolve("ui-colors"), None);
    }
}
