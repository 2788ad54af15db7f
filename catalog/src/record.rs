//! Instruction record types
//!
//! The on-disk and on-the-wire shape of an instruction, its closed
//! vocabularies, and the raw author input the classifier turns into a
//! governed record.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner sentinel for records whose owner is not yet resolved.
pub const UNOWNED: &str = "unowned";

/// Version assigned to every new record.
pub const INITIAL_VERSION: &str = "1.0.0";

// ─────────────────────────────────────────────────────────────────────────────
// Closed vocabularies
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse band derived from the numeric priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityTier {
    P0,
    P1,
    P2,
    P3,
    P4,
}

impl PriorityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
            Self::P4 => "P4",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" => Some(Self::P0),
            "P1" => Some(Self::P1),
            "P2" => Some(Self::P2),
            "P3" => Some(Self::P3),
            "P4" => Some(Self::P4),
            _ => None,
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generates a closed-vocabulary enum with lowercase wire names and a
/// case-insensitive `parse`.
macro_rules! vocabulary {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &[$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                let lowered = s.trim().to_ascii_lowercase();
                Self::ALL.iter().copied().find(|v| v.as_str() == lowered)
            }

            /// Accepted spellings, for validation messages
            pub fn accepted() -> String {
                Self::ALL
                    .iter()
                    .map($name::as_str)
                    .collect::<Vec<_>>()
                    .join("|")
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

vocabulary!(
    /// Editorial state of an instruction
    Status {
        Draft => "draft",
        Review => "review",
        Approved => "approved",
        Deprecated => "deprecated",
    }
);

vocabulary!(
    /// Disclosure level
    Classification {
        Public => "public",
        Internal => "internal",
        Restricted => "restricted",
    }
);

vocabulary!(
    /// Who the instruction addresses
    Audience {
        Individual => "individual",
        Group => "group",
        All => "all",
    }
);

vocabulary!(
    /// How binding the instruction is
    Requirement {
        Mandatory => "mandatory",
        Critical => "critical",
        Recommended => "recommended",
        Optional => "optional",
        Deprecated => "deprecated",
    }
);

// ─────────────────────────────────────────────────────────────────────────────
// Records
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub version: String,
    pub changed_at: DateTime<Utc>,
    pub summary: String,
}

/// A fully governed instruction. Field order is the canonical on-disk key order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRecord {
    pub id: String,
    pub title: String,
    pub body: String,
    pub priority: u8,
    pub priority_tier: PriorityTier,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    pub owner: String,
    pub version: String,
    pub status: Status,
    pub classification: Classification,
    pub audience: Audience,
    pub requirement: Requirement,
    pub source_hash: String,
    pub semantic_summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_reviewed_at: DateTime<Utc>,
    pub next_review_due: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_interval_days: Option<u32>,
    #[serde(default)]
    pub change_log: Vec<ChangeLogEntry>,
}

impl InstructionRecord {
    pub fn projection(&self) -> GovernanceProjection {
        GovernanceProjection {
            id: self.id.clone(),
            owner: self.owner.clone(),
            priority_tier: self.priority_tier,
            version: self.version.clone(),
        }
    }

    pub fn is_unowned(&self) -> bool {
        self.owner == UNOWNED
    }
}

/// The governance-relevant slice of a record. Field order is the canonical
/// serialization order used for the governance hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceProjection {
    pub id: String,
    pub owner: String,
    pub priority_tier: PriorityTier,
    pub version: String,
}

/// Minimal author input. Every field but `id` and `body` is optional; the
/// classifier fills the rest. Enum fields stay strings here so that unknown
/// spellings become validation reasons rather than parse errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_interval_days: Option<u32>,
    /// Free-text change-log summary for this edit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
}

impl InstructionEntry {
    /// Create a new entry with an id and body
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: Some(body.into()),
            ..Default::default()
        }
    }

    /// Builder: set priority
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Builder: set owner
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Builder: set categories
    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    /// Builder: pin version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// An update entry for `id` that only carries the fields to change
    pub fn patch(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Versions
// ─────────────────────────────────────────────────────────────────────────────

/// `MAJOR.MINOR.PATCH` with numeric components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn bump_patch(self) -> Self {
        Self {
            patch: self.patch + 1,
            ..self
        }
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Patch-bump `version`; unparseable versions restart at the initial version's successor.
pub fn bump_patch(version: &str) -> String {
    SemVer::parse(version)
        .or_else(|| SemVer::parse(INITIAL_VERSION))
        .map(|v| v.bump_patch().to_string())
        .unwrap_or_else(|| INITIAL_VERSION.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_parse_is_case_insensitive() {
        assert_eq!(Status::parse("Approved"), Some(Status::Approved));
        assert_eq!(Status::parse(" draft "), Some(Status::Draft));
        assert_eq!(Status::parse("published"), None);
        assert_eq!(Requirement::parse("MANDATORY"), Some(Requirement::Mandatory));
        assert_eq!(Audience::accepted(), "individual|group|all");
        assert_eq!(PriorityTier::parse("p3"), Some(PriorityTier::P3));
    }

    #[test]
    fn vocabulary_serializes_lowercase() {
        let json = serde_json::to_string(&Classification::Restricted).unwrap();
        assert_eq!(json, "\"restricted\"");
        let tier = serde_json::to_string(&PriorityTier::P2).unwrap();
        assert_eq!(tier, "\"P2\"");
    }

    #[test]
    fn semver_parse_and_bump() {
        assert_eq!(
            SemVer::parse("1.2.3"),
            Some(SemVer {
                major: 1,
                minor: 2,
                patch: 3
            })
        );
        assert_eq!(SemVer::parse("1.2"), None);
        assert_eq!(SemVer::parse("1.2.3.4"), None);
        assert_eq!(SemVer::parse("a.b.c"), None);
        assert_eq!(bump_patch("1.0.9"), "1.0.10");
        assert_eq!(bump_patch("garbage"), "1.0.1");
    }

    #[test]
    fn entry_accepts_camel_case_wire_names() {
        let entry: InstructionEntry = serde_json::from_value(serde_json::json!({
            "id": "x1",
            "body": "hello",
            "priority": 5,
            "reviewIntervalDays": 30,
            "changeSummary": "first cut"
        }))
        .unwrap();
        assert_eq!(entry.priority, Some(5));
        assert_eq!(entry.review_interval_days, Some(30));
        assert_eq!(entry.change_summary.as_deref(), Some("first cut"));
    }
}
