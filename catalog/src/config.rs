//! Catalog configuration loading
//!
//! Loads configuration from `~/.config/instrux/catalog.toml` (or `INSTRUX_CONFIG`),
//! then applies `INSTRUX_*` environment overrides.

use crate::errors::{CatalogError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration for the catalog engine
#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    /// Allow add/update/remove/groom/import
    #[serde(default)]
    pub mutation_enabled: bool,

    /// Debug-level tracing
    #[serde(default)]
    pub verbose: bool,

    /// Directory holding one `<id>.json` per instruction
    #[serde(default = "default_instructions_dir")]
    pub instructions_dir: String,

    /// Directory for periodic full dumps; defaults to a `snapshots` sibling
    #[serde(default)]
    pub snapshot_dir: Option<String>,

    /// Number of snapshot files kept after pruning
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention: usize,

    /// Periodic snapshot interval in seconds (0 = disabled)
    #[serde(default)]
    pub snapshot_interval_secs: u64,

    /// Governance derivation settings
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Usage bucket settings
    #[serde(default)]
    pub usage: UsageConfig,
}

fn default_instructions_dir() -> String {
    dirs::data_dir()
        .map(|d| {
            d.join("instrux")
                .join("instructions")
                .to_string_lossy()
                .into_owned()
        })
        .unwrap_or_else(|| "instructions".to_string())
}

fn default_snapshot_retention() -> usize {
    10
}

/// Governance derivation configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GovernanceConfig {
    /// Days between `lastReviewedAt` and `nextReviewDue` when a record has no override
    #[serde(default = "default_review_interval_days")]
    pub review_interval_days: u32,

    /// Maximum characters kept in `semanticSummary`
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Minimum priority for P0, P1, P2, P3 (strictly descending); anything lower is P4
    #[serde(default = "default_tiers")]
    pub tiers: [u8; 4],

    /// Glob patterns for bootstrap ids that must never enter the catalog
    #[serde(default = "default_reserved_ids")]
    pub reserved_ids: Vec<String>,

    /// Optional JSON ownership map used to resolve `unowned` records
    #[serde(default)]
    pub ownership_file: Option<String>,
}

fn default_review_interval_days() -> u32 {
    180
}

fn default_summary_max_chars() -> usize {
    200
}

fn default_tiers() -> [u8; 4] {
    [90, 75, 60, 30]
}

fn default_reserved_ids() -> Vec<String> {
    vec![
        "000-bootstrapper".to_string(),
        "001-lifecycle-bootstrap".to_string(),
    ]
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            review_interval_days: default_review_interval_days(),
            summary_max_chars: default_summary_max_chars(),
            tiers: default_tiers(),
            reserved_ids: default_reserved_ids(),
            ownership_file: None,
        }
    }
}

/// Usage bucket configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UsageConfig {
    /// Width of one usage window in minutes
    #[serde(default = "default_bucket_size_minutes")]
    pub bucket_size_minutes: u32,

    /// Number of past buckets retained in the ring
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
}

fn default_bucket_size_minutes() -> u32 {
    60
}

fn default_bucket_count() -> usize {
    24
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            bucket_size_minutes: default_bucket_size_minutes(),
            bucket_count: default_bucket_count(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            mutation_enabled: false,
            verbose: false,
            instructions_dir: default_instructions_dir(),
            snapshot_dir: None,
            snapshot_retention: default_snapshot_retention(),
            snapshot_interval_secs: 0,
            governance: GovernanceConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

impl CatalogConfig {
    /// Environment variable for config path override
    pub const ENV_CONFIG_PATH: &'static str = "INSTRUX_CONFIG";
    pub const ENV_MUTATION: &'static str = "INSTRUX_MUTATION";
    pub const ENV_INSTRUCTIONS_DIR: &'static str = "INSTRUX_INSTRUCTIONS_DIR";
    pub const ENV_SNAPSHOT_DIR: &'static str = "INSTRUX_SNAPSHOT_DIR";
    pub const ENV_BUCKET_SIZE_MINUTES: &'static str = "INSTRUX_BUCKET_SIZE_MINUTES";
    pub const ENV_BUCKET_COUNT: &'static str = "INSTRUX_BUCKET_COUNT";
    pub const ENV_VERBOSE: &'static str = "INSTRUX_VERBOSE";
    pub const ENV_OWNERSHIP_FILE: &'static str = "INSTRUX_OWNERSHIP_FILE";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "catalog.toml";

    /// Config rooted at `dir`, everything else default (tests, embedding)
    pub fn for_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            instructions_dir: dir.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Load configuration from file, then apply environment overrides
    ///
    /// Resolution order:
    /// 1. `INSTRUX_CONFIG` environment variable
    /// 2. `~/.config/instrux/catalog.toml`
    ///
    /// If the config file doesn't exist, defaults are used.
    pub fn load() -> Result<Self> {
        Self::load_at(&Self::resolve_config_path())
    }

    /// Like [`CatalogConfig::load`] with an explicit file path
    pub fn load_at(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            Self::load_from_path(path)?
        } else {
            tracing::info!(
                path = %path.display(),
                "Catalog config not found, using defaults"
            );
            Self::default()
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CatalogError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: CatalogConfig = toml::from_str(contents)
            .map_err(|e| CatalogError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `INSTRUX_*` overrides from `lookup` (normally `std::env::var`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(Self::ENV_MUTATION) {
            self.mutation_enabled = parse_flag(&v);
        }
        if let Some(v) = lookup(Self::ENV_VERBOSE) {
            self.verbose = parse_flag(&v);
        }
        if let Some(v) = lookup(Self::ENV_INSTRUCTIONS_DIR)
            && !v.trim().is_empty()
        {
            self.instructions_dir = v;
        }
        if let Some(v) = lookup(Self::ENV_SNAPSHOT_DIR)
            && !v.trim().is_empty()
        {
            self.snapshot_dir = Some(v);
        }
        if let Some(v) = lookup(Self::ENV_OWNERSHIP_FILE)
            && !v.trim().is_empty()
        {
            self.governance.ownership_file = Some(v);
        }
        if let Some(v) = lookup(Self::ENV_BUCKET_SIZE_MINUTES) {
            self.usage.bucket_size_minutes = v.trim().parse().map_err(|e| {
                CatalogError::config_with_source(
                    format!("invalid {}: {v}", Self::ENV_BUCKET_SIZE_MINUTES),
                    e,
                )
            })?;
        }
        if let Some(v) = lookup(Self::ENV_BUCKET_COUNT) {
            self.usage.bucket_count = v.trim().parse().map_err(|e| {
                CatalogError::config_with_source(
                    format!("invalid {}: {v}", Self::ENV_BUCKET_COUNT),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Resolve the configuration file path
    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("instrux")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.usage.bucket_size_minutes == 0 {
            return Err(CatalogError::config("usage.bucket_size_minutes must be > 0"));
        }
        if self.usage.bucket_count == 0 {
            return Err(CatalogError::config("usage.bucket_count must be > 0"));
        }
        if self.governance.review_interval_days == 0 {
            return Err(CatalogError::config(
                "governance.review_interval_days must be > 0",
            ));
        }
        let tiers = self.governance.tiers;
        if !tiers.windows(2).all(|w| w[0] > w[1]) || tiers[0] > 100 {
            return Err(CatalogError::config(format!(
                "governance.tiers must be strictly descending within 0..=100, got {tiers:?}"
            )));
        }
        if self.snapshot_retention == 0 {
            tracing::warn!("snapshot_retention = 0; every snapshot will be pruned immediately");
        }
        Ok(())
    }

    /// Instructions directory with `~/` expanded
    pub fn resolved_instructions_dir(&self) -> PathBuf {
        expand_home(&self.instructions_dir)
    }

    /// Snapshot directory: explicit setting, or `snapshots` next to the instructions dir
    pub fn resolved_snapshot_dir(&self) -> PathBuf {
        if let Some(dir) = &self.snapshot_dir {
            return expand_home(dir);
        }
        let instructions = self.resolved_instructions_dir();
        instructions
            .parent()
            .map(|p| p.join("snapshots"))
            .unwrap_or_else(|| PathBuf::from("snapshots"))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(path)
}
