use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{LakeError, LakeResult};

/// Catalog backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Backend URI: `memory:`, `file:<path>` or a plain path to a JSON catalog
    pub uri: String,
    /// Publish attempts before a commit gives up on snapshot-order races
    pub commit_retries: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            uri: "memory:".to_string(),
            commit_retries: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Directory for data files (None = in-memory file store)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Small-write inlining thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InliningConfig {
    /// Rows kept as catalog metadata before a file is written (default: 500)
    pub row_limit: usize,
    /// Bytes kept inline before a file is written (default: 256KB)
    pub byte_limit: usize,
}

impl Default for InliningConfig {
    fn default() -> Self {
        Self {
            row_limit: 500,
            byte_limit: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Entries with fewer rows than this count as small
    pub small_entry_rows: u64,
    /// Compaction triggers once a table has more small entries than this
    pub min_small_entries: usize,
    /// Upper bound on entries merged into one file
    pub max_entries_per_merge: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            small_entry_rows: 10_000,
            min_small_entries: 8,
            max_entries_per_merge: 64,
        }
    }
}

/// Snapshot retention window. A snapshot is kept if either bound keeps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub keep_snapshots: usize,
    pub keep_for_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_snapshots: 10,
            keep_for_secs: 7 * 24 * 60 * 60, // 7 days
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LakeConfig {
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub inlining: InliningConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl LakeConfig {
    /// Load config from a TOML file, with environment variable overrides.
    /// Falls back to defaults if the file is not found.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut cfg = match fs::read_to_string(path.as_ref()) {
            Ok(s) => toml::from_str::<LakeConfig>(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LakeConfig::default(),
            Err(e) => return Err(e.into()),
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply LAKE_* environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("LAKE_CATALOG") {
            self.catalog.uri = v;
        }

        if let Ok(v) = env::var("LAKE_DATA_DIR") {
            self.storage.data_dir = Some(PathBuf::from(v));
        }

        if let Ok(v) = env::var("LAKE_INLINE_ROW_LIMIT")
            && let Ok(n) = v.parse::<usize>()
        {
            self.inlining.row_limit = n;
        }
    }

    pub fn validate(&self) -> LakeResult<()> {
        if self.catalog.commit_retries == 0 {
            return Err(LakeError::Config("catalog.commit_retries must be > 0".into()));
        }
        if self.inlining.row_limit == 0 || self.inlining.byte_limit == 0 {
            return Err(LakeError::Config("inlining limits must be > 0".into()));
        }
        if self.compaction.max_entries_per_merge < 2 {
            return Err(LakeError::Config(
                "compaction.max_entries_per_merge must be at least 2".into(),
            ));
        }
        if self.retention.keep_snapshots == 0 {
            return Err(LakeError::Config(
                "retention.keep_snapshots must be > 0".into(),
            ));
        }
        if self.maintenance.interval_secs == 0 {
            return Err(LakeError::Config("maintenance.interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lake.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[inlining]\nrow_limit = 50\nbyte_limit = 4096").unwrap();

        let cfg: LakeConfig = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(cfg.inlining.row_limit, 50);
        assert_eq!(cfg.catalog.commit_retries, 16);
        assert_eq!(cfg.retention.keep_snapshots, 10);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LakeConfig::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.compaction.max_entries_per_merge, 64);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut cfg = LakeConfig::default();
        cfg.inlining.row_limit = 0;
        assert!(matches!(cfg.validate(), Err(LakeError::Config(_))));
    }
}
