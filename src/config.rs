use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CairnConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub quality: QualityConfig,
    pub retrieval: RetrievalConfig,
    pub conflict: ConflictConfig,
    pub temporal: TemporalConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    /// Maximum number of fragment bodies held in the hot cache.
    pub cache_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QualityConfig {
    /// Soft ceiling for composite scores; leaves room for later correction.
    pub ceiling: f64,
    /// Recency lost per `decay_period_days` since the last validation.
    pub decay_rate: f64,
    pub decay_period_days: u64,
    pub max_update_retries: u32,
    pub default_confidence: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_limit: usize,
    pub candidate_pool: usize,
    pub similarity_threshold: f64,
    pub universal_match_weight: f64,
    pub recency_horizon_days: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConflictConfig {
    pub detection_threshold: f64,
    pub semantic_overlap: f64,
    pub direct_similarity: f64,
    pub temporal_tolerance: f64,
    pub temporal_window_days: i64,
    pub quality_gap: f64,
    pub oracle_timeout_secs: u64,
    pub oracle_url: Option<String>,
    pub max_resolution_rounds: usize,
    pub exclusivity_threshold: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TemporalConfig {
    pub revalidation_interval_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub archive_max_age_days: i64,
    pub archive_min_quality: f64,
    pub archive_max_uses: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            host: "127.0.0.1".into(),
            port: 7412,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_cairn_dir()
            .join("cairn.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            cache_capacity: 1024,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_cairn_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            provider: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            ceiling: 0.95,
            decay_rate: 0.01,
            decay_period_days: 30,
            max_update_retries: 5,
            default_confidence: 0.5,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            candidate_pool: 50,
            similarity_threshold: 0.5,
            universal_match_weight: 0.75,
            recency_horizon_days: 90.0,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.8,
            semantic_overlap: 0.5,
            direct_similarity: 0.95,
            temporal_tolerance: 0.05,
            temporal_window_days: 7,
            quality_gap: 0.15,
            oracle_timeout_secs: 30,
            oracle_url: None,
            max_resolution_rounds: 3,
            exclusivity_threshold: 0.5,
        }
    }
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            revalidation_interval_days: 180,
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            archive_max_age_days: 180,
            archive_min_quality: 0.3,
            archive_max_uses: 3,
        }
    }
}

/// Returns `~/.cairn/`, or `./.cairn/` when no home directory is available.
pub fn default_cairn_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cairn")
}

/// Returns the default config file path: `~/.cairn/config.toml`
pub fn default_config_path() -> PathBuf {
    default_cairn_dir().join("config.toml")
}

impl CairnConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            CairnConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (CAIRN_DB, CAIRN_LOG_LEVEL, CAIRN_ORACLE_URL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CAIRN_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("CAIRN_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("CAIRN_ORACLE_URL") {
            self.conflict.oracle_url = Some(val);
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
