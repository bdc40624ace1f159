use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ComposeError, Result};
use crate::search::composer::UnqualifiedField;
use crate::search::fields::FieldDefinition;
use crate::search::keys::MAX_JOIN_KEY_LIMIT;
use crate::search::tantivy::Similarity;

/// Engine tunables shared by every core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pending mutations that trigger an automatic commit.
    pub commit_count: u64,
    /// Maximum age of uncommitted mutations, in seconds.
    pub commit_timeout_secs: u64,
    /// Memory budget for each core's index writer.
    pub writer_heap_bytes: usize,
    /// Threads used to search segments in parallel.
    pub search_threads: usize,
    /// LRU bound for filter bitsets, per core.
    pub filter_cache_size: usize,
    /// LRU bound for rank score maps, per core.
    pub score_cache_size: usize,
    /// Largest join key a key set can hold; larger keys never match. At most 2^32.
    pub max_join_key: u64,
    /// Scoring function new cores start with.
    pub similarity: Similarity,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            commit_count: 100_000,
            commit_timeout_secs: 10,
            writer_heap_bytes: 50_000_000,
            search_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            filter_cache_size: 50,
            score_cache_size: 50,
            max_join_key: 1 << 26,
            similarity: Similarity::Bm25,
        }
    }
}

impl Settings {
    /// Load settings from `COREJOIN_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Override these settings with any `COREJOIN_*` environment variables that are set.
    pub fn with_env(self) -> Self {
        let mut cfg = self;

        if let Ok(val) = dotenvy::var("COREJOIN_COMMIT_COUNT")
            && let Ok(n) = val.parse()
        {
            cfg.commit_count = n;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_COMMIT_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.commit_timeout_secs = secs;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_WRITER_HEAP_BYTES")
            && let Ok(bytes) = val.parse()
        {
            cfg.writer_heap_bytes = bytes;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_SEARCH_THREADS")
            && let Ok(n) = val.parse::<usize>()
        {
            cfg.search_threads = n.max(1);
        }

        if let Ok(val) = dotenvy::var("COREJOIN_FILTER_CACHE_SIZE")
            && let Ok(n) = val.parse()
        {
            cfg.filter_cache_size = n;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_SCORE_CACHE_SIZE")
            && let Ok(n) = val.parse()
        {
            cfg.score_cache_size = n;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_MAX_JOIN_KEY")
            && let Ok(n) = val.parse()
        {
            cfg.max_join_key = n;
        }

        if let Ok(val) = dotenvy::var("COREJOIN_SIMILARITY")
            && let Ok(similarity) = val.parse()
        {
            cfg.similarity = similarity;
        }

        cfg
    }

    /// Reject settings no engine should run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_join_key > MAX_JOIN_KEY_LIMIT {
            return Err(ComposeError::InvalidConfig(format!(
                "max_join_key {} exceeds the limit of {MAX_JOIN_KEY_LIMIT}",
                self.max_join_key
            )));
        }
        Ok(())
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_secs(self.commit_timeout_secs)
    }
}

/// One core as declared in the engine config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub name: String,
    /// Index directory; the core lives in RAM when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Fields searched by terms without a field qualifier.
    #[serde(default)]
    pub unqualified_fields: Vec<UnqualifiedField>,
    /// Words searched as written on stemmed fields.
    #[serde(default)]
    pub ignore_stemming_for_words: Vec<String>,
    pub fields: Vec<FieldDefinition>,
}

/// Engine config file: settings plus the cores to open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "core")]
    pub cores: Vec<CoreConfig>,
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ComposeError::InvalidConfig(e.to_string()))?;
        config.settings.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }
}

/// Get the default engine config path
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("com", "corejoin", "corejoin").map_or_else(
        || PathBuf::from("corejoin.toml"),
        |dirs| dirs.config_dir().join("corejoin.toml"),
    )
}
