use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use quorum_types::{QuorumError, QuorumResult};

/// Watch paths on this closed set are never accepted, regardless of what
/// the configuration file says.
const DANGEROUS_WATCH_PATHS: &[&str] = &[
    "/", "/etc", "/bin", "/usr", "/var", "/boot", "/sbin", "/lib",
];

const MAX_FILE_SIZE_MB_CEILING: u64 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_true")]
    pub init_schema: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quorum.db"),
            pool_size: default_pool_size(),
            init_schema: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db: DbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default)]
    pub watch_paths: Vec<PathBuf>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
            batch_window_ms: default_batch_window_ms(),
            watch_paths: Vec::new(),
            ignore_patterns: Vec::new(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_allowed_extensions(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default = "default_priority_extensions")]
    pub priority_extensions: Vec<String>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            priority_extensions: default_priority_extensions(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Scoring weights for the reasoning-quality consensus strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRubric {
    #[serde(default = "default_length_weight")]
    pub length_weight: f64,
    #[serde(default = "default_structure_weight")]
    pub structure_weight: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,
    #[serde(default = "default_quality_floor")]
    pub floor: f64,
}

impl Default for QualityRubric {
    fn default() -> Self {
        Self {
            length_weight: default_length_weight(),
            structure_weight: default_structure_weight(),
            confidence_weight: default_confidence_weight(),
            floor: default_quality_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_voting_threshold")]
    pub voting_threshold: f64,
    #[serde(default = "default_wait_for_ms")]
    pub wait_for_ms: u64,
    #[serde(default)]
    pub quality: QualityRubric,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            voting_threshold: default_voting_threshold(),
            wait_for_ms: default_wait_for_ms(),
            quality: QualityRubric::default(),
        }
    }
}

/// Root of the hierarchical configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

impl AppConfig {
    /// Read a JSON config file, falling back to defaults when it is absent.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = match fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime. All problems
    /// are reported at once.
    pub fn validate(&self) -> QuorumResult<()> {
        let mut problems = Vec::new();

        if self.storage.db.pool_size == 0 {
            problems.push("storage.db.pool_size must be at least 1".to_string());
        }

        validate_extensions(
            &self.context.indexing.allowed_extensions,
            "context.indexing.allowed_extensions",
            &mut problems,
        );
        validate_extensions(
            &self.context.bootstrap.priority_extensions,
            "context.bootstrap.priority_extensions",
            &mut problems,
        );

        for (label, value) in [
            (
                "context.indexing.max_file_size_mb",
                self.context.indexing.max_file_size_mb,
            ),
            (
                "context.watcher.max_file_size_mb",
                self.context.watcher.max_file_size_mb,
            ),
        ] {
            if value == 0 {
                problems.push(format!("{label} must be positive"));
            } else if value > MAX_FILE_SIZE_MB_CEILING {
                problems.push(format!(
                    "{label} is {value} MB, above the {MAX_FILE_SIZE_MB_CEILING} MB ceiling"
                ));
            }
        }

        // Watcher and indexer disagreeing about size limits by more than 2x
        // is an ambiguous configuration.
        let watcher_mb = self.context.watcher.max_file_size_mb.max(1);
        let indexing_mb = self.context.indexing.max_file_size_mb.max(1);
        let ratio = watcher_mb.max(indexing_mb) as f64 / watcher_mb.min(indexing_mb) as f64;
        if ratio > 2.0 {
            problems.push(format!(
                "watcher max_file_size_mb ({watcher_mb}) and indexing max_file_size_mb \
                 ({indexing_mb}) differ by more than a factor of two"
            ));
        }

        for path in &self.context.watcher.watch_paths {
            validate_watch_path(path, &mut problems);
        }

        if !(0.0..=1.0).contains(&self.consensus.voting_threshold) {
            problems.push(format!(
                "consensus.voting_threshold {} outside [0, 1]",
                self.consensus.voting_threshold
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(QuorumError::Validation(problems.join("; ")))
        }
    }
}

fn validate_extensions(extensions: &[String], label: &str, problems: &mut Vec<String>) {
    for ext in extensions {
        if ext.trim().is_empty() {
            problems.push(format!("{label} contains a blank extension"));
        } else if !ext.starts_with('.') {
            problems.push(format!(
                "{label} entry {ext:?} must start with a leading dot"
            ));
        }
    }
}

fn validate_watch_path(path: &Path, problems: &mut Vec<String>) {
    let display = path.display();
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        problems.push(format!("watch path {display} escapes via `..` traversal"));
        return;
    }
    if DANGEROUS_WATCH_PATHS
        .iter()
        .any(|dangerous| Path::new(dangerous) == path)
    {
        problems.push(format!("watch path {display} is on the denied system set"));
        return;
    }
    if !path.exists() {
        problems.push(format!("watch path {display} does not exist"));
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_batch_window_ms() -> u64 {
    500
}

fn default_max_file_size_mb() -> u64 {
    10
}

fn default_allowed_extensions() -> Vec<String> {
    [".rs", ".md", ".toml", ".json", ".txt", ".py", ".ts", ".js"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_priority_extensions() -> Vec<String> {
    [".md", ".toml"].iter().map(|s| s.to_string()).collect()
}

fn default_voting_threshold() -> f64 {
    0.75
}

fn default_wait_for_ms() -> u64 {
    0
}

fn default_length_weight() -> f64 {
    0.3
}

fn default_structure_weight() -> f64 {
    0.4
}

fn default_confidence_weight() -> f64 {
    0.3
}

fn default_quality_floor() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn extensions_need_leading_dot() {
        let mut config = AppConfig::default();
        config.context.indexing.allowed_extensions = vec!["rs".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("leading dot"));
    }

    #[test]
    fn blank_extension_rejected() {
        let mut config = AppConfig::default();
        config.context.indexing.allowed_extensions = vec!["  ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_limit_rejected() {
        let mut config = AppConfig::default();
        config.context.indexing.max_file_size_mb = 4096;
        assert!(config.validate().is_err());

        config.context.indexing.max_file_size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn divergent_size_limits_rejected() {
        let mut config = AppConfig::default();
        config.context.watcher.max_file_size_mb = 10;
        config.context.indexing.max_file_size_mb = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("factor of two"));
    }

    #[test]
    fn dangerous_watch_paths_rejected() {
        let mut config = AppConfig::default();
        config.context.watcher.watch_paths = vec![PathBuf::from("/etc")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("denied system set"));
    }

    #[test]
    fn traversal_watch_paths_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.context.watcher.watch_paths = vec![dir.path().join("../sneaky")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("traversal"));
    }

    #[test]
    fn missing_watch_path_rejected() {
        let mut config = AppConfig::default();
        config.context.watcher.watch_paths = vec![PathBuf::from("/definitely/not/here")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn existing_watch_path_accepted() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.context.watcher.watch_paths = vec![dir.path().to_path_buf()];
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn load_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config.consensus.voting_threshold, 0.75);
    }

    #[tokio::test]
    async fn load_merges_partial_file_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"consensus": {"voting_threshold": 0.9}}"#)
            .await
            .unwrap();
        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.consensus.voting_threshold, 0.9);
        assert_eq!(config.storage.db.pool_size, 4);
    }
}
