//! Configuration for the harvest orchestrator.
//!
//! Settings are read from `.harvest/harvest.toml` and layered as
//! file → environment → CLI. Every field has a default, so an empty or
//! missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 5001
//! db_path = ".harvest/harvest.db"
//!
//! [search]
//! agent_url = "http://127.0.0.1:7400/search"
//! pull_agents = false
//! poll_attempts = 30
//! poll_interval_ms = 1000
//! request_timeout_secs = 120
//! retention_secs = 3600
//! max_retained = 1000
//!
//! [watch]
//! poll_interval_secs = 3
//! max_attempts = 60
//! ceiling_secs = 300
//!
//! [selection]
//! scorer_url = "http://127.0.0.1:7401/score"
//!
//! [extraction]
//! worker_url = "http://127.0.0.1:7402/extract"
//!
//! [harvest]
//! worker_url = "http://127.0.0.1:7403/harvest"
//!
//! [modes]
//! auto_advance = false
//! auto_select = false
//! ```
//!
//! The polling constants are empirical defaults, not invariants.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory for config and database files.
pub const HARVEST_DIR: &str = ".harvest";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_db_path() -> PathBuf {
    PathBuf::from(HARVEST_DIR).join("harvest.db")
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

/// Search broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
    /// Endpoint of the external search agent. Without it, searches fail with
    /// `AgentUnavailable` and the operator enters addresses by hand.
    #[serde(default)]
    pub agent_url: Option<String>,
    /// Accept searches without a push endpoint; agents pull pending work
    /// from `/api/search/pending` instead.
    #[serde(default)]
    pub pull_agents: bool,
    /// Poll attempts the loop makes before giving up on a search.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// A pending request older than this is marked expired.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Resolved requests are purged after this long.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Upper bound on retained requests; the oldest are purged first.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

fn default_poll_attempts() -> u32 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_retained() -> usize {
    1000
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            agent_url: None,
            pull_agents: false,
            poll_attempts: default_poll_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            retention_secs: default_retention_secs(),
            max_retained: default_max_retained(),
        }
    }
}

impl SearchSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Completion watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_watch_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_watch_attempts")]
    pub max_attempts: u32,
    /// Soft ceiling on the whole watch, whichever of this and
    /// `max_attempts` runs out first.
    #[serde(default = "default_watch_ceiling_secs")]
    pub ceiling_secs: u64,
}

fn default_watch_interval_secs() -> u64 {
    3
}

fn default_watch_attempts() -> u32 {
    60
}

fn default_watch_ceiling_secs() -> u64 {
    300
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_watch_interval_secs(),
            max_attempts: default_watch_attempts(),
            ceiling_secs: default_watch_ceiling_secs(),
        }
    }
}

/// Candidate scoring settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionSection {
    #[serde(default)]
    pub scorer_url: Option<String>,
}

/// Extraction collaborator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionSection {
    #[serde(default)]
    pub worker_url: Option<String>,
}

/// Harvesting collaborator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestSection {
    #[serde(default)]
    pub worker_url: Option<String>,
}

/// Initial mode toggles, used only until the operator persists a choice.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModesSection {
    #[serde(default)]
    pub auto_advance: bool,
    #[serde(default)]
    pub auto_select: bool,
}

/// The complete harvest.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub selection: SelectionSection,
    #[serde(default)]
    pub extraction: ExtractionSection,
    #[serde(default)]
    pub harvest: HarvestSection,
    #[serde(default)]
    pub modes: ModesSection,
}

impl HarvestToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse harvest.toml")
    }

    /// Load `harvest.toml` from `dir`, or defaults if it does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join("harvest.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize harvest.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `HARVEST_*` environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides using `lookup` as the variable source.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = non_empty("HARVEST_SEARCH_AGENT_URL") {
            self.search.agent_url = Some(url);
        }
        if let Some(url) = non_empty("HARVEST_SCORER_URL") {
            self.selection.scorer_url = Some(url);
        }
        if let Some(url) = non_empty("HARVEST_EXTRACTION_URL") {
            self.extraction.worker_url = Some(url);
        }
        if let Some(url) = non_empty("HARVEST_HARVEST_URL") {
            self.harvest.worker_url = Some(url);
        }
        if let Some(path) = non_empty("HARVEST_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.search.poll_attempts == 0 {
            warnings.push("search.poll_attempts is 0: searches will time out immediately".into());
        }
        if self.search.poll_interval_ms == 0 {
            warnings.push("search.poll_interval_ms is 0: the loop will poll without pause".into());
        }
        if self.watch.max_attempts == 0 {
            warnings.push(
                "watch.max_attempts is 0: every extraction will be force-finished at once".into(),
            );
        }
        if self.watch.poll_interval_secs == 0 {
            warnings.push("watch.poll_interval_secs is 0: the watcher will poll without pause".into());
        }
        if self.search.max_retained == 0 {
            warnings.push("search.max_retained is 0: search results are dropped immediately".into());
        }

        let urls = [
            ("search.agent_url", &self.search.agent_url),
            ("selection.scorer_url", &self.selection.scorer_url),
            ("extraction.worker_url", &self.extraction.worker_url),
            ("harvest.worker_url", &self.harvest.worker_url),
        ];
        for (name, url) in urls {
            if let Some(url) = url
                && reqwest::Url::parse(url).is_err()
            {
                warnings.push(format!("Invalid {} '{}'", name, url));
            }
        }

        warnings
    }
}

/// Runtime configuration resolved from harvest.toml, environment and CLI.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Directory holding harvest.toml and, by default, the database
    pub harvest_dir: PathBuf,
    pub toml: HarvestToml,
}

impl HarvestConfig {
    /// Load configuration from `harvest_dir` and the environment.
    pub fn load(harvest_dir: PathBuf) -> Result<Self> {
        let mut toml = HarvestToml::load_or_default(&harvest_dir)?;
        toml.apply_env();
        Ok(Self { harvest_dir, toml })
    }

    pub fn config_path(&self) -> PathBuf {
        self.harvest_dir.join("harvest.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = HarvestToml::parse("").unwrap();
        assert_eq!(toml.server.port, 5001);
        assert_eq!(toml.search.poll_attempts, 30);
        assert_eq!(toml.search.poll_interval(), Duration::from_secs(1));
        assert_eq!(toml.watch.poll_interval_secs, 3);
        assert_eq!(toml.watch.max_attempts, 60);
        assert_eq!(toml.watch.ceiling_secs, 300);
        assert!(toml.search.agent_url.is_none());
        assert!(!toml.modes.auto_advance);
    }

    #[test]
    fn test_parse_overrides() {
        let content = r#"
[search]
agent_url = "http://127.0.0.1:7400/search"
poll_attempts = 10

[watch]
ceiling_secs = 60

[modes]
auto_select = true
"#;
        let toml = HarvestToml::parse(content).unwrap();
        assert_eq!(
            toml.search.agent_url.as_deref(),
            Some("http://127.0.0.1:7400/search")
        );
        assert_eq!(toml.search.poll_attempts, 10);
        assert_eq!(toml.search.poll_interval_ms, 1000);
        assert_eq!(toml.watch.ceiling_secs, 60);
        assert!(toml.modes.auto_select);
    }

    #[test]
    fn test_parse_rejects_malformed_toml() {
        assert!(HarvestToml::parse("[search\npoll_attempts = ").is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut toml = HarvestToml::parse(
            r#"
[search]
agent_url = "http://file/search"
"#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("HARVEST_SEARCH_AGENT_URL", "http://env/search"),
            ("HARVEST_EXTRACTION_URL", ""),
            ("HARVEST_DB_PATH", "/tmp/h.db"),
        ]
        .into_iter()
        .collect();

        toml.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(toml.search.agent_url.as_deref(), Some("http://env/search"));
        assert!(toml.extraction.worker_url.is_none(), "empty values are ignored");
        assert_eq!(toml.server.db_path, PathBuf::from("/tmp/h.db"));
    }

    #[test]
    fn test_validate_default_is_clean() {
        assert!(HarvestToml::default().validate().is_empty());
    }

    #[test]
    fn test_validate_flags_zero_attempts_and_bad_urls() {
        let mut toml = HarvestToml::default();
        toml.search.poll_attempts = 0;
        toml.selection.scorer_url = Some("not a url".into());
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("poll_attempts")));
        assert!(warnings.iter().any(|w| w.contains("selection.scorer_url")));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = HarvestToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.server.port, 5001);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        let mut toml = HarvestToml::default();
        toml.server.port = 6100;
        toml.extraction.worker_url = Some("http://127.0.0.1:7402/extract".into());
        toml.save(&path).unwrap();

        let loaded = HarvestToml::load(&path).unwrap();
        assert_eq!(loaded.server.port, 6100);
        assert_eq!(
            loaded.extraction.worker_url.as_deref(),
            Some("http://127.0.0.1:7402/extract")
        );
    }
}
