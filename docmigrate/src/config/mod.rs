//! Run configuration loaded from a TOML file plus environment overrides
//!
//! ```toml
//! [backend]
//! endpoint = "https://db.example.com/v1"
//! project = "library"
//! database_id = "main"
//!
//! [resilience]
//! preset = "migration"
//! max_attempts = 5
//!
//! [batch]
//! max_items = 50
//!
//! [[collections]]
//! name = "books"
//!
//! [[imports]]
//! collection = "books"
//! file = "books.json"
//! ```
//!
//! The API key is only ever taken from the environment (`DOCMIGRATE_API_KEY`,
//! optionally through a `.env` file).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use serde::Deserialize;

use crate::api::{HttpBackendConfig, ResilienceConfig};
use crate::api::resilience::ResilienceConfigBuilder;
use crate::import::{BatchSettings, CollectionDescriptor, ImportDefinition, MigrationPlan};

pub const ENV_ENDPOINT: &str = "DOCMIGRATE_ENDPOINT";
pub const ENV_PROJECT: &str = "DOCMIGRATE_PROJECT";
pub const ENV_API_KEY: &str = "DOCMIGRATE_API_KEY";

fn default_progress_collection() -> String {
    "migrations".to_string()
}

fn default_database() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_database")]
    pub database_id: String,
    #[serde(default = "default_progress_collection")]
    pub progress_collection: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            project: None,
            database_id: default_database(),
            progress_collection: default_progress_collection(),
        }
    }
}

/// Preset name plus optional overrides; durations in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceSection {
    #[serde(default)]
    pub preset: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub batch_delay_ms: Option<u64>,
    pub max_concurrent_requests: Option<usize>,
    pub request_logging: Option<bool>,
}

impl ResilienceSection {
    pub fn build(&self) -> Result<ResilienceConfig> {
        let base = match self.preset.as_deref() {
            Some(name) => ResilienceConfig::preset(name)
                .ok_or_else(|| anyhow!("unknown resilience preset '{}'", name))?,
            None => ResilienceConfig::default(),
        };

        let mut builder = ResilienceConfigBuilder::from_config(base);
        if let Some(attempts) = self.max_attempts {
            builder = builder.max_attempts(attempts.max(1));
        }
        if let Some(ms) = self.base_delay_ms {
            builder = builder.base_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.max_delay_ms {
            builder = builder.max_delay(Duration::from_millis(ms));
        }
        if let Some(multiplier) = self.backoff_multiplier {
            builder = builder.backoff_multiplier(multiplier);
        }
        if let Some(jitter) = self.jitter {
            builder = builder.jitter(jitter);
        }
        if let Some(ms) = self.batch_delay_ms {
            builder = builder.batch_delay(Duration::from_millis(ms));
        }
        if let Some(max) = self.max_concurrent_requests {
            builder = builder.max_concurrent_requests(max.max(1));
        }
        if let Some(logging) = self.request_logging {
            builder = builder.request_logging(logging);
        }
        Ok(builder.build())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchSection {
    pub max_items: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl BatchSection {
    pub fn settings(&self) -> BatchSettings {
        let defaults = BatchSettings::default();
        BatchSettings {
            max_items: self.max_items.unwrap_or(defaults.max_items).max(1),
            max_bytes: self.max_bytes.unwrap_or(defaults.max_bytes),
        }
    }
}

/// Contents of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub resilience: ResilienceSection,
    #[serde(default)]
    pub batch: BatchSection,
    /// Directory data files are resolved against; defaults to the config file's directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub collections: Vec<CollectionDescriptor>,
    #[serde(default)]
    pub imports: Vec<ImportDefinition>,
}

impl ImportConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse configuration")
    }

    /// Load a configuration file; relative data directories resolve against its location
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::from_toml(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.data_dir = Some(match config.data_dir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });
        debug!(
            "Loaded config {}: {} collections, {} imports",
            path.display(),
            config.collections.len(),
            config.imports.len()
        );
        Ok(config)
    }

    pub fn resilience(&self) -> Result<ResilienceConfig> {
        self.resilience.build()
    }

    pub fn batch_settings(&self) -> BatchSettings {
        self.batch.settings()
    }

    /// Build the run plan; `data_dir` overrides the configured directory
    pub fn plan(&self, data_dir: Option<&Path>) -> MigrationPlan {
        let data_dir = data_dir
            .map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        MigrationPlan {
            collections: self.collections.clone(),
            imports: self.imports.clone(),
            data_dir,
        }
    }

    /// Backend connection settings, applying environment overrides
    pub fn backend_config(&self, env: impl Fn(&str) -> Option<String>) -> Result<HttpBackendConfig> {
        let endpoint = env(ENV_ENDPOINT)
            .or_else(|| self.backend.endpoint.clone())
            .ok_or_else(|| anyhow!("No backend endpoint; set [backend].endpoint or {}", ENV_ENDPOINT))?;
        let project = env(ENV_PROJECT)
            .or_else(|| self.backend.project.clone())
            .ok_or_else(|| anyhow!("No project; set [backend].project or {}", ENV_PROJECT))?;
        let api_key = env(ENV_API_KEY).filter(|k| !k.trim().is_empty());
        let Some(api_key) = api_key else {
            bail!("{} is not set", ENV_API_KEY);
        };

        Ok(HttpBackendConfig {
            endpoint,
            project,
            api_key,
            database_id: self.backend.database_id.clone(),
            progress_collection: self.backend.progress_collection.clone(),
        })
    }
}

/// Environment lookup that first loads `.env` from the working directory
pub fn process_env() -> impl Fn(&str) -> Option<String> {
    match dotenvy::dotenv() {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => log::warn!("Could not load .env: {}", e),
    }
    |key: &str| std::env::var(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{ImportKind, RelationType};
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
        [backend]
        endpoint = "https://db.example.com/v1"
        project = "library"
        database_id = "main"

        [resilience]
        preset = "conservative"
        max_attempts = 4
        batch_delay_ms = 0

        [batch]
        max_items = 20

        [[collections]]
        name = "books"

        [[collections.relationships]]
        key = "author"
        related_collection = "authors"
        relation_type = "manyToOne"

        [[imports]]
        collection = "books"
        file = "books.json"
        primary_key_field = "id"

        [[imports.mappings]]
        source = "title"
        target = "title"
        converters = ["trim"]

        [[imports]]
        collection = "books"
        kind = "update"
        file = "prices.json"
        update_mapping = { original_id_field = "bookId", target_field = "legacyId" }
    "#;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_sample() {
        let config = ImportConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.backend.progress_collection, "migrations");
        assert_eq!(config.collections[0].relationships[0].relation_type, RelationType::ManyToOne);
        assert_eq!(config.imports[0].mappings[0].converters, ["trim"]);
        assert_eq!(config.imports[1].kind, ImportKind::Update);
        assert_eq!(config.batch_settings().max_items, 20);

        let resilience = config.resilience().unwrap();
        assert_eq!(resilience.retry.max_attempts, 4);
        assert_eq!(resilience.rate_limit.batch_delay, Duration::ZERO);
    }

    #[test]
    fn test_unknown_preset_is_an_error() {
        let config = ImportConfig::from_toml("[resilience]\npreset = \"turbo\"").unwrap();
        assert!(config.resilience().is_err());
    }

    #[test]
    fn test_env_overrides_and_api_key() {
        let config = ImportConfig::from_toml(SAMPLE).unwrap();

        assert!(config.backend_config(env(&[])).is_err());

        let backend = config
            .backend_config(env(&[
                (ENV_API_KEY, "secret"),
                (ENV_ENDPOINT, "http://localhost:8080/v1"),
            ]))
            .unwrap();
        assert_eq!(backend.endpoint, "http://localhost:8080/v1");
        assert_eq!(backend.project, "library");
        assert_eq!(backend.api_key, "secret");
        assert_eq!(backend.database_id, "main");
    }

    #[test]
    fn test_api_key_not_accepted_from_file() {
        let text = "[backend]\napi_key = \"leaked\"";
        assert!(ImportConfig::from_toml(text).is_err());
    }

    #[test]
    fn test_load_resolves_data_dir_next_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("import.toml");
        std::fs::write(&path, "data_dir = \"data\"").unwrap();

        let config = ImportConfig::load(&path).unwrap();
        assert_eq!(config.plan(None).data_dir, dir.path().join("data"));
        assert_eq!(config.plan(Some(Path::new("/tmp/x"))).data_dir, PathBuf::from("/tmp/x"));
    }
}
