use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reag_adapters::{site_profile, Acquisition, ListingSiteAdapter, SourceAdapter, BUILTIN_SOURCES};
use reag_storage::{BrowserConfig, HttpClientConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

pub const DEFAULT_SYNTHETIC_SEED: u64 = 0x5eed;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Free text sent per candidate is cut to this many characters.
    pub max_input_chars: usize,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: 30,
            max_input_chars: 4000,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Postgres store when set, in-memory store otherwise.
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub render_settle_ms: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub synthetic_fallback: bool,
    pub synthetic_seed: u64,
    pub llm: LlmConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            user_agent: "reag-bot/0.1".to_string(),
            http_timeout_secs: 20,
            max_body_bytes: 2 * 1024 * 1024,
            render_settle_ms: 1500,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
            synthetic_fallback: true,
            synthetic_seed: DEFAULT_SYNTHETIC_SEED,
            llm: LlmConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let llm_defaults = LlmConfig::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("REAG_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("REAG_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("REAG_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_body_bytes: env_parse("REAG_MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            render_settle_ms: env_parse("REAG_RENDER_SETTLE_MS").unwrap_or(defaults.render_settle_ms),
            retry_attempts: env_parse("REAG_RETRY_ATTEMPTS").unwrap_or(defaults.retry_attempts),
            retry_base_delay_ms: env_parse("REAG_RETRY_BASE_DELAY_MS").unwrap_or(defaults.retry_base_delay_ms),
            synthetic_fallback: env_flag("REAG_SYNTHETIC_FALLBACK").unwrap_or(defaults.synthetic_fallback),
            synthetic_seed: env_parse("REAG_SYNTHETIC_SEED").unwrap_or(defaults.synthetic_seed),
            llm: LlmConfig {
                enabled: env_flag("REAG_LLM_ENABLED").unwrap_or(llm_defaults.enabled),
                endpoint: std::env::var("REAG_LLM_ENDPOINT").unwrap_or(llm_defaults.endpoint),
                model: std::env::var("REAG_LLM_MODEL").unwrap_or(llm_defaults.model),
                timeout_secs: env_parse("REAG_LLM_TIMEOUT_SECS").unwrap_or(llm_defaults.timeout_secs),
                max_input_chars: env_parse("REAG_LLM_MAX_INPUT_CHARS").unwrap_or(llm_defaults.max_input_chars),
                temperature: llm_defaults.temperature,
            },
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_body_bytes: self.max_body_bytes,
            ..Default::default()
        }
    }

    pub fn browser_config(&self) -> BrowserConfig {
        BrowserConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            settle: Duration::from_millis(self.render_settle_ms),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the built-in acquisition strategy.
    #[serde(default)]
    pub acquisition: Option<Acquisition>,
    /// Overrides the built-in URL templates when non-empty.
    #[serde(default)]
    pub listing_urls: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// Enabled sources turned into adapters, plus ids no adapter exists for.
pub struct ResolvedSources {
    pub adapters: Vec<Arc<dyn SourceAdapter>>,
    pub unresolved: Vec<String>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: BUILTIN_SOURCES
                .iter()
                .map(|id| SourceConfig {
                    source_id: id.to_string(),
                    display_name: None,
                    enabled: true,
                    acquisition: None,
                    listing_urls: Vec::new(),
                })
                .collect(),
        }
    }

    /// Read `sources.yaml` under `workspace_root`, falling back to the built-in sources
    /// when the file does not exist.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "no source registry on disk; using built-in sources");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn resolve(&self) -> ResolvedSources {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
        let mut unresolved = Vec::new();
        for source in self.sources.iter().filter(|s| s.enabled) {
            let Some(mut profile) = site_profile(&source.source_id) else {
                warn!(source_id = %source.source_id, "no adapter registered for source");
                unresolved.push(source.source_id.clone());
                continue;
            };
            if let Some(name) = &source.display_name {
                profile.display_name = name.clone();
            }
            if let Some(acquisition) = source.acquisition {
                profile.acquisition = acquisition;
            }
            if !source.listing_urls.is_empty() {
                profile.listing_urls = source.listing_urls.clone();
            }
            adapters.push(Arc::new(ListingSiteAdapter::new(profile)));
        }
        ResolvedSources { adapters, unresolved }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_registry_falls_back_to_builtin_sources() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry, SourceRegistry::builtin());
        let resolved = registry.resolve();
        assert_eq!(resolved.adapters.len(), 3);
        assert!(resolved.unresolved.is_empty());
    }

    #[tokio::test]
    async fn registry_overrides_and_unknown_sources() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sources.yaml"),
            r#"
sources:
  - source_id: magicbricks
    display_name: Magic Bricks
    acquisition: rendered
    listing_urls:
      - "https://mirror.example/{city}"
  - source_id: 99acres
    enabled: false
  - source_id: nobroker
"#,
        )
        .unwrap();

        let registry = SourceRegistry::load(dir.path()).await.unwrap();
        assert_eq!(registry.sources.len(), 3);
        let resolved = registry.resolve();
        assert_eq!(resolved.adapters.len(), 1);
        assert_eq!(resolved.unresolved, vec!["nobroker".to_string()]);

        let mb = &resolved.adapters[0];
        assert_eq!(mb.display_name(), "Magic Bricks");
        assert_eq!(mb.acquisition(), Acquisition::Rendered);
        assert_eq!(mb.listing_targets("Pune")[0].url, "https://mirror.example/pune");
    }

    #[tokio::test]
    async fn malformed_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sources.yaml"), "sources: [unclosed").unwrap();
        let err = SourceRegistry::load(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn retry_policy_never_drops_below_one_attempt() {
        let config = SyncConfig {
            retry_attempts: 0,
            retry_base_delay_ms: 250,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after_attempt(2), Duration::from_millis(500));
    }
}
