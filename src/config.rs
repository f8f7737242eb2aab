//! Runtime configuration: JSON file, then environment, then CLI flags.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    Agent, AgentOptions, AnswerSynthesizer, AnthropicClient, CheckpointError, CheckpointStore,
    CompletionService, ConfigError, EntityRegistry, EntityResolver, FilteredRetriever, LlmError,
    MemoryCheckpointStore, OllamaClient, QaError, QaSystem, RetryPolicy, SharedQa,
    SqliteCheckpointStore, SqliteMessageIndex, env_f64, env_optional, env_u64, env_usize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Ollama,
    Anthropic,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            _ => Err(ConfigError::Invalid {
                key: "provider".into(),
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ollama => "ollama",
            Self::Anthropic => "anthropic",
        })
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/messages.sqlite")
}
fn default_qa_temperature() -> f64 {
    0.2
}
fn default_max_tokens() -> u64 {
    1024
}
fn default_completion_timeout_ms() -> u64 {
    60_000
}
fn default_search_timeout_ms() -> u64 {
    10_000
}
fn default_max_retries() -> usize {
    2
}
fn default_retry_base_secs() -> f64 {
    0.5
}
fn default_retry_max_secs() -> f64 {
    4.0
}
fn default_entity_k() -> usize {
    10
}
fn default_unscoped_k() -> usize {
    5
}
fn default_match_cutoff() -> u8 {
    70
}
fn default_match_limit() -> usize {
    5
}
fn default_max_agent_steps() -> usize {
    10
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_http_workers() -> usize {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub registry_path: Option<PathBuf>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_qa_temperature")]
    pub qa_temperature: f64,
    #[serde(default)]
    pub agent_temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: f64,
    #[serde(default = "default_retry_max_secs")]
    pub retry_max_secs: f64,
    #[serde(default = "default_entity_k")]
    pub entity_k: usize,
    #[serde(default = "default_unscoped_k")]
    pub unscoped_k: usize,
    #[serde(default = "default_match_cutoff")]
    pub match_cutoff: u8,
    #[serde(default = "default_match_limit")]
    pub match_limit: usize,
    #[serde(default = "default_max_agent_steps")]
    pub max_agent_steps: usize,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_workers")]
    pub http_workers: usize,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            registry_path: None,
            provider: Provider::default(),
            model: None,
            base_url: None,
            api_key: None,
            qa_temperature: default_qa_temperature(),
            agent_temperature: 0.0,
            max_tokens: default_max_tokens(),
            completion_timeout_ms: default_completion_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
            entity_k: default_entity_k(),
            unscoped_k: default_unscoped_k(),
            match_cutoff: default_match_cutoff(),
            match_limit: default_match_limit(),
            max_agent_steps: default_max_agent_steps(),
            checkpoint_path: None,
            log_dir: None,
            bind: default_bind(),
            port: default_port(),
            http_workers: default_http_workers(),
        }
    }
}

impl QaConfig {
    /// Reads `path` (or `AURORA_CONFIG`) if given, then applies environment
    /// overrides. No file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env_optional("AURORA_CONFIG").map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(db) = env_optional("AURORA_DB") {
            self.db_path = PathBuf::from(db);
        }
        if let Some(registry) = env_optional("AURORA_REGISTRY") {
            self.registry_path = Some(PathBuf::from(registry));
        }
        if let Some(provider) = env_optional("AURORA_PROVIDER") {
            self.provider = provider.parse()?;
        }
        if let Some(model) = env_optional("AURORA_MODEL") {
            self.model = Some(model);
        }
        if let Some(url) = env_optional("AURORA_BASE_URL") {
            self.base_url = Some(url);
        } else if self.provider == Provider::Ollama {
            if let Some(host) = env_optional("OLLAMA_HOST") {
                self.base_url = Some(host);
            }
        }
        if let Some(key) = env_optional("ANTHROPIC_API_KEY") {
            self.api_key = Some(key);
        }
        self.qa_temperature = env_f64("AURORA_QA_TEMPERATURE", self.qa_temperature)?;
        self.completion_timeout_ms = env_u64("AURORA_TIMEOUT_MS", self.completion_timeout_ms)?;
        self.max_retries = env_usize("AURORA_MAX_RETRIES", self.max_retries)?;
        self.max_agent_steps = env_usize("AURORA_MAX_STEPS", self.max_agent_steps)?;
        self.http_workers = env_usize("AURORA_HTTP_WORKERS", self.http_workers)?;
        if let Some(path) = env_optional("AURORA_CHECKPOINTS") {
            self.checkpoint_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = env_optional("AURORA_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        self.check()
    }

    fn check(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.qa_temperature) {
            return Err(ConfigError::Invalid {
                key: "qa_temperature".into(),
                value: self.qa_temperature.to_string(),
            });
        }
        if self.http_workers == 0 {
            return Err(ConfigError::Invalid {
                key: "http_workers".into(),
                value: "0".into(),
            });
        }
        if self.match_cutoff > 100 {
            return Err(ConfigError::Invalid {
                key: "match_cutoff".into(),
                value: self.match_cutoff.to_string(),
            });
        }
        Ok(())
    }

    /// Writes the config as pretty JSON via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_secs: self.retry_base_secs,
            max_secs: self.retry_max_secs,
        }
    }

    pub fn completion_service(&self) -> Result<Arc<dyn CompletionService>, LlmError> {
        Ok(match self.provider {
            Provider::Ollama => Arc::new(OllamaClient::new(
                self.base_url.clone(),
                self.model.clone(),
                self.completion_timeout(),
                self.retry_policy(),
            )),
            Provider::Anthropic => Arc::new(AnthropicClient::new(
                self.api_key.clone(),
                self.model.clone(),
                self.base_url.clone(),
                self.completion_timeout(),
                self.retry_policy(),
            )?),
        })
    }

    /// Registry file if configured and readable, else the names present in
    /// the index, else the built-in member list.
    pub fn load_registry(&self, retriever: &FilteredRetriever) -> EntityRegistry {
        if let Some(path) = &self.registry_path {
            match EntityRegistry::load(path) {
                Ok(registry) if !registry.is_empty() => return registry,
                Ok(_) => warn!(path = %path.display(), "registry file is empty"),
                Err(err) => warn!(path = %path.display(), error = %err, "registry file unreadable"),
            }
        }
        if retriever.is_initialized() {
            match retriever.distinct_user_names() {
                Ok(names) if !names.is_empty() => return EntityRegistry::from_names(names),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "could not list member names from index"),
            }
        }
        EntityRegistry::builtin()
    }

    pub fn open_retriever(&self) -> FilteredRetriever {
        FilteredRetriever::from_open(SqliteMessageIndex::open(
            &self.db_path,
            self.search_timeout(),
        ))
        .with_timeout(self.search_timeout())
    }

    pub fn build_qa_with(
        &self,
        retriever: FilteredRetriever,
        service: Arc<dyn CompletionService>,
    ) -> QaSystem {
        let registry = Arc::new(self.load_registry(&retriever));
        info!(members = registry.len(), initialized = retriever.is_initialized(), "qa system ready");
        QaSystem::new(
            EntityResolver::new(registry, self.match_cutoff, self.match_limit),
            retriever,
            AnswerSynthesizer::new(
                service,
                self.qa_temperature,
                self.max_tokens,
                self.completion_timeout(),
            ),
            self.entity_k,
        )
    }

    pub fn build_qa(&self) -> Result<QaSystem, LlmError> {
        Ok(self.build_qa_with(self.open_retriever(), self.completion_service()?))
    }

    pub fn checkpoint_store(&self) -> Result<Arc<dyn CheckpointStore>, CheckpointError> {
        Ok(match &self.checkpoint_path {
            Some(path) => Arc::new(SqliteCheckpointStore::open(path)?),
            None => Arc::new(MemoryCheckpointStore::new()),
        })
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            max_steps: self.max_agent_steps,
            temperature: self.agent_temperature,
            max_tokens: self.max_tokens,
            timeout: self.completion_timeout(),
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn build_agent(&self, qa: SharedQa) -> Result<Agent, QaError> {
        Ok(Agent::new(
            qa,
            self.completion_service()?,
            self.checkpoint_store()?,
            self.agent_options(),
        ))
    }
}
