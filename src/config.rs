use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    pub domains: BTreeMap<String, DomainConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_index_path")]
    pub path: PathBuf,
    #[serde(default = "default_schemas_dir")]
    pub schemas_dir: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: default_index_path(),
            schemas_dir: default_schemas_dir(),
        }
    }
}

fn default_index_path() -> PathBuf {
    PathBuf::from("./data/index.sqlite")
}
fn default_schemas_dir() -> PathBuf {
    PathBuf::from("./data/schemas")
}

/// Connection defaults shared by every domain.
#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            user: default_pg_user(),
            password: None,
            max_rows: default_max_rows(),
            statement_timeout_secs: default_statement_timeout_secs(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_pg_host() -> String {
    "localhost".to_string()
}
fn default_pg_port() -> u16 {
    5432
}
fn default_pg_user() -> String {
    "postgres".to_string()
}
fn default_max_rows() -> usize {
    200
}
fn default_statement_timeout_secs() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    2
}
fn default_connect_timeout_secs() -> u64 {
    10
}

/// A target database plus the business vocabulary used when prompting for it.
#[derive(Debug, Deserialize, Clone)]
pub struct DomainConfig {
    pub dbname: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Catalog schemas to extract. Empty means every non-system schema.
    #[serde(default)]
    pub schemas: Vec<String>,
    /// Few-shot file in `Q: ... / SQL: ...` format.
    #[serde(default)]
    pub examples_path: Option<PathBuf>,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
}

/// Fully resolved connection parameters for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider (default: `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: Some("all-minilm-l6-v2".to_string()),
            dims: Some(384),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_embed_max_retries() -> u32 {
    3
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            num_predict: default_num_predict(),
            timeout_secs: default_llm_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_llm_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5-coder:7b".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_num_predict() -> u32 {
    512
}
fn default_llm_timeout_secs() -> u64 {
    180
}
fn default_system_prompt() -> String {
    "You are a precise Text-to-SQL generator. Output ONLY SQL.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Always place the domain's relationship map first in the context.
    #[serde(default = "default_true")]
    pub pin_relationships: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            pin_relationships: true,
        }
    }
}

fn default_top_k() -> usize {
    12
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardrailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// LIMIT values above this are rewritten down to it.
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
    /// Append `LIMIT max_limit` to SQL that has none, before validation runs.
    #[serde(default)]
    pub append_missing_limit: bool,
    #[serde(default = "default_forbidden_keywords")]
    pub forbidden_keywords: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_limit: default_max_limit(),
            append_missing_limit: false,
            forbidden_keywords: default_forbidden_keywords(),
        }
    }
}

fn default_max_limit() -> u64 {
    200
}

pub fn default_forbidden_keywords() -> Vec<String> {
    [
        "insert", "update", "delete", "drop", "alter", "truncate", "create", "grant", "revoke",
        "commit", "rollback", "vacuum", "pragma", "attach", "detach", "copy", "call", "execute",
        "merge",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Treat a zero-row result as suspicious and regenerate.
    #[serde(default)]
    pub retry_on_empty: bool,
    /// Treat the `INSUFFICIENT_SCHEMA` sentinel answer as suspicious and regenerate.
    #[serde(default = "default_true")]
    pub retry_on_insufficient_schema: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_on_empty: false,
            retry_on_insufficient_schema: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8501".to_string()
}

impl Config {
    /// Look up a domain by name.
    pub fn domain(&self, name: &str) -> Result<&DomainConfig> {
        self.domains.get(name).ok_or_else(|| {
            anyhow::anyhow!(
                "Unknown domain '{}'. Available: {}",
                name,
                self.domain_names().join(", ")
            )
        })
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }

    /// Resolve the connection for a domain, applying per-domain overrides
    /// on top of the `[postgres]` defaults.
    pub fn connection(&self, name: &str) -> Result<ConnectionSettings> {
        let domain = self.domain(name)?;
        Ok(ConnectionSettings {
            host: domain
                .host
                .clone()
                .unwrap_or_else(|| self.postgres.host.clone()),
            port: domain.port.unwrap_or(self.postgres.port),
            user: domain
                .user
                .clone()
                .unwrap_or_else(|| self.postgres.user.clone()),
            password: domain
                .password
                .clone()
                .or_else(|| self.postgres.password.clone()),
            dbname: domain.dbname.clone(),
        })
    }

    /// Path of the JSON catalog snapshot for a domain.
    pub fn snapshot_path(&self, domain: &str) -> PathBuf {
        self.index.schemas_dir.join(format!("{}.json", domain))
    }

    /// Environment variables override the `[postgres]` and `[llm]` defaults.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("POSTGRES_HOST") {
            self.postgres.host = host;
        }
        if let Ok(port) = std::env::var("POSTGRES_PORT") {
            self.postgres.port = port
                .parse()
                .with_context(|| format!("POSTGRES_PORT is not a valid port: {}", port))?;
        }
        if let Ok(user) = std::env::var("POSTGRES_USER") {
            self.postgres.user = user;
        }
        if let Ok(password) = std::env::var("POSTGRES_PASSWORD") {
            self.postgres.password = Some(password);
        }
        if let Ok(url) = std::env::var("OLLAMA_URL") {
            self.llm.url = url;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            self.llm.model = model;
        }
        Ok(())
    }
}

/// Parse and validate a configuration document without touching the
/// environment.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env_overrides()?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.domains.is_empty() {
        bail!("at least one [domains.<name>] entry is required");
    }
    for (name, domain) in &config.domains {
        if domain.dbname.trim().is_empty() {
            bail!("domains.{}.dbname must not be empty", name);
        }
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }

    if config.retry.max_attempts < 1 {
        bail!("retry.max_attempts must be >= 1");
    }

    if config.guardrails.max_limit < 1 {
        bail!("guardrails.max_limit must be >= 1");
    }

    if config.postgres.max_rows < 1 {
        bail!("postgres.max_rows must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, ollama, or local.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[domains.chinook]
dbname = "chinook"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.retrieval.top_k, 12);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.guardrails.max_limit, 200);
        assert!(cfg.guardrails.enabled);
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.llm.model, "qwen2.5-coder:7b");
        assert_eq!(cfg.snapshot_path("chinook"), PathBuf::from("./data/schemas/chinook.json"));
    }

    #[test]
    fn test_domain_overrides_postgres_defaults() {
        let cfg = parse_config(
            r#"
[postgres]
host = "db.internal"
user = "reader"
password = "secret"

[domains.chinook]
dbname = "chinook"

[domains.northwind]
dbname = "northwind"
host = "replica"
port = 6543
"#,
        )
        .unwrap();

        let chinook = cfg.connection("chinook").unwrap();
        assert_eq!(chinook.host, "db.internal");
        assert_eq!(chinook.port, 5432);
        assert_eq!(chinook.user, "reader");
        assert_eq!(chinook.password.as_deref(), Some("secret"));

        let northwind = cfg.connection("northwind").unwrap();
        assert_eq!(northwind.host, "replica");
        assert_eq!(northwind.port, 6543);
        assert_eq!(northwind.dbname, "northwind");
    }

    #[test]
    fn test_unknown_domain_lists_available() {
        let cfg = parse_config(MINIMAL).unwrap();
        let err = cfg.connection("sakila").unwrap_err().to_string();
        assert!(err.contains("sakila"));
        assert!(err.contains("chinook"));
    }

    #[test]
    fn test_glossary_parsed() {
        let cfg = parse_config(
            r#"
[domains.chinook]
dbname = "chinook"

[domains.chinook.glossary]
revenue = "SUM(invoice_line.unit_price * invoice_line.quantity)"
"#,
        )
        .unwrap();
        let glossary = &cfg.domain("chinook").unwrap().glossary;
        assert_eq!(glossary.len(), 1);
        assert!(glossary["revenue"].starts_with("SUM("));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let err = parse_config(
            r#"
[domains.chinook]
dbname = "chinook"

[retry]
max_attempts = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_attempts"));
    }

    #[test]
    fn test_rejects_empty_domains() {
        assert!(parse_config("domains = {}").is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config(
            r#"
[domains.chinook]
dbname = "chinook"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }
}
