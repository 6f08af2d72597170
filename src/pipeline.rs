//! One question, end to end.
//!
//! [`Services`] bundles the four external collaborators (embedder, vector
//! store, model, database) behind their traits together with the
//! configuration, so the CLI, web server and evaluation harness all run the
//! exact same flow: retrieve → prompt → generate → validate → execute, with
//! bounded repair attempts.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::PipelineError;
use crate::executor::{PgExecutor, SqlExecutor};
use crate::guardrails::Guardrails;
use crate::llm::{extract_sql, LlmClient, OllamaClient};
use crate::migrate;
use crate::models::{QueryResult, RetrievedChunk};
use crate::prompt::{self, PromptContext};
use crate::retrieve;
use crate::retry::{RetryController, RunOutcome};
use crate::store::{SqliteStore, VectorStore};

pub struct Services {
    pub config: Config,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub store: Arc<dyn VectorStore>,
    pub llm: Arc<dyn LlmClient>,
    pub executor: Arc<dyn SqlExecutor>,
    pub guardrails: Guardrails,
}

/// Output of a single generation attempt, without execution.
#[derive(Debug, Clone, Serialize)]
pub struct Generated {
    pub prompt: String,
    pub raw_sql: String,
    pub sql: String,
}

/// A full pipeline answer.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub domain: String,
    pub question: String,
    /// Model that generated the SQL.
    pub model: String,
    pub chunks: Vec<RetrievedChunk>,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

impl Services {
    /// Production wiring: SQLite index, configured embedder, Ollama, Postgres.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect_index(config).await?;
        migrate::create_tables(&pool).await?;
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        let llm = OllamaClient::new(&config.llm)?;

        Ok(Self::new(
            config.clone(),
            embedder,
            Arc::new(SqliteStore::new(pool)),
            Arc::new(llm),
            Arc::new(PgExecutor::new(config.clone())),
        ))
    }

    pub fn new(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        let guardrails = Guardrails::new(&config.guardrails);
        Self {
            config,
            embedder,
            store,
            llm,
            executor,
            guardrails,
        }
    }

    fn check_domain(&self, domain: &str) -> Result<(), PipelineError> {
        if self.config.domains.contains_key(domain) {
            Ok(())
        } else {
            Err(PipelineError::UnknownDomain {
                name: domain.to_string(),
                available: self.config.domain_names().join(", "),
            })
        }
    }

    fn prompt_context(&self, domain: &str) -> Result<PromptContext, PipelineError> {
        PromptContext::for_domain(&self.config, domain)
            .map_err(|e| PipelineError::Generation(format!("{:#}", e)))
    }

    pub async fn retrieve(
        &self,
        domain: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedChunk>, PipelineError> {
        self.check_domain(domain)?;
        retrieve::retrieve(
            self.embedder.as_ref(),
            self.store.as_ref(),
            domain,
            question,
            k.unwrap_or(self.config.retrieval.top_k).max(1),
            self.config.retrieval.pin_relationships,
        )
        .await
    }

    /// Retrieve, prompt, generate once and validate. Nothing is executed.
    pub async fn generate(
        &self,
        domain: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<(Vec<RetrievedChunk>, Generated), PipelineError> {
        let chunks = self.retrieve(domain, question, k).await?;
        let ctx = self.prompt_context(domain)?;
        let prompt = prompt::build_prompt(&ctx, question, &chunks);

        let raw = self
            .llm
            .generate(&prompt)
            .await
            .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;
        let raw_sql = extract_sql(&raw);
        let sql = self
            .guardrails
            .validate(&raw_sql)
            .map_err(|violation| PipelineError::Guardrail {
                sql: raw_sql.clone(),
                violation,
            })?;

        Ok((
            chunks,
            Generated {
                prompt,
                raw_sql,
                sql,
            },
        ))
    }

    /// The full pipeline with repair attempts.
    pub async fn ask(
        &self,
        domain: &str,
        question: &str,
        k: Option<usize>,
    ) -> Result<Answer, PipelineError> {
        let chunks = self.retrieve(domain, question, k).await?;
        let ctx = self.prompt_context(domain)?;

        let controller = RetryController {
            llm: self.llm.as_ref(),
            executor: self.executor.as_ref(),
            guardrails: &self.guardrails,
            config: &self.config.retry,
        };
        let outcome = controller.run(&ctx, question, &chunks).await?;

        tracing::info!(
            domain,
            model = self.llm.model_name(),
            attempts = outcome.attempts.len(),
            rows = outcome.result.row_count(),
            "question answered"
        );

        Ok(Answer {
            domain: domain.to_string(),
            question: question.to_string(),
            model: self.llm.model_name().to_string(),
            chunks,
            outcome,
        })
    }

    /// Guardrail-check and run user-supplied SQL, with no retries.
    pub async fn execute_sql(
        &self,
        domain: &str,
        sql: &str,
    ) -> Result<(String, QueryResult), PipelineError> {
        self.check_domain(domain)?;
        let safe = self
            .guardrails
            .validate(sql)
            .map_err(|violation| PipelineError::Guardrail {
                sql: sql.to_string(),
                violation,
            })?;
        let result = self.executor.execute(domain, &safe).await?;
        Ok((safe, result))
    }
}

/// Options for `nlsql ask`.
#[derive(Debug, Default)]
pub struct AskOptions<'a> {
    pub k: Option<usize>,
    pub show_prompt: bool,
    pub sql_only: bool,
    pub csv: Option<&'a Path>,
}

/// `nlsql ask`: run the pipeline and print the SQL and result table.
pub async fn run_ask(
    config: &Config,
    domain: &str,
    question: &str,
    opts: AskOptions<'_>,
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let answer = services.ask(domain, question, opts.k).await?;
    let outcome = &answer.outcome;

    if opts.show_prompt {
        for a in &outcome.attempts {
            println!("===== PROMPT (attempt {}) =====", a.attempt);
            println!("{}", a.prompt);
            println!("===== END PROMPT =====");
            println!();
        }
    }

    if opts.sql_only {
        println!("{}", outcome.sql);
    } else {
        for a in outcome.attempts.iter().filter(|a| a.status != "ok") {
            println!(
                "attempt {} rejected ({}): {}",
                a.attempt,
                a.status,
                a.error.as_deref().unwrap_or("")
            );
        }
        println!("SQL:");
        println!("{}", outcome.sql);
        println!();
        print!("{}", outcome.result.render_table());
        println!(
            "({} rows{})",
            outcome.result.row_count(),
            if outcome.result.truncated {
                ", truncated"
            } else {
                ""
            }
        );
        if let Some(reason) = &outcome.suspicious {
            println!("warning: result may be wrong: {}", reason);
        }
    }

    if let Some(path) = opts.csv {
        let csv = outcome.result.to_csv()?;
        std::fs::write(path, csv)
            .with_context(|| format!("Failed to write CSV: {}", path.display()))?;
        eprintln!("Wrote {}", path.display());
    }

    Ok(())
}

/// `nlsql retrieve`: print the chunks a question would be answered with.
pub async fn run_retrieve(
    config: &Config,
    domain: &str,
    question: &str,
    k: Option<usize>,
) -> Result<()> {
    let services = Services::from_config(config).await?;
    let chunks = services.retrieve(domain, question, k).await?;
    retrieve::print_chunks(&chunks);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_schema;
    use crate::models::{ColumnInfo, DomainSchema, TableSchema};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct OnesEmbedder;

    #[async_trait]
    impl EmbeddingProvider for OnesEmbedder {
        fn model_name(&self) -> &str {
            "ones"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
        }
    }

    struct FixedLlm(&'static str);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    struct EchoExecutor;

    #[async_trait]
    impl SqlExecutor for EchoExecutor {
        async fn execute(&self, _domain: &str, sql: &str) -> Result<QueryResult, PipelineError> {
            Ok(QueryResult {
                columns: vec!["sql".into()],
                rows: vec![vec![json!(sql)]],
                truncated: false,
            })
        }
    }

    async fn services(reply: &'static str) -> Services {
        let config = crate::config::parse_config(
            r#"
            [domains.chinook]
            dbname = "chinook"
            [embedding]
            provider = "disabled"
            "#,
        )
        .unwrap();
        let store = InMemoryStore::new();
        let schema = DomainSchema {
            domain: "chinook".into(),
            tables: vec![TableSchema {
                table: "public.customer".into(),
                columns: vec![ColumnInfo {
                    name: "first_name".into(),
                    data_type: "text".into(),
                }],
                primary_key: vec![],
                foreign_keys: vec![],
                description: String::new(),
            }],
        };
        for c in chunk_schema(&schema) {
            store.upsert(&c, &[1.0, 1.0], "ones").await.unwrap();
        }
        Services::new(
            config,
            Arc::new(OnesEmbedder),
            Arc::new(store),
            Arc::new(FixedLlm(reply)),
            Arc::new(EchoExecutor),
        )
    }

    #[tokio::test]
    async fn test_ask_list_all_customers() {
        let s = services("SELECT c.first_name FROM public.customer c LIMIT 500;").await;
        let answer = s.ask("chinook", "List all customers", None).await.unwrap();
        let sql = &answer.outcome.sql;
        assert!(sql.starts_with("SELECT"));
        assert!(sql.contains("LIMIT 200"));
        assert_eq!(answer.model, "fixed");
        assert_eq!(answer.chunks[0].chunk.id, "chinook::relationships");
        assert!(answer.outcome.attempts[0].prompt.contains("TABLE: public.customer"));
    }

    #[tokio::test]
    async fn test_generate_does_not_execute_and_reports_violation() {
        let s = services("SELECT first_name FROM customer").await;
        let err = s.generate("chinook", "names", Some(3)).await.unwrap_err();
        assert_eq!(err.code(), "guardrail_violation");
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let s = services("SELECT 1 LIMIT 1").await;
        let err = s.ask("pagila", "films", None).await.unwrap_err();
        assert_eq!(err.code(), "unknown_domain");
        let err = s.execute_sql("pagila", "SELECT 1 LIMIT 1").await.unwrap_err();
        assert_eq!(err.code(), "unknown_domain");
    }

    #[tokio::test]
    async fn test_execute_sql_applies_guardrails() {
        let s = services("unused").await;
        let err = s.execute_sql("chinook", "DROP TABLE customer").await.unwrap_err();
        assert_eq!(err.code(), "guardrail_violation");
        let (sql, result) = s
            .execute_sql("chinook", "SELECT 1 LIMIT 1000")
            .await
            .unwrap();
        assert_eq!(sql, "SELECT 1 LIMIT 200");
        assert_eq!(result.rows[0][0], json!("SELECT 1 LIMIT 200"));
    }
}
