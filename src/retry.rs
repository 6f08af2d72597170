//! Bounded generate → validate → execute loop.
//!
//! The first attempt uses the generation prompt; every later attempt uses
//! the repair prompt built from the previous attempt's SQL and failure.
//! Guardrail violations, execution errors and suspicious results are
//! retried. Generation, connectivity and other failures end the run
//! immediately. The loop never makes more than `max_attempts` model calls.

use serde::Serialize;

use crate::config::RetryConfig;
use crate::error::PipelineError;
use crate::executor::SqlExecutor;
use crate::guardrails::Guardrails;
use crate::llm::{extract_sql, LlmClient};
use crate::models::{QueryResult, RetrievedChunk};
use crate::prompt::{self, PromptContext, INSUFFICIENT_SCHEMA};

/// What happened on one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub prompt: String,
    /// SQL as extracted from the model output.
    pub raw_sql: String,
    /// SQL after guardrail normalization, when it passed.
    pub sql: Option<String>,
    /// `ok` or a [`PipelineError::code`].
    pub status: String,
    pub error: Option<String>,
}

/// A successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub sql: String,
    pub result: QueryResult,
    pub attempts: Vec<AttemptRecord>,
    /// Set when every attempt was suspicious and the last executed result
    /// is returned anyway.
    pub suspicious: Option<String>,
}

/// Why an executed result looks wrong, if it does.
pub fn suspicious_reason(result: &QueryResult, config: &RetryConfig) -> Option<String> {
    if config.retry_on_insufficient_schema {
        let sentinel = result
            .scalar()
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.trim() == INSUFFICIENT_SCHEMA);
        if sentinel {
            return Some(
                "the model answered INSUFFICIENT_SCHEMA. Re-read the Schema Context and \
                 answer with tables and columns that appear there."
                    .to_string(),
            );
        }
    }
    if config.retry_on_empty && result.is_empty() {
        return Some(
            "the query executed but returned zero rows. Check join keys and filter values."
                .to_string(),
        );
    }
    None
}

pub struct RetryController<'a> {
    pub llm: &'a dyn LlmClient,
    pub executor: &'a dyn SqlExecutor,
    pub guardrails: &'a Guardrails,
    pub config: &'a RetryConfig,
}

impl RetryController<'_> {
    pub async fn run(
        &self,
        ctx: &PromptContext,
        question: &str,
        chunks: &[RetrievedChunk],
    ) -> Result<RunOutcome, PipelineError> {
        let max_attempts = self.config.max_attempts.max(1);
        let schema_context = prompt::schema_context(chunks);

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<PipelineError> = None;
        let mut last_sql = String::new();
        let mut fallback: Option<(String, QueryResult, String)> = None;

        for attempt in 1..=max_attempts {
            let prompt = match &last_error {
                None => prompt::build_prompt(ctx, question, chunks),
                Some(err) => {
                    prompt::build_fix_prompt(ctx, &schema_context, question, &last_sql, err)
                }
            };

            tracing::debug!(attempt, model = self.llm.model_name(), "generating sql");
            let raw = self
                .llm
                .generate(&prompt)
                .await
                .map_err(|e| PipelineError::Generation(format!("{:#}", e)))?;
            let raw_sql = extract_sql(&raw);

            let outcome = self.attempt(&ctx.domain, &raw_sql).await;
            let (sql, err) = match outcome {
                Ok((sql, result)) => match suspicious_reason(&result, self.config) {
                    None => {
                        attempts.push(record(attempt, prompt, raw_sql, Some(sql.clone()), None));
                        return Ok(RunOutcome {
                            sql,
                            result,
                            attempts,
                            suspicious: None,
                        });
                    }
                    Some(reason) => {
                        fallback = Some((sql.clone(), result, reason.clone()));
                        let err = PipelineError::Suspicious {
                            sql: sql.clone(),
                            reason,
                        };
                        (Some(sql), err)
                    }
                },
                Err(err) if err.is_recoverable() => {
                    // Only a suspicious final attempt may be returned flagged.
                    fallback = None;
                    (err.sql().map(str::to_string), err)
                }
                Err(err) => {
                    attempts.push(record(attempt, prompt, raw_sql, None, Some(&err)));
                    tracing::debug!(attempt, code = err.code(), "attempt failed fatally");
                    return Err(err);
                }
            };

            tracing::warn!(
                attempt,
                max_attempts,
                code = err.code(),
                "attempt rejected: {}",
                err
            );
            attempts.push(record(attempt, prompt, raw_sql.clone(), sql.clone(), Some(&err)));
            last_sql = sql.unwrap_or(raw_sql);
            last_error = Some(err);
        }

        if let Some((sql, result, reason)) = fallback {
            return Ok(RunOutcome {
                sql,
                result,
                attempts,
                suspicious: Some(reason),
            });
        }

        Err(PipelineError::RetriesExhausted {
            attempts: max_attempts,
            last_error: Box::new(last_error.unwrap_or_else(|| {
                PipelineError::Generation("no attempt was made".to_string())
            })),
        })
    }

    /// Validate then execute one candidate.
    async fn attempt(
        &self,
        domain: &str,
        raw_sql: &str,
    ) -> Result<(String, QueryResult), PipelineError> {
        let sql = self
            .guardrails
            .validate(raw_sql)
            .map_err(|violation| PipelineError::Guardrail {
                sql: raw_sql.to_string(),
                violation,
            })?;
        let result = self.executor.execute(domain, &sql).await?;
        Ok((sql, result))
    }
}

fn record(
    attempt: u32,
    prompt: String,
    raw_sql: String,
    sql: Option<String>,
    error: Option<&PipelineError>,
) -> AttemptRecord {
    AttemptRecord {
        attempt,
        prompt,
        raw_sql,
        sql,
        status: error.map(|e| e.code()).unwrap_or("ok").to_string(),
        error: error.map(|e| e.to_string()),
    }
}
