//! Failure kinds of a pipeline run.
//!
//! Plumbing and commands use `anyhow`; the pipeline itself needs to know
//! which failures are worth another generation attempt, so it speaks this
//! enum instead.

use thiserror::Error;

use crate::guardrails::Violation;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Unknown domain '{name}'. Available: {available}")]
    UnknownDomain { name: String, available: String },

    #[error("database unreachable for domain '{domain}': {message}")]
    Connectivity { domain: String, message: String },

    #[error("schema retrieval failed: {0}")]
    Retrieval(String),

    #[error("SQL generation failed: {0}")]
    Generation(String),

    #[error("guardrails rejected SQL ({violation})")]
    Guardrail { sql: String, violation: Violation },

    #[error("execution failed: {message}")]
    Execution { sql: String, message: String },

    #[error("suspicious result: {reason}")]
    Suspicious { sql: String, reason: String },

    #[error("SQL failed after {attempts} attempts. Last error: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Failures the retry controller may answer with another attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Guardrail { .. }
                | PipelineError::Execution { .. }
                | PipelineError::Suspicious { .. }
        )
    }

    /// Machine-readable code used in API error bodies and reports.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::UnknownDomain { .. } => "unknown_domain",
            PipelineError::Connectivity { .. } => "connectivity",
            PipelineError::Retrieval(_) => "retrieval_failed",
            PipelineError::Generation(_) => "generation_failed",
            PipelineError::Guardrail { .. } => "guardrail_violation",
            PipelineError::Execution { .. } => "execution_error",
            PipelineError::Suspicious { .. } => "suspicious_result",
            PipelineError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }

    /// The SQL the failure is about, when there is one.
    pub fn sql(&self) -> Option<&str> {
        match self {
            PipelineError::Guardrail { sql, .. }
            | PipelineError::Execution { sql, .. }
            | PipelineError::Suspicious { sql, .. } => Some(sql),
            PipelineError::RetriesExhausted { last_error, .. } => last_error.sql(),
            _ => None,
        }
    }
}
