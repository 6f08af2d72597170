//! Prompt construction.
//!
//! A generation prompt is: static rules, dialect and domain, the domain
//! glossary, few-shot examples, the retrieved schema context, and the
//! question. Retries use a separate repair prompt that also carries the
//! failing SQL and what went wrong with it.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::RetrievedChunk;

/// Marker the model is told to return when the schema context cannot
/// answer the question.
pub const INSUFFICIENT_SCHEMA: &str = "INSUFFICIENT_SCHEMA";

pub const DEFAULT_DIALECT: &str = "PostgreSQL";

const NO_CONTEXT: &str = "(no schema context found)";
const CHUNK_SEPARATOR: &str = "\n\n---\n\n";

const SYSTEM_RULES: &str = "You are an expert Text-to-SQL assistant.

Your task:
Generate ONE PostgreSQL SQL query that answers the user's question using the given schema context.

Hard Rules (must follow):
- Output ONLY the SQL query (no explanation, no markdown, no backticks).
- Produce EXACTLY ONE statement (SELECT or WITH only).
- Use ONLY table names and column names that appear in the Schema Context.
- DO NOT invent columns. If a needed column is not present, choose the closest valid column from the Schema Context.
- Use correct JOIN keys based on foreign keys; if foreign keys are not shown, join on matching *_id columns.
- Qualify columns with table aliases (e.g., c.customer_id).
- Avoid SELECT * unless the question explicitly asks for all fields.
- Always include ORDER BY when asking for top/bottom results.
- Always include LIMIT when returning rows.

If the question cannot be answered using the Schema Context, output exactly:
SELECT 'INSUFFICIENT_SCHEMA' AS error LIMIT 1;
";

const REPAIR_RULES: &str = "You are an expert SQL debugger.

Task:
Fix the SQL query so it executes successfully and answers the question.

Rules:
- Output ONLY the corrected SQL (no markdown, no explanation).
- Produce exactly ONE statement (SELECT or WITH only).
- Use ONLY tables/columns that appear in the Schema Context.
- Do NOT invent columns. If a column does not exist, replace it with a valid one from schema.
- Keep the intent of the question.
- Ensure the final query includes LIMIT.
";

/// Everything about a domain that goes into every prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub domain: String,
    pub dialect: String,
    pub glossary: BTreeMap<String, String>,
    /// Raw few-shot text (`Q:` / `SQL:` pairs); empty when there is none.
    pub few_shot: String,
}

impl PromptContext {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            dialect: DEFAULT_DIALECT.to_string(),
            ..Default::default()
        }
    }

    /// Load a domain's glossary and few-shot file from configuration.
    pub fn for_domain(config: &Config, domain: &str) -> Result<Self> {
        let domain_config = config.domain(domain)?;
        let path = domain_config
            .examples_path
            .clone()
            .unwrap_or_else(|| default_examples_path(domain));
        Ok(Self {
            domain: domain.to_string(),
            dialect: DEFAULT_DIALECT.to_string(),
            glossary: domain_config.glossary.clone(),
            few_shot: load_few_shot(&path)?,
        })
    }

    fn glossary_section(&self) -> String {
        if self.glossary.is_empty() {
            return String::new();
        }
        let mut out = String::from("Business Glossary (use these definitions):\n");
        for (term, formula) in &self.glossary {
            let _ = writeln!(out, "- {}: {}", term, formula);
        }
        out.push('\n');
        out
    }

    fn few_shot_section(&self) -> String {
        if self.few_shot.is_empty() {
            String::new()
        } else {
            format!("Few-shot Examples (follow this style):\n{}\n\n", self.few_shot)
        }
    }
}

pub fn default_examples_path(domain: &str) -> PathBuf {
    Path::new("data/examples").join(format!("{}.txt", domain))
}

/// Read a few-shot file. A missing file means no examples.
pub fn load_few_shot(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read few-shot examples: {}", path.display()))?;
    Ok(text.trim().to_string())
}

/// Join retrieved chunk texts into the schema context block.
pub fn schema_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT.to_string();
    }
    chunks
        .iter()
        .map(|c| c.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join(CHUNK_SEPARATOR)
}

/// First-attempt prompt.
pub fn build_prompt(ctx: &PromptContext, question: &str, chunks: &[RetrievedChunk]) -> String {
    format!(
        "{rules}\nSQL Dialect: {dialect}\nDomain: {domain}\n\n{glossary}{few_shot}Schema Context:\n{context}\n\nUser Question:\n{question}\n\nSQL:\n",
        rules = SYSTEM_RULES,
        dialect = ctx.dialect,
        domain = ctx.domain,
        glossary = ctx.glossary_section(),
        few_shot = ctx.few_shot_section(),
        context = schema_context(chunks),
        question = question.trim(),
    )
}

/// Heading and body describing why the previous attempt was rejected.
pub fn failure_note(error: &PipelineError) -> (&'static str, String) {
    match error {
        PipelineError::Guardrail { violation, .. } => ("Guardrail Violation", violation.to_string()),
        PipelineError::Execution { message, .. } => ("Database Error", message.clone()),
        PipelineError::Suspicious { reason, .. } => ("Suspicious Result", reason.clone()),
        other => ("Error", other.to_string()),
    }
}

/// Repair prompt for a retry after `error` on `bad_sql`.
pub fn build_fix_prompt(
    ctx: &PromptContext,
    schema_context: &str,
    question: &str,
    bad_sql: &str,
    error: &PipelineError,
) -> String {
    let (heading, detail) = failure_note(error);
    format!(
        "{rules}\nSQL Dialect: {dialect}\nDomain: {domain}\n\n{glossary}Schema Context:\n{context}\n\nUser Question:\n{question}\n\nBad SQL:\n{bad_sql}\n\n{heading}:\n{detail}\n\nCorrected SQL:\n",
        rules = REPAIR_RULES,
        dialect = ctx.dialect,
        domain = ctx.domain,
        glossary = ctx.glossary_section(),
        context = schema_context,
        question = question.trim(),
        bad_sql = bad_sql.trim(),
        heading = heading,
        detail = detail.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrails::Violation;
    use crate::models::{ChunkKind, SchemaChunk};

    fn rc(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: SchemaChunk {
                id: text.into(),
                domain: "chinook".into(),
                kind: ChunkKind::Schema,
                table: None,
                text: text.into(),
                hash: String::new(),
            },
            score: 1.0,
            pinned: false,
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let mut ctx = PromptContext::new("chinook");
        ctx.glossary
            .insert("revenue".into(), "SUM(invoice_line.unit_price * invoice_line.quantity)".into());
        ctx.few_shot = "Q: How many artists?\nSQL: SELECT COUNT(*) FROM artist LIMIT 1;".into();

        let prompt = build_prompt(&ctx, "  Top 5 artists by revenue ", &[rc("TABLE: a"), rc("TABLE: b")]);

        let positions: Vec<usize> = [
            "Hard Rules",
            "SQL Dialect: PostgreSQL",
            "Domain: chinook",
            "Business Glossary",
            "- revenue: SUM(",
            "Few-shot Examples (follow this style):\nQ: How many artists?",
            "Schema Context:\nTABLE: a\n\n---\n\nTABLE: b",
            "User Question:\nTop 5 artists by revenue\n",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap_or_else(|| panic!("missing {}", needle)))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.ends_with("SQL:\n"));
    }

    #[test]
    fn test_prompt_without_context_or_examples() {
        let prompt = build_prompt(&PromptContext::new("northwind"), "q", &[]);
        assert!(prompt.contains("Schema Context:\n(no schema context found)"));
        assert!(!prompt.contains("Few-shot"));
        assert!(!prompt.contains("Glossary"));
        assert!(prompt.contains(INSUFFICIENT_SCHEMA));
    }

    #[test]
    fn test_fix_prompt_carries_error() {
        let ctx = PromptContext::new("chinook");
        let err = PipelineError::Execution {
            sql: "SELECT nme FROM artist LIMIT 5".into(),
            message: "column \"nme\" does not exist".into(),
        };
        let prompt = build_fix_prompt(&ctx, "TABLE: artist", "names", "SELECT nme FROM artist LIMIT 5", &err);
        assert!(prompt.starts_with("You are an expert SQL debugger."));
        assert!(prompt.contains("Bad SQL:\nSELECT nme FROM artist LIMIT 5\n"));
        assert!(prompt.contains("Database Error:\ncolumn \"nme\" does not exist"));
        assert!(prompt.ends_with("Corrected SQL:\n"));
    }

    #[test]
    fn test_fix_prompt_for_guardrail() {
        let err = PipelineError::Guardrail {
            sql: "SELECT 1".into(),
            violation: Violation::MissingLimit,
        };
        let (heading, detail) = failure_note(&err);
        assert_eq!(heading, "Guardrail Violation");
        assert!(detail.starts_with("missing_limit"));
    }

    #[test]
    fn test_load_few_shot_missing_is_empty() {
        assert_eq!(load_few_shot(Path::new("/nonexistent/x.txt")).unwrap(), "");
        let dir = tempfile::TempDir::new().unwrap();
        let p = dir.path().join("chinook.txt");
        std::fs::write(&p, "\n\nQ: a\nSQL: SELECT 1 LIMIT 1;\n\n").unwrap();
        assert_eq!(load_few_shot(&p).unwrap(), "Q: a\nSQL: SELECT 1 LIMIT 1;");
    }
}
