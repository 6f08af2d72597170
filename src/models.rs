//! Core data types that flow through extraction, indexing, retrieval and
//! execution.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One column of a catalog table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
}

/// A foreign key edge `column -> ref_table.ref_column`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub ref_table: String,
    pub ref_column: String,
}

/// Catalog metadata for a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Schema-qualified name (`public.customer`).
    #[serde(alias = "name", alias = "table_name")]
    pub table: String,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub description: String,
}

/// A domain's full catalog snapshot, as written by `nlsql extract`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    pub domain: String,
    pub tables: Vec<TableSchema>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Schema,
    Relationships,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Schema => "schema",
            ChunkKind::Relationships => "relationships",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schema" => Some(ChunkKind::Schema),
            "relationships" => Some(ChunkKind::Relationships),
            _ => None,
        }
    }
}

/// A unit of serialized schema metadata, tagged with its domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChunk {
    pub id: String,
    pub domain: String,
    pub kind: ChunkKind,
    pub table: Option<String>,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// A chunk returned from retrieval, with its similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub chunk: SchemaChunk,
    /// Cosine similarity to the question embedding.
    pub score: f64,
    /// True when the chunk was added by relationship pinning rather than
    /// similarity ranking.
    pub pinned: bool,
}

/// Tabular output of one SQL execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Set when rows were dropped to respect `postgres.max_rows`.
    #[serde(default)]
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The single value of a 1×1 result.
    pub fn scalar(&self) -> Option<&Value> {
        if self.columns.len() == 1 && self.rows.len() == 1 {
            self.rows[0].first()
        } else {
            None
        }
    }

    /// Render as RFC 4180 CSV with a header row.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(cell_text))?;
        }
        let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Render as a fixed-width text table for terminal output.
    pub fn render_table(&self) -> String {
        let cells: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                if let Some(w) = widths.get_mut(i) {
                    *w = (*w).max(cell.chars().count().min(MAX_CELL_WIDTH));
                }
            }
        }

        let mut out = String::new();
        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{:<width$}", c, width = *w))
            .collect();
        out.push_str(header.join(" | ").trim_end());
        out.push('\n');
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&rule.join("-+-"));
        out.push('\n');
        for row in &cells {
            let line: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", truncate_cell(c), width = *w))
                .collect();
            out.push_str(line.join(" | ").trim_end());
            out.push('\n');
        }
        out
    }
}

const MAX_CELL_WIDTH: usize = 40;

fn truncate_cell(s: &str) -> String {
    if s.chars().count() > MAX_CELL_WIDTH {
        let mut t: String = s.chars().take(MAX_CELL_WIDTH - 3).collect();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Plain-text form of a JSON cell: strings unquoted, null empty.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
