//! Schema chunker.
//!
//! Turns a [`DomainSchema`] into [`SchemaChunk`]s: one chunk per table
//! (columns, primary key, outgoing foreign keys) plus one domain-wide
//! relationship chunk listing every foreign-key edge as a join map.
//!
//! Chunk IDs are deterministic (`<domain>::table::<table>` and
//! `<domain>::relationships`) so a reindex overwrites rather than
//! duplicates. Each chunk carries a SHA-256 of its text.

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::models::{ChunkKind, DomainSchema, SchemaChunk, TableSchema};

/// Build all chunks for a domain: tables first, relationship map last.
pub fn chunk_schema(schema: &DomainSchema) -> Vec<SchemaChunk> {
    let mut chunks: Vec<SchemaChunk> = schema
        .tables
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let table = if t.table.trim().is_empty() {
                format!("table_{}", i)
            } else {
                t.table.clone()
            };
            make_chunk(
                format!("{}::table::{}", schema.domain, table),
                &schema.domain,
                ChunkKind::Schema,
                Some(table),
                &table_to_text(t),
            )
        })
        .collect();

    chunks.push(relationship_chunk(schema));
    chunks
}

/// Render one table definition.
pub fn table_to_text(t: &TableSchema) -> String {
    let mut lines = vec![format!("TABLE: {}", t.table)];

    let desc = t.description.trim();
    if !desc.is_empty() {
        lines.push(format!("DESCRIPTION: {}", desc));
    }

    lines.push("COLUMNS:".to_string());
    if t.columns.is_empty() {
        lines.push("- (none found)".to_string());
    }
    for c in &t.columns {
        if c.data_type.is_empty() {
            lines.push(format!("- {}", c.name));
        } else {
            lines.push(format!("- {} ({})", c.name, c.data_type));
        }
    }

    if !t.primary_key.is_empty() {
        lines.push(format!("PRIMARY KEY: {}", t.primary_key.join(", ")));
    }

    if !t.foreign_keys.is_empty() {
        lines.push("FOREIGN KEYS:".to_string());
        for fk in &t.foreign_keys {
            lines.push(format!("- {} -> {}.{}", fk.column, fk.ref_table, fk.ref_column));
        }
    }

    lines.join("\n")
}

/// Build the join-map chunk: every FK edge, sorted and deduplicated.
pub fn relationship_chunk(schema: &DomainSchema) -> SchemaChunk {
    let edges: BTreeSet<String> = schema
        .tables
        .iter()
        .flat_map(|t| {
            t.foreign_keys.iter().filter_map(move |fk| {
                if t.table.is_empty()
                    || fk.column.is_empty()
                    || fk.ref_table.is_empty()
                    || fk.ref_column.is_empty()
                {
                    return None;
                }
                Some(format!(
                    "{}.{} -> {}.{}",
                    t.table, fk.column, fk.ref_table, fk.ref_column
                ))
            })
        })
        .collect();

    let mut text = String::from("RELATIONSHIPS (Foreign Keys / Join Map)\n");
    text.push_str(&format!("Domain: {}\n\n", schema.domain));
    if edges.is_empty() {
        text.push_str("(no foreign keys found)");
    } else {
        let lines: Vec<String> = edges.iter().map(|e| format!("- {}", e)).collect();
        text.push_str(&lines.join("\n"));
    }

    make_chunk(
        relationship_chunk_id(&schema.domain),
        &schema.domain,
        ChunkKind::Relationships,
        None,
        &text,
    )
}

pub fn relationship_chunk_id(domain: &str) -> String {
    format!("{}::relationships", domain)
}

fn make_chunk(
    id: String,
    domain: &str,
    kind: ChunkKind,
    table: Option<String>,
    text: &str,
) -> SchemaChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    SchemaChunk {
        id,
        domain: domain.to_string(),
        kind,
        table,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnInfo, ForeignKey};

    fn col(name: &str, ty: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            data_type: ty.into(),
        }
    }

    fn sample_schema() -> DomainSchema {
        DomainSchema {
            domain: "chinook".into(),
            tables: vec![
                TableSchema {
                    table: "public.customer".into(),
                    columns: vec![col("customer_id", "integer"), col("first_name", "")],
                    primary_key: vec!["customer_id".into()],
                    foreign_keys: vec![ForeignKey {
                        column: "support_rep_id".into(),
                        ref_table: "public.employee".into(),
                        ref_column: "employee_id".into(),
                    }],
                    description: String::new(),
                },
                TableSchema {
                    table: "public.invoice".into(),
                    columns: vec![col("invoice_id", "integer")],
                    primary_key: vec![],
                    foreign_keys: vec![ForeignKey {
                        column: "customer_id".into(),
                        ref_table: "public.customer".into(),
                        ref_column: "customer_id".into(),
                    }],
                    description: "Sales headers".into(),
                },
            ],
        }
    }

    #[test]
    fn test_one_chunk_per_table_plus_relationships() {
        let chunks = chunk_schema(&sample_schema());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].id, "chinook::table::public.customer");
        assert_eq!(chunks[0].kind, ChunkKind::Schema);
        assert_eq!(chunks[2].id, "chinook::relationships");
        assert_eq!(chunks[2].kind, ChunkKind::Relationships);
        assert!(chunks.iter().all(|c| c.domain == "chinook"));
    }

    #[test]
    fn test_table_text_layout() {
        let text = table_to_text(&sample_schema().tables[0]);
        assert_eq!(
            text,
            "TABLE: public.customer\nCOLUMNS:\n- customer_id (integer)\n- first_name\n\
             PRIMARY KEY: customer_id\nFOREIGN KEYS:\n- support_rep_id -> public.employee.employee_id"
        );
    }

    #[test]
    fn test_description_included() {
        let text = table_to_text(&sample_schema().tables[1]);
        assert!(text.contains("DESCRIPTION: Sales headers"));
        assert!(!text.contains("PRIMARY KEY"));
    }

    #[test]
    fn test_relationship_edges_sorted() {
        let rel = relationship_chunk(&sample_schema());
        let edges: Vec<&str> = rel.text.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(
            edges,
            vec![
                "- public.customer.support_rep_id -> public.employee.employee_id",
                "- public.invoice.customer_id -> public.customer.customer_id",
            ]
        );
    }

    #[test]
    fn test_no_foreign_keys() {
        let schema = DomainSchema {
            domain: "empty".into(),
            tables: vec![],
        };
        let rel = relationship_chunk(&schema);
        assert!(rel.text.ends_with("(no foreign keys found)"));
    }

    #[test]
    fn test_deterministic_hashes() {
        let a = chunk_schema(&sample_schema());
        let b = chunk_schema(&sample_schema());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.hash, y.hash);
        }
        assert_ne!(a[0].hash, a[1].hash);
    }
}
