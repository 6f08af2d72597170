//! Catalog extraction.
//!
//! Reads tables, columns and primary keys from a domain's
//! `information_schema`, foreign keys from `pg_constraint`, and assembles a [`DomainSchema`]. Table names are
//! schema-qualified (`public.customer`) so domains that spread tables over
//! several schemas stay unambiguous. Snapshots are written as pretty JSON to
//! `<schemas_dir>/<domain>.json` and can be read back for offline indexing.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::models::{ColumnInfo, DomainSchema, ForeignKey, TableSchema};

// `sql_identifier` columns are cast to text so they decode as `String`.
// An empty schema filter means every non-system schema.
const TABLES_SQL: &str = r#"
    SELECT table_schema::text AS table_schema, table_name::text AS table_name
    FROM information_schema.tables
    WHERE table_type = 'BASE TABLE'
      AND table_schema NOT IN ('pg_catalog', 'information_schema')
      AND (cardinality($1::text[]) = 0 OR table_schema = ANY($1))
    ORDER BY table_schema, table_name
"#;

const COLUMNS_SQL: &str = r#"
    SELECT table_schema::text AS table_schema, table_name::text AS table_name,
           column_name::text AS column_name, data_type::text AS data_type
    FROM information_schema.columns
    WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
      AND (cardinality($1::text[]) = 0 OR table_schema = ANY($1))
    ORDER BY table_schema, table_name, ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT tc.table_schema::text AS table_schema, tc.table_name::text AS table_name,
           kcu.column_name::text AS column_name
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name
     AND tc.table_schema = kcu.table_schema
    WHERE tc.constraint_type = 'PRIMARY KEY'
      AND tc.table_schema NOT IN ('pg_catalog', 'information_schema')
      AND (cardinality($1::text[]) = 0 OR tc.table_schema = ANY($1))
    ORDER BY tc.table_schema, tc.table_name, kcu.ordinal_position
"#;

// Read from pg_constraint so the referenced side may live in any schema.
// `conkey` and `confkey` are parallel arrays; unnesting them together pairs
// each column of a composite key with its own referenced column.
const FOREIGN_KEYS_SQL: &str = r#"
    SELECT ns.nspname::text AS table_schema, cl.relname::text AS table_name,
           a.attname::text AS column_name,
           fns.nspname::text AS ref_schema, fcl.relname::text AS ref_table,
           fa.attname::text AS ref_column
    FROM pg_constraint c
    CROSS JOIN LATERAL unnest(c.conkey, c.confkey) WITH ORDINALITY AS k(col, ref_col, pos)
    JOIN pg_class cl ON cl.oid = c.conrelid
    JOIN pg_namespace ns ON ns.oid = cl.relnamespace
    JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = k.col
    JOIN pg_class fcl ON fcl.oid = c.confrelid
    JOIN pg_namespace fns ON fns.oid = fcl.relnamespace
    JOIN pg_attribute fa ON fa.attrelid = c.confrelid AND fa.attnum = k.ref_col
    WHERE c.contype = 'f'
      AND ns.nspname NOT IN ('pg_catalog', 'information_schema')
      AND (cardinality($1::text[]) = 0 OR ns.nspname = ANY($1))
    ORDER BY ns.nspname, cl.relname, c.conname, k.pos
"#;

/// Flat catalog rows, before grouping into tables.
#[derive(Debug, Default)]
pub struct CatalogRows {
    /// `(schema, table)`
    pub tables: Vec<(String, String)>,
    /// `(schema, table, column, type)`
    pub columns: Vec<(String, String, String, String)>,
    /// `(schema, table, column)`
    pub primary_keys: Vec<(String, String, String)>,
    /// `(schema, table, column, ref_schema, ref_table, ref_column)`
    pub foreign_keys: Vec<(String, String, String, String, String, String)>,
}

/// Group flat catalog rows into per-table definitions.
///
/// Tables keep the order of `rows.tables`; columns, key columns and FKs for
/// tables that were not listed (views, filtered schemas) are dropped.
pub fn assemble(domain: &str, rows: CatalogRows) -> DomainSchema {
    let mut tables: BTreeMap<(String, String), TableSchema> = BTreeMap::new();
    let mut order = Vec::with_capacity(rows.tables.len());

    for (schema, table) in rows.tables {
        let key = (schema.clone(), table.clone());
        order.push(key.clone());
        tables.insert(
            key,
            TableSchema {
                table: format!("{}.{}", schema, table),
                columns: Vec::new(),
                primary_key: Vec::new(),
                foreign_keys: Vec::new(),
                description: String::new(),
            },
        );
    }

    for (schema, table, name, data_type) in rows.columns {
        if let Some(t) = tables.get_mut(&(schema, table)) {
            t.columns.push(ColumnInfo { name, data_type });
        }
    }
    for (schema, table, column) in rows.primary_keys {
        if let Some(t) = tables.get_mut(&(schema, table)) {
            t.primary_key.push(column);
        }
    }
    for (schema, table, column, ref_schema, ref_table, ref_column) in rows.foreign_keys {
        if let Some(t) = tables.get_mut(&(schema, table)) {
            t.foreign_keys.push(ForeignKey {
                column,
                ref_table: format!("{}.{}", ref_schema, ref_table),
                ref_column,
            });
        }
    }

    DomainSchema {
        domain: domain.to_string(),
        tables: order
            .into_iter()
            .filter_map(|key| tables.remove(&key))
            .collect(),
    }
}

/// Read the catalog of one domain over an open pool.
pub async fn extract_from_pool(
    pool: &PgPool,
    domain: &str,
    schemas: &[String],
) -> Result<DomainSchema> {
    let schemas = schemas.to_vec();
    let mut rows = CatalogRows::default();

    for row in sqlx::query(TABLES_SQL)
        .bind(&schemas)
        .fetch_all(pool)
        .await
        .context("Failed to list tables")?
    {
        rows.tables
            .push((row.try_get("table_schema")?, row.try_get("table_name")?));
    }

    for row in sqlx::query(COLUMNS_SQL)
        .bind(&schemas)
        .fetch_all(pool)
        .await
        .context("Failed to list columns")?
    {
        rows.columns.push((
            row.try_get("table_schema")?,
            row.try_get("table_name")?,
            row.try_get("column_name")?,
            row.try_get("data_type")?,
        ));
    }

    for row in sqlx::query(PRIMARY_KEYS_SQL)
        .bind(&schemas)
        .fetch_all(pool)
        .await
        .context("Failed to list primary keys")?
    {
        rows.primary_keys.push((
            row.try_get("table_schema")?,
            row.try_get("table_name")?,
            row.try_get("column_name")?,
        ));
    }

    for row in sqlx::query(FOREIGN_KEYS_SQL)
        .bind(&schemas)
        .fetch_all(pool)
        .await
        .context("Failed to list foreign keys")?
    {
        rows.foreign_keys.push((
            row.try_get("table_schema")?,
            row.try_get("table_name")?,
            row.try_get("column_name")?,
            row.try_get("ref_schema")?,
            row.try_get("ref_table")?,
            row.try_get("ref_column")?,
        ));
    }

    Ok(assemble(domain, rows))
}

/// Connect to a configured domain and extract its catalog.
pub async fn extract_domain(config: &Config, domain: &str) -> Result<DomainSchema> {
    let domain_config = config.domain(domain)?;
    let pool = db::connect_domain(config, domain)
        .await
        .with_context(|| format!("Failed to connect to domain '{}'", domain))?;
    let schema = extract_from_pool(&pool, domain, &domain_config.schemas).await;
    pool.close().await;
    schema
}

pub fn write_snapshot(path: &Path, schema: &DomainSchema) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(schema)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write snapshot: {}", path.display()))?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<DomainSchema> {
    let content = std::fs::read_to_string(path).with_context(|| {
        format!(
            "Failed to read schema snapshot: {} (run `nlsql extract` first)",
            path.display()
        )
    })?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid schema snapshot: {}", path.display()))
}

/// `nlsql extract`: extract each domain and write its snapshot.
pub async fn run_extract(config: &Config, domains: &[String]) -> Result<()> {
    for domain in domains {
        let schema = extract_domain(config, domain).await?;
        let path = config.snapshot_path(domain);
        write_snapshot(&path, &schema)?;
        println!(
            "Wrote {} with {} tables.",
            path.display(),
            schema.tables.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    #[test]
    fn test_assemble_groups_by_table() {
        let rows = CatalogRows {
            tables: vec![(s("public"), s("album")), (s("public"), s("artist"))],
            columns: vec![
                (s("public"), s("album"), s("album_id"), s("integer")),
                (s("public"), s("album"), s("artist_id"), s("integer")),
                (s("public"), s("artist"), s("name"), s("character varying")),
                (s("public"), s("some_view"), s("x"), s("integer")),
            ],
            primary_keys: vec![(s("public"), s("album"), s("album_id"))],
            foreign_keys: vec![(
                s("public"),
                s("album"),
                s("artist_id"),
                s("public"),
                s("artist"),
                s("artist_id"),
            )],
        };

        let schema = assemble("chinook", rows);
        assert_eq!(schema.domain, "chinook");
        assert_eq!(schema.tables.len(), 2);

        let album = &schema.tables[0];
        assert_eq!(album.table, "public.album");
        assert_eq!(album.columns.len(), 2);
        assert_eq!(album.primary_key, vec!["album_id"]);
        assert_eq!(album.foreign_keys[0].ref_table, "public.artist");

        let artist = &schema.tables[1];
        assert_eq!(artist.columns[0].data_type, "character varying");
        assert!(artist.primary_key.is_empty());
    }

    #[test]
    fn test_assemble_keeps_cross_schema_and_composite_fks() {
        let rows = CatalogRows {
            tables: vec![(s("sales"), s("order_line"))],
            foreign_keys: vec![
                (s("sales"), s("order_line"), s("product_id"), s("inventory"), s("product"), s("id")),
                (s("sales"), s("order_line"), s("order_id"), s("sales"), s("order_item"), s("order_id")),
                (s("sales"), s("order_line"), s("line_no"), s("sales"), s("order_item"), s("item_no")),
            ],
            ..Default::default()
        };

        let schema = assemble("shop", rows);
        let fks: Vec<(&str, &str, &str)> = schema.tables[0]
            .foreign_keys
            .iter()
            .map(|fk| (fk.column.as_str(), fk.ref_table.as_str(), fk.ref_column.as_str()))
            .collect();
        assert_eq!(
            fks,
            vec![
                ("product_id", "inventory.product", "id"),
                ("order_id", "sales.order_item", "order_id"),
                ("line_no", "sales.order_item", "item_no"),
            ]
        );
    }

    #[test]
    fn test_fk_query_pairs_key_columns_across_schemas() {
        assert!(FOREIGN_KEYS_SQL.contains("unnest(c.conkey, c.confkey)"));
        assert!(FOREIGN_KEYS_SQL.contains("fa.attnum = k.ref_col"));
        // Only the referencing side is schema-filtered.
        assert!(!FOREIGN_KEYS_SQL.contains("fns.nspname = ANY"));
    }

    #[test]
    fn test_snapshot_file_shape() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("schemas").join("chinook.json");
        let schema = assemble(
            "chinook",
            CatalogRows {
                tables: vec![(s("public"), s("genre"))],
                columns: vec![(s("public"), s("genre"), s("name"), s("text"))],
                ..Default::default()
            },
        );
        write_snapshot(&path, &schema).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["tables"][0]["table"], "public.genre");
        assert_eq!(raw["tables"][0]["columns"][0]["type"], "text");

        assert_eq!(read_snapshot(&path).unwrap(), schema);
    }

    #[test]
    fn test_missing_snapshot_mentions_extract() {
        let err = read_snapshot(Path::new("/nonexistent/none.json")).unwrap_err();
        assert!(err.to_string().contains("nlsql extract"));
    }
}
