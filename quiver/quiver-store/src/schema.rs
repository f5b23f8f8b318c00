//! Physical naming and schema management.
//!
//! Per-collection table names are deterministic functions of the collection
//! id and kind; the id is sanitized into a safe identifier fragment before it
//! ever reaches a statement.

use quiver_core::error::{QuiverError, Result};
use quiver_core::types::{CollectionInfo, CollectionKind};
use sqlx::PgPool;

use crate::pool::db_err;

/// Sanitize a collection id into an identifier fragment. Lowercases and maps
/// `-` to `_`; anything outside `[a-z0-9_]` is rejected.
pub fn sanitize_id(collection_id: &str) -> Result<String> {
    if collection_id.is_empty() {
        return Err(QuiverError::validation("collection id must not be empty"));
    }
    let sanitized: String = collection_id
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' { '_' } else { c })
        .collect();
    if !sanitized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(QuiverError::validation(format!(
            "collection id {collection_id:?} contains unsupported characters"
        )));
    }
    Ok(sanitized)
}

/// Name of a collection's objects table.
pub fn objects_table(prefix: &str, collection_id: &str, kind: CollectionKind) -> Result<String> {
    let id = sanitize_id(collection_id)?;
    Ok(format!("{prefix}_{id}_{}_objects", kind.table_suffix()))
}

/// Name of a collection's parts table.
pub fn parts_table(prefix: &str, collection_id: &str, kind: CollectionKind) -> Result<String> {
    let id = sanitize_id(collection_id)?;
    Ok(format!("{prefix}_{id}_{}_parts", kind.table_suffix()))
}

/// Both physical table names of a collection.
pub fn collection_tables(prefix: &str, info: &CollectionInfo) -> Result<(String, String)> {
    Ok((
        objects_table(prefix, &info.collection_id, info.kind)?,
        parts_table(prefix, &info.collection_id, info.kind)?,
    ))
}

/// Create the metadata tables and the pgvector extension if missing.
pub async fn ensure_schema(pool: &PgPool, prefix: &str) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await
        .map_err(|e| db_err("creating pgvector extension", e))?;

    let collections = format!(
        r#"CREATE TABLE IF NOT EXISTS {prefix}_collections (
            collection_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            plugin_name TEXT NOT NULL,
            dimensions INT NOT NULL,
            metric_type TEXT NOT NULL,
            aggregation_type TEXT NOT NULL,
            hnsw_m INT NOT NULL,
            hnsw_ef_construction INT NOT NULL,
            index_created BOOL NOT NULL DEFAULT false,
            applied_optimizations JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (collection_id, kind)
        )"#
    );
    sqlx::query(&collections)
        .execute(pool)
        .await
        .map_err(|e| db_err("creating collections table", e))?;

    let pointers = format!(
        r#"CREATE TABLE IF NOT EXISTS {prefix}_blue_pointers (
            namespace TEXT PRIMARY KEY,
            regular_id TEXT NOT NULL,
            query_id TEXT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )"#
    );
    sqlx::query(&pointers)
        .execute(pool)
        .await
        .map_err(|e| db_err("creating blue pointers table", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_ids() {
        assert_eq!(sanitize_id("Model-V2").unwrap(), "model_v2");
        assert!(sanitize_id("bad id").is_err());
        assert!(sanitize_id("").is_err());
        assert!(sanitize_id("drop table;--").is_err());
    }

    #[test]
    fn table_names_are_deterministic() {
        let objects = objects_table("quiver", "m1", CollectionKind::Regular).unwrap();
        assert_eq!(objects, "quiver_m1_regular_objects");

        let parts = parts_table("quiver", "m1", CollectionKind::CategoriesQuery).unwrap();
        assert_eq!(parts, "quiver_m1_cat_query_parts");
    }
}
