//! Postgres-backed collection metadata store.

use async_trait::async_trait;
use chrono::Utc;
use quiver_core::error::{QuiverError, Result};
use quiver_core::traits::{BluePair, CollectionMetadataStore};
use quiver_core::types::{
    AggregationType, CollectionInfo, CollectionKind, CollectionNamespace, EmbeddingModelInfo,
    HnswParams, MetricType, WorkState,
};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::debug;

use crate::pool::{db_err, is_unique_violation};

/// Collection metadata persisted in two tables: one row per collection and a
/// one-row-per-namespace blue pointer.
pub struct PgMetadataStore {
    pool: PgPool,
    prefix: String,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn collections_table(&self) -> String {
        format!("{}_collections", self.prefix)
    }

    fn pointers_table(&self) -> String {
        format!("{}_blue_pointers", self.prefix)
    }

    fn row_to_info(row: &sqlx::postgres::PgRow) -> Result<CollectionInfo> {
        let metric: String = row.try_get("metric_type").map_err(decode_err)?;
        let aggregation: String = row.try_get("aggregation_type").map_err(decode_err)?;
        let kind: String = row.try_get("kind").map_err(decode_err)?;
        let optimizations: serde_json::Value =
            row.try_get("applied_optimizations").map_err(decode_err)?;

        Ok(CollectionInfo {
            collection_id: row.try_get("collection_id").map_err(decode_err)?,
            model: EmbeddingModelInfo {
                embedding_model_id: row.try_get("collection_id").map_err(decode_err)?,
                plugin_name: row.try_get("plugin_name").map_err(decode_err)?,
                dimensions: row.try_get::<i32, _>("dimensions").map_err(decode_err)? as usize,
                metric_type: parse_metric(&metric)?,
                aggregation_type: parse_aggregation(&aggregation)?,
                hnsw: HnswParams {
                    m: row.try_get::<i32, _>("hnsw_m").map_err(decode_err)? as u32,
                    ef_construction: row
                        .try_get::<i32, _>("hnsw_ef_construction")
                        .map_err(decode_err)? as u32,
                },
            },
            kind: parse_kind(&kind)?,
            index_created: row.try_get("index_created").map_err(decode_err)?,
            // Derived by the cache from the blue pointer.
            work_state: WorkState::Green,
            applied_optimizations: serde_json::from_value(optimizations)?,
            created_at: row.try_get("created_at").map_err(decode_err)?,
            updated_at: row.try_get("updated_at").map_err(decode_err)?,
        })
    }
}

fn decode_err(e: sqlx::Error) -> QuiverError {
    QuiverError::database(format!("decoding collection row: {e}"))
}

fn parse_metric(s: &str) -> Result<MetricType> {
    match s {
        "COSINE" => Ok(MetricType::Cosine),
        "DOT" => Ok(MetricType::Dot),
        "EUCLID" => Ok(MetricType::Euclid),
        other => Err(QuiverError::database(format!("unknown metric type: {other}"))),
    }
}

fn parse_aggregation(s: &str) -> Result<AggregationType> {
    match s {
        "AVG" => Ok(AggregationType::Avg),
        "MIN" => Ok(AggregationType::Min),
        other => Err(QuiverError::database(format!(
            "unknown aggregation type: {other}"
        ))),
    }
}

fn parse_kind(s: &str) -> Result<CollectionKind> {
    match s {
        "REGULAR" => Ok(CollectionKind::Regular),
        "QUERY" => Ok(CollectionKind::Query),
        "CATEGORIES_REGULAR" => Ok(CollectionKind::CategoriesRegular),
        "CATEGORIES_QUERY" => Ok(CollectionKind::CategoriesQuery),
        other => Err(QuiverError::database(format!("unknown kind: {other}"))),
    }
}

fn metric_str(m: MetricType) -> &'static str {
    match m {
        MetricType::Cosine => "COSINE",
        MetricType::Dot => "DOT",
        MetricType::Euclid => "EUCLID",
    }
}

fn aggregation_str(a: AggregationType) -> &'static str {
    match a {
        AggregationType::Avg => "AVG",
        AggregationType::Min => "MIN",
    }
}

#[async_trait]
impl CollectionMetadataStore for PgMetadataStore {
    async fn load_all(
        &self,
    ) -> Result<(Vec<CollectionInfo>, HashMap<CollectionNamespace, BluePair>)> {
        let sql = format!("SELECT * FROM {}", self.collections_table());
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("loading collections", e))?;

        let mut collections = Vec::with_capacity(rows.len());
        for row in &rows {
            collections.push(Self::row_to_info(row)?);
        }

        let sql = format!(
            "SELECT namespace, regular_id, query_id FROM {}",
            self.pointers_table()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("loading blue pointers", e))?;

        let mut blues = HashMap::new();
        for row in &rows {
            let namespace: String = row.try_get("namespace").map_err(decode_err)?;
            let namespace = match namespace.as_str() {
                "primary" => CollectionNamespace::Primary,
                "categories" => CollectionNamespace::Categories,
                other => {
                    return Err(QuiverError::database(format!("unknown namespace: {other}")));
                }
            };
            blues.insert(
                namespace,
                BluePair {
                    regular_id: row.try_get("regular_id").map_err(decode_err)?,
                    query_id: row.try_get("query_id").map_err(decode_err)?,
                },
            );
        }

        debug!(
            collections = collections.len(),
            pointers = blues.len(),
            "Loaded collection metadata"
        );
        Ok((collections, blues))
    }

    async fn insert(&self, info: &CollectionInfo) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO {} (collection_id, kind, plugin_name, dimensions, metric_type,
                aggregation_type, hnsw_m, hnsw_ef_construction, index_created,
                applied_optimizations, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
            self.collections_table()
        );
        let result = sqlx::query(&sql)
            .bind(&info.collection_id)
            .bind(info.kind.as_str())
            .bind(&info.model.plugin_name)
            .bind(info.model.dimensions as i32)
            .bind(metric_str(info.model.metric_type))
            .bind(aggregation_str(info.model.aggregation_type))
            .bind(info.model.hnsw.m as i32)
            .bind(info.model.hnsw.ef_construction as i32)
            .bind(info.index_created)
            .bind(serde_json::to_value(&info.applied_optimizations)?)
            .bind(info.created_at)
            .bind(info.updated_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(QuiverError::conflict(format!(
                "collection {} ({}) already exists",
                info.collection_id,
                info.kind.as_str()
            ))),
            Err(e) => Err(db_err("inserting collection", e)),
        }
    }

    async fn update(&self, info: &CollectionInfo) -> Result<()> {
        let sql = format!(
            r#"UPDATE {} SET index_created = $3, applied_optimizations = $4, updated_at = $5
            WHERE collection_id = $1 AND kind = $2"#,
            self.collections_table()
        );
        let result = sqlx::query(&sql)
            .bind(&info.collection_id)
            .bind(info.kind.as_str())
            .bind(info.index_created)
            .bind(serde_json::to_value(&info.applied_optimizations)?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("updating collection", e))?;

        if result.rows_affected() == 0 {
            return Err(QuiverError::not_found("collection", &info.collection_id));
        }
        Ok(())
    }

    async fn delete(&self, collection_id: &str, kind: CollectionKind) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE collection_id = $1 AND kind = $2",
            self.collections_table()
        );
        let result = sqlx::query(&sql)
            .bind(collection_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("deleting collection", e))?;

        if result.rows_affected() == 0 {
            return Err(QuiverError::not_found("collection", collection_id));
        }
        Ok(())
    }

    async fn set_blue(
        &self,
        namespace: CollectionNamespace,
        regular_id: &str,
        query_id: &str,
    ) -> Result<()> {
        let sql = format!(
            r#"INSERT INTO {} (namespace, regular_id, query_id, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (namespace)
            DO UPDATE SET regular_id = $2, query_id = $3, updated_at = $4"#,
            self.pointers_table()
        );
        sqlx::query(&sql)
            .bind(namespace.as_str())
            .bind(regular_id)
            .bind(query_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("setting blue pointer", e))?;
        Ok(())
    }
}
