//! Postgres + pgvector implementation of the vector store driver.
//!
//! Each collection owns two tables: objects (payload and system columns) and
//! parts (one pgvector row per embedding). ANN search joins the two, applies
//! the payload filter and personalization shadowing in SQL, and aggregates
//! per-part distances into object-level distances.

use async_trait::async_trait;
use quiver_core::error::{QuiverError, Result};
use quiver_core::filter::PayloadFilter;
use quiver_core::traits::{LockScope, VectorStore};
use quiver_core::types::{
    AggregationType, CollectionInfo, MetricType, Object, ObjectPart, SearchHit, SimilarityQuery,
    SortBy, SortOrder,
};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::filter_sql::{self, BindValue};
use crate::pool::db_err;
use crate::schema;

/// Named post-hoc optimizations applicable to a collection's tables.
pub const OPTIMIZATIONS: &[&str] = &["payload_gin", "user_id_index", "analyze"];

/// pgvector-backed vector store.
pub struct PgVectorStore {
    pool: PgPool,
    prefix: String,
}

impl PgVectorStore {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn tables(&self, collection: &CollectionInfo) -> Result<(String, String)> {
        schema::collection_tables(&self.prefix, collection)
    }

    /// Fetch objects matching an arbitrary WHERE clause over the objects
    /// table, with parts attached.
    async fn fetch_objects(
        &self,
        collection: &CollectionInfo,
        where_clause: &str,
        ids: &[String],
    ) -> Result<Vec<Object>> {
        let (objects, parts) = self.tables(collection)?;

        let sql = format!(
            "SELECT object_id, payload, storage_meta, original_id, user_id, session_id \
             FROM {objects} o WHERE {where_clause} ORDER BY object_id"
        );
        let rows = sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("fetching objects", e))?;

        let mut result: Vec<Object> = rows.iter().map(row_to_object).collect::<Result<_>>()?;
        if result.is_empty() {
            return Ok(result);
        }

        let found_ids: Vec<String> = result.iter().map(|o| o.object_id.clone()).collect();
        let sql = format!(
            "SELECT part_id, object_id, vector::text AS vector, is_average \
             FROM {parts} WHERE object_id = ANY($1) ORDER BY part_id"
        );
        let part_rows = sqlx::query(&sql)
            .bind(&found_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("fetching parts", e))?;

        let mut by_object: HashMap<String, Vec<ObjectPart>> = HashMap::new();
        for row in &part_rows {
            let object_id: String = row.try_get("object_id").map_err(row_err)?;
            by_object
                .entry(object_id)
                .or_default()
                .push(row_to_part(row)?);
        }
        for object in &mut result {
            object.parts = by_object.remove(&object.object_id).unwrap_or_default();
        }
        Ok(result)
    }

    async fn write_object(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        tables: &(String, String),
        object: &Object,
        shrink_parts: bool,
    ) -> Result<()> {
        let (objects, parts) = tables;

        let sql = format!(
            r#"INSERT INTO {objects}
                (object_id, payload, storage_meta, original_id, user_id, session_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (object_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                storage_meta = EXCLUDED.storage_meta,
                original_id = EXCLUDED.original_id,
                user_id = EXCLUDED.user_id,
                session_id = EXCLUDED.session_id"#
        );
        sqlx::query(&sql)
            .bind(&object.object_id)
            .bind(&object.payload)
            .bind(&object.storage_meta)
            .bind(&object.original_id)
            .bind(&object.user_id)
            .bind(&object.session_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("upserting object", e))?;

        if shrink_parts {
            let sql = format!("DELETE FROM {parts} WHERE object_id = $1");
            sqlx::query(&sql)
                .bind(&object.object_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_err("shrinking parts", e))?;
        }

        for part in &object.parts {
            let sql = format!(
                r#"INSERT INTO {parts} (part_id, object_id, vector, is_average, user_id)
                VALUES ($1, $2, $3::vector, $4, $5)
                ON CONFLICT (part_id) DO UPDATE SET
                    object_id = EXCLUDED.object_id,
                    vector = EXCLUDED.vector,
                    is_average = EXCLUDED.is_average,
                    user_id = EXCLUDED.user_id"#
            );
            sqlx::query(&sql)
                .bind(&part.part_id)
                .bind(&object.object_id)
                .bind(vector_literal(&part.vector))
                .bind(part.is_average)
                .bind(&object.user_id)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_err("upserting part", e))?;
        }
        Ok(())
    }

    /// Lock the rows of the given objects in stable order, within `tx`.
    async fn lock_rows(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        objects_table: &str,
        ids: &[String],
    ) -> Result<()> {
        let sql = format!(
            "SELECT object_id FROM {objects_table} \
             WHERE object_id = ANY($1) ORDER BY object_id FOR UPDATE"
        );
        sqlx::query(&sql)
            .bind(ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| db_err("locking object rows", e))?;
        Ok(())
    }

    fn validate_batch(collection: &CollectionInfo, objects: &[Object]) -> Result<()> {
        for object in objects {
            object.validate_dimensions(collection.model.dimensions)?;
        }
        Ok(())
    }
}

fn row_err(e: sqlx::Error) -> QuiverError {
    QuiverError::database(format!("decoding row: {e}"))
}

fn row_to_object(row: &PgRow) -> Result<Object> {
    Ok(Object {
        object_id: row.try_get("object_id").map_err(row_err)?,
        original_id: row.try_get("original_id").map_err(row_err)?,
        user_id: row.try_get("user_id").map_err(row_err)?,
        session_id: row.try_get("session_id").map_err(row_err)?,
        payload: row.try_get("payload").map_err(row_err)?,
        storage_meta: row.try_get("storage_meta").map_err(row_err)?,
        parts: Vec::new(),
    })
}

fn row_to_part(row: &PgRow) -> Result<ObjectPart> {
    let literal: String = row.try_get("vector").map_err(row_err)?;
    Ok(ObjectPart {
        part_id: row.try_get("part_id").map_err(row_err)?,
        vector: parse_vector(&literal)?,
        is_average: row.try_get("is_average").map_err(row_err)?,
    })
}

/// Render a vector as a pgvector text literal.
pub fn vector_literal(vector: &[f32]) -> String {
    let mut literal = String::with_capacity(vector.len() * 8 + 2);
    literal.push('[');
    for (i, value) in vector.iter().enumerate() {
        if i > 0 {
            literal.push(',');
        }
        literal.push_str(&value.to_string());
    }
    literal.push(']');
    literal
}

/// Parse a pgvector text literal back into a vector.
pub fn parse_vector(literal: &str) -> Result<Vec<f32>> {
    let inner = literal
        .trim()
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| QuiverError::database(format!("malformed vector literal: {literal:?}")))?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|e| QuiverError::database(format!("malformed vector element: {e}")))
        })
        .collect()
}

fn distance_operator(metric: MetricType) -> &'static str {
    match metric {
        MetricType::Cosine => "<=>",
        MetricType::Dot => "<#>",
        MetricType::Euclid => "<->",
    }
}

fn aggregate_fn(aggregation: AggregationType) -> &'static str {
    match aggregation {
        AggregationType::Avg => "AVG",
        AggregationType::Min => "MIN",
    }
}

fn index_opclass(metric: MetricType) -> &'static str {
    match metric {
        MetricType::Cosine => "vector_cosine_ops",
        MetricType::Dot => "vector_ip_ops",
        MetricType::Euclid => "vector_l2_ops",
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    binds: &'q [BindValue],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            BindValue::Text(v) => query.bind(v),
            BindValue::TextArray(v) => query.bind(v),
            BindValue::Json(v) => query.bind(v),
            BindValue::Float(v) => query.bind(*v),
            BindValue::Int(v) => query.bind(*v),
        };
    }
    query
}

struct PgLockScope {
    tx: Option<Transaction<'static, Postgres>>,
}

#[async_trait]
impl LockScope for PgLockScope {
    async fn release(mut self: Box<Self>) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| db_err("releasing object locks", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn create_collection(&self, collection: &CollectionInfo) -> Result<()> {
        let (objects, parts) = self.tables(collection)?;
        info!(collection_id = %collection.collection_id, kind = collection.kind.as_str(),
            "Creating collection tables");

        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {objects} (
                object_id TEXT PRIMARY KEY,
                payload JSONB NOT NULL DEFAULT 'null',
                storage_meta JSONB NOT NULL DEFAULT 'null',
                original_id TEXT,
                user_id TEXT,
                session_id TEXT
            )"#
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating objects table", e))?;

        let sql = format!(
            r#"CREATE TABLE IF NOT EXISTS {parts} (
                part_id TEXT PRIMARY KEY,
                object_id TEXT NOT NULL REFERENCES {objects} (object_id) ON DELETE CASCADE,
                vector vector({dim}) NOT NULL,
                is_average BOOL NOT NULL DEFAULT false,
                user_id TEXT
            )"#,
            dim = collection.model.dimensions
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating parts table", e))?;

        for sql in [
            format!("CREATE INDEX IF NOT EXISTS {parts}_object_idx ON {parts} (object_id)"),
            format!("CREATE INDEX IF NOT EXISTS {objects}_original_idx ON {objects} (original_id)"),
            format!("CREATE INDEX IF NOT EXISTS {objects}_session_idx ON {objects} (session_id)"),
        ] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("creating support index", e))?;
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &CollectionInfo) -> Result<()> {
        let (objects, parts) = self.tables(collection)?;
        info!(collection_id = %collection.collection_id, kind = collection.kind.as_str(),
            "Dropping collection tables");

        for sql in [
            format!("DROP TABLE IF EXISTS {parts}"),
            format!("DROP TABLE IF EXISTS {objects}"),
        ] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("dropping collection tables", e))?;
        }
        Ok(())
    }

    async fn insert(&self, collection: &CollectionInfo, objects: &[Object]) -> Result<()> {
        Self::validate_batch(collection, objects)?;
        let tables = self.tables(collection)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("opening insert transaction", e))?;

        for object in objects {
            let sql = format!(
                r#"INSERT INTO {}
                    (object_id, payload, storage_meta, original_id, user_id, session_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (object_id) DO NOTHING"#,
                tables.0
            );
            let result = sqlx::query(&sql)
                .bind(&object.object_id)
                .bind(&object.payload)
                .bind(&object.storage_meta)
                .bind(&object.original_id)
                .bind(&object.user_id)
                .bind(&object.session_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_err("inserting object", e))?;

            // An existing object id counts as success; parts stay untouched.
            if result.rows_affected() == 0 {
                debug!(object_id = %object.object_id, "Insert skipped existing object");
                continue;
            }

            for part in &object.parts {
                let sql = format!(
                    r#"INSERT INTO {} (part_id, object_id, vector, is_average, user_id)
                    VALUES ($1, $2, $3::vector, $4, $5)
                    ON CONFLICT (part_id) DO NOTHING"#,
                    tables.1
                );
                sqlx::query(&sql)
                    .bind(&part.part_id)
                    .bind(&object.object_id)
                    .bind(vector_literal(&part.vector))
                    .bind(part.is_average)
                    .bind(&object.user_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| db_err("inserting part", e))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| db_err("committing insert", e))?;
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &CollectionInfo,
        objects: &[Object],
        shrink_parts: bool,
    ) -> Result<()> {
        Self::validate_batch(collection, objects)?;
        let tables = self.tables(collection)?;
        let mut ids: Vec<String> = objects.iter().map(|o| o.object_id.clone()).collect();
        ids.sort();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("opening upsert transaction", e))?;
        self.lock_rows(&mut tx, &tables.0, &ids).await?;

        for object in objects {
            self.write_object(&mut tx, &tables, object, shrink_parts)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_err("committing upsert", e))?;
        Ok(())
    }

    async fn delete(
        &self,
        collection: &CollectionInfo,
        object_ids: &[String],
    ) -> Result<Vec<String>> {
        let (objects, _) = self.tables(collection)?;
        let mut ids = object_ids.to_vec();
        ids.sort();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("opening delete transaction", e))?;
        self.lock_rows(&mut tx, &objects, &ids).await?;

        let sql = format!("DELETE FROM {objects} WHERE object_id = ANY($1) RETURNING object_id");
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| db_err("deleting objects", e))?;

        tx.commit()
            .await
            .map_err(|e| db_err("committing delete", e))?;

        rows.iter()
            .map(|row| row.try_get("object_id").map_err(row_err))
            .collect()
    }

    async fn find_by_ids(
        &self,
        collection: &CollectionInfo,
        ids: &[String],
    ) -> Result<Vec<Object>> {
        self.fetch_objects(collection, "object_id = ANY($1)", ids)
            .await
    }

    async fn find_by_original_ids(
        &self,
        collection: &CollectionInfo,
        original_ids: &[String],
    ) -> Result<Vec<Object>> {
        self.fetch_objects(collection, "original_id = ANY($1)", original_ids)
            .await
    }

    async fn find_similar(
        &self,
        collection: &CollectionInfo,
        query: &SimilarityQuery,
    ) -> Result<Vec<SearchHit>> {
        if query.vector.len() != collection.model.dimensions {
            return Err(QuiverError::validation(format!(
                "query vector has dimension {}, expected {}",
                query.vector.len(),
                collection.model.dimensions
            )));
        }

        let (objects, parts) = self.tables(collection)?;
        let op = distance_operator(collection.model.metric_type);
        let agg = aggregate_fn(collection.model.aggregation_type);

        let mut binds = vec![BindValue::Text(vector_literal(&query.vector))];
        let mut next = 2usize;
        let distance_expr = format!("{agg}(p.vector {op} $1::vector)");

        let shadow = match &query.user_id {
            None => "o.user_id IS NULL".to_owned(),
            Some(user_id) => {
                let user = format!("${next}");
                next += 1;
                binds.push(BindValue::Text(user_id.clone()));
                format!(
                    "(o.user_id = {user} OR (o.user_id IS NULL AND NOT EXISTS (\
                     SELECT 1 FROM {objects} c \
                     WHERE c.original_id = o.object_id AND c.user_id = {user})))"
                )
            }
        };

        let filter_sql = match &query.filter {
            Some(filter) => {
                let compiled = filter_sql::compile(filter, next)?;
                next += compiled.binds.len();
                binds.extend(compiled.binds);
                format!(" AND {}", compiled.sql)
            }
            None => String::new(),
        };

        let having = match query.max_distance {
            Some(max_distance) => {
                let bound = format!("${next}");
                next += 1;
                binds.push(BindValue::Float(max_distance as f64));
                format!(" HAVING {distance_expr} <= {bound}")
            }
            None => String::new(),
        };

        let order = match (&query.sort_by, query.similarity_first) {
            (Some(sort_by), false) => {
                let field = format!("${next}");
                next += 1;
                binds.push(BindValue::Text(sort_by.field.clone()));
                let direction = match sort_by.order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("o.payload -> {field} {direction} NULLS LAST, distance ASC, o.object_id ASC")
            }
            _ => "distance ASC, o.object_id ASC".to_owned(),
        };

        let limit = format!("${next}");
        binds.push(BindValue::Int(query.limit as i64));
        let offset = format!("${}", next + 1);
        binds.push(BindValue::Int(query.offset as i64));

        let sql = format!(
            "SELECT o.object_id, o.payload, o.storage_meta, o.original_id, o.user_id, \
                    ({distance_expr})::float4 AS distance \
             FROM {objects} o \
             JOIN {parts} p ON p.object_id = o.object_id \
             WHERE {shadow}{filter_sql} \
             GROUP BY o.object_id, o.payload, o.storage_meta, o.original_id, o.user_id\
             {having} \
             ORDER BY {order} \
             LIMIT {limit} OFFSET {offset}"
        );

        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("similarity search", e))?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            hits.push(SearchHit {
                object_id: row.try_get("object_id").map_err(row_err)?,
                distance: row.try_get("distance").map_err(row_err)?,
                payload: row.try_get("payload").map_err(row_err)?,
                storage_meta: row.try_get("storage_meta").map_err(row_err)?,
                original_id: row.try_get("original_id").map_err(row_err)?,
                user_id: row.try_get("user_id").map_err(row_err)?,
                parts: Vec::new(),
            });
        }

        if query.with_vectors && !hits.is_empty() {
            let ids: Vec<String> = hits.iter().map(|h| h.object_id.clone()).collect();
            let sql = format!(
                "SELECT part_id, object_id, vector::text AS vector, is_average \
                 FROM {parts} WHERE object_id = ANY($1) ORDER BY part_id"
            );
            let part_rows = sqlx::query(&sql)
                .bind(&ids)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("fetching hit vectors", e))?;

            let mut by_object: HashMap<String, Vec<ObjectPart>> = HashMap::new();
            for row in &part_rows {
                let object_id: String = row.try_get("object_id").map_err(row_err)?;
                by_object
                    .entry(object_id)
                    .or_default()
                    .push(row_to_part(row)?);
            }
            for hit in &mut hits {
                hit.parts = by_object.remove(&hit.object_id).unwrap_or_default();
            }
        }

        Ok(hits)
    }

    async fn find_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
        limit: usize,
        offset: usize,
        sort_by: Option<&SortBy>,
    ) -> Result<Vec<SearchHit>> {
        let (objects, _) = self.tables(collection)?;

        let compiled = filter_sql::compile(filter, 1)?;
        let mut binds = compiled.binds;
        let mut next = binds.len() + 1;

        let order = match sort_by {
            Some(sort_by) => {
                let field = format!("${next}");
                next += 1;
                binds.push(BindValue::Text(sort_by.field.clone()));
                let direction = match sort_by.order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                format!("o.payload -> {field} {direction} NULLS LAST, o.object_id ASC")
            }
            None => "o.object_id ASC".to_owned(),
        };

        let limit_ph = format!("${next}");
        binds.push(BindValue::Int(limit as i64));
        let offset_ph = format!("${}", next + 1);
        binds.push(BindValue::Int(offset as i64));

        let sql = format!(
            "SELECT o.object_id, o.payload, o.storage_meta, o.original_id, o.user_id \
             FROM {objects} o WHERE {} ORDER BY {order} LIMIT {limit_ph} OFFSET {offset_ph}",
            compiled.sql
        );

        let rows = bind_all(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("payload search", e))?;

        rows.iter()
            .map(|row| {
                Ok(SearchHit {
                    object_id: row.try_get("object_id").map_err(row_err)?,
                    distance: 0.0,
                    payload: row.try_get("payload").map_err(row_err)?,
                    storage_meta: row.try_get("storage_meta").map_err(row_err)?,
                    original_id: row.try_get("original_id").map_err(row_err)?,
                    user_id: row.try_get("user_id").map_err(row_err)?,
                    parts: Vec::new(),
                })
            })
            .collect()
    }

    async fn count_by_payload_filter(
        &self,
        collection: &CollectionInfo,
        filter: &PayloadFilter,
    ) -> Result<u64> {
        let (objects, _) = self.tables(collection)?;
        let compiled = filter_sql::compile(filter, 1)?;

        let sql = format!("SELECT COUNT(*) AS total FROM {objects} o WHERE {}", compiled.sql);
        let row = bind_all(sqlx::query(&sql), &compiled.binds)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("payload count", e))?;

        let total: i64 = row.try_get("total").map_err(row_err)?;
        Ok(total as u64)
    }

    async fn create_index(&self, collection: &CollectionInfo) -> Result<()> {
        let (_, parts) = self.tables(collection)?;
        let opclass = index_opclass(collection.model.metric_type);
        let hnsw = collection.model.hnsw;

        info!(collection_id = %collection.collection_id, kind = collection.kind.as_str(),
            m = hnsw.m, ef_construction = hnsw.ef_construction, "Building HNSW index");

        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {parts}_hnsw ON {parts} \
             USING hnsw (vector {opclass}) \
             WITH (m = {}, ef_construction = {})",
            hnsw.m, hnsw.ef_construction
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating HNSW index", e))?;
        Ok(())
    }

    async fn apply_optimization(&self, collection: &CollectionInfo, name: &str) -> Result<()> {
        let (objects, parts) = self.tables(collection)?;
        let statements: Vec<String> = match name {
            "payload_gin" => vec![format!(
                "CREATE INDEX IF NOT EXISTS {objects}_payload_gin ON {objects} \
                 USING gin (payload jsonb_path_ops)"
            )],
            "user_id_index" => vec![
                format!("CREATE INDEX IF NOT EXISTS {objects}_user_idx ON {objects} (user_id)"),
                format!("CREATE INDEX IF NOT EXISTS {parts}_user_idx ON {parts} (user_id)"),
            ],
            "analyze" => vec![
                format!("ANALYZE {objects}"),
                format!("ANALYZE {parts}"),
            ],
            other => {
                return Err(QuiverError::validation(format!(
                    "unknown optimization: {other}"
                )));
            }
        };

        for sql in statements {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("applying optimization", e))?;
        }
        info!(collection_id = %collection.collection_id, optimization = name,
            "Applied optimization");
        Ok(())
    }

    async fn list_object_ids(
        &self,
        collection: &CollectionInfo,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let (objects, _) = self.tables(collection)?;
        let sql = format!(
            "SELECT object_id FROM {objects} \
             WHERE ($1::text IS NULL OR object_id > $1) \
             ORDER BY object_id LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("listing object ids", e))?;

        rows.iter()
            .map(|row| row.try_get("object_id").map_err(row_err))
            .collect()
    }

    async fn lock_objects(
        &self,
        collection: &CollectionInfo,
        ids: &[String],
    ) -> Result<Box<dyn LockScope>> {
        let (objects, _) = self.tables(collection)?;
        let mut sorted = ids.to_vec();
        sorted.sort();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("opening lock transaction", e))?;
        self.lock_rows(&mut tx, &objects, &sorted).await?;

        Ok(Box::new(PgLockScope { tx: Some(tx) }))
    }
}
