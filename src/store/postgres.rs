use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};

use crate::model::{generate_id, Document, Id};
use crate::store::traits::{DocumentStore, QueryOperator};

/// Document store persisting every collection in one JSONB table
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the documents table and its indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data JSONB NOT NULL DEFAULT '{}'::jsonb,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create documents table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS documents_data_gin ON documents USING GIN (data)")
            .execute(&self.pool)
            .await
            .context("Failed to create documents index")?;

        log::info!("documents table ready");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert or replace a document under its own id
    pub async fn insert(&self, collection: &str, document: Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)
             ON CONFLICT (collection, id) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(collection)
        .bind(&document.id)
        .bind(Json(&document.fields))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert {}/{}", collection, document.id))?;
        Ok(())
    }
}

fn row_to_document(row: &PgRow) -> Result<Document> {
    let id: String = row.try_get("id").context("Missing id column")?;
    let Json(fields): Json<Map<String, Value>> =
        row.try_get("data").context("Document data is not a JSON object")?;
    Ok(Document::new(id, fields))
}

#[async_trait::async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT id, data FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch {}/{}", collection, id))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(row_to_document(&row)?))
    }

    async fn get_many_by_id(&self, collection: &str, ids: &[Id]) -> Result<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT id, data FROM documents WHERE collection = $1 AND id = ANY($2)")
            .bind(collection)
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to batch fetch from {}", collection))?;

        rows.iter().map(row_to_document).collect()
    }

    async fn query(
        &self,
        collection: &str,
        field: &str,
        op: QueryOperator,
        value: &Value,
    ) -> Result<Vec<Document>> {
        let (sql, operand) = match op {
            QueryOperator::Equal => (
                "SELECT id, data FROM documents
                 WHERE collection = $1 AND data -> $2::text = $3",
                value.clone(),
            ),
            QueryOperator::ArrayContains => (
                "SELECT id, data FROM documents
                 WHERE collection = $1
                   AND jsonb_typeof(data -> $2::text) = 'array'
                   AND data -> $2::text @> $3",
                Value::Array(vec![value.clone()]),
            ),
        };

        let rows = sqlx::query(sql)
            .bind(collection)
            .bind(field)
            .bind(Json(operand))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to query {} on {}", collection, field))?;

        rows.iter().map(row_to_document).collect()
    }

    async fn create(&self, collection: &str, mut fields: Map<String, Value>) -> Result<Id> {
        let id = generate_id();
        fields.remove("id");
        sqlx::query("INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3)")
            .bind(collection)
            .bind(&id)
            .bind(Json(&fields))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to create document in {}", collection))?;
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, mut partial: Map<String, Value>) -> Result<()> {
        partial.remove("id");
        let result = sqlx::query("UPDATE documents SET data = data || $3 WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .bind(Json(&partial))
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to update {}/{}", collection, id))?;

        if result.rows_affected() == 0 {
            bail!("no document to update: {}/{}", collection, id);
        }
        Ok(())
    }

    async fn array_add(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents
             SET data = jsonb_set(
                 data,
                 ARRAY[$3::text],
                 CASE
                     WHEN data -> $3::text IS NULL OR jsonb_typeof(data -> $3::text) <> 'array'
                         THEN jsonb_build_array($4::jsonb)
                     WHEN (data -> $3::text) @> jsonb_build_array($4::jsonb)
                         THEN data -> $3::text
                     ELSE (data -> $3::text) || jsonb_build_array($4::jsonb)
                 END,
                 true)
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to add to {}/{}.{}", collection, id, field))?;

        if result.rows_affected() == 0 {
            bail!("no document to update: {}/{}", collection, id);
        }
        Ok(())
    }

    async fn array_remove(&self, collection: &str, id: &str, field: &str, value: &Value) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents
             SET data = CASE
                 WHEN jsonb_typeof(data -> $3::text) = 'array' THEN jsonb_set(
                     data,
                     ARRAY[$3::text],
                     COALESCE(
                         (SELECT jsonb_agg(e.elem ORDER BY e.pos)
                          FROM jsonb_array_elements(data -> $3::text) WITH ORDINALITY AS e(elem, pos)
                          WHERE e.elem <> $4::jsonb),
                         '[]'::jsonb))
                 ELSE data
             END
             WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to remove from {}/{}.{}", collection, id, field))?;

        if result.rows_affected() == 0 {
            bail!("no document to update: {}/{}", collection, id);
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete {}/{}", collection, id))?;
        Ok(())
    }
}
