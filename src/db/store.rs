use sqlx::SqlitePool;
use std::collections::HashMap;
use uuid::Uuid;

use super::schema::{quote_ident, row_columns, row_to_text};
use crate::error::DbError;
use crate::models::{RecordBatch, Row};

/// Operations the match engine needs from a relational store. Every value is
/// exchanged as text and the engine never coerces numbers. Implementations
/// are driven strictly sequentially by one engine run at a time.
#[allow(async_fn_in_trait)]
pub trait RelationalStore {
    /// Ordered column names; empty when the relation does not exist.
    async fn column_names(&self, relation: &str) -> Result<Vec<String>, DbError>;

    async fn column_index(&self, relation: &str) -> Result<HashMap<String, usize>, DbError> {
        Ok(self
            .column_names(relation)
            .await?
            .into_iter()
            .enumerate()
            .map(|(i, c)| (c, i))
            .collect())
    }

    async fn exists(&self, relation: &str) -> Result<bool, DbError>;

    /// Run a statement that returns no rows (DDL or DML).
    async fn execute(&self, sql: &str) -> Result<u64, DbError>;

    async fn run_query(&self, sql: &str) -> Result<RecordBatch, DbError>;

    /// `limit` rows starting at `offset` in the relation's natural order.
    async fn fetch_range(
        &self,
        relation: &str,
        offset: u64,
        limit: u64,
    ) -> Result<RecordBatch, DbError>;

    async fn bulk_insert(
        &self,
        relation: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, DbError>;

    async fn create_index(
        &self,
        relation: &str,
        column: &str,
        index_name: &str,
    ) -> Result<(), DbError>;

    /// Create a text-typed relation with one column per left attribute
    /// (`<left_prefix>_<attr>`), one per right attribute
    /// (`<right_prefix>_<attr>`) and one per extra column.
    async fn create_wide_relation(
        &self,
        left_columns: &[String],
        right_columns: &[String],
        left_prefix: &str,
        right_prefix: &str,
        extra_columns: &[String],
        output_name: &str,
    ) -> Result<(), DbError>;

    async fn row_count(&self, relation: &str) -> Result<u64, DbError>;

    /// A relation name guaranteed not to collide with an existing one.
    async fn fresh_temporary_name(&self, hint: Option<&str>) -> Result<String, DbError>;

    async fn drop_if_exists(&self, relation: &str) -> Result<(), DbError>;
}

/// `RelationalStore` over a single-connection SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn object_type(&self, relation: &str) -> Result<Option<String>, DbError> {
        let sql = "SELECT type FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?";
        sqlx::query_scalar::<_, String>(sql)
            .bind(relation)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DbError::query(sql, e))
    }
}

impl RelationalStore for SqliteStore {
    async fn column_names(&self, relation: &str) -> Result<Vec<String>, DbError> {
        let sql = "SELECT name FROM pragma_table_info(?) ORDER BY cid";
        sqlx::query_scalar::<_, String>(sql)
            .bind(relation)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::query(sql, e))
    }

    async fn exists(&self, relation: &str) -> Result<bool, DbError> {
        Ok(self.object_type(relation).await?.is_some())
    }

    async fn execute(&self, sql: &str) -> Result<u64, DbError> {
        log::trace!("execute: {}", sql);
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
            .map_err(|e| DbError::query(sql, e))
    }

    async fn run_query(&self, sql: &str) -> Result<RecordBatch, DbError> {
        log::trace!("query: {}", sql);
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::query(sql, e))?;
        let columns = rows.first().map(row_columns).unwrap_or_default();
        Ok(RecordBatch {
            columns,
            rows: rows.iter().map(row_to_text).collect(),
        })
    }

    async fn fetch_range(
        &self,
        relation: &str,
        offset: u64,
        limit: u64,
    ) -> Result<RecordBatch, DbError> {
        let columns = self.column_names(relation).await?;
        let sql = format!(
            "SELECT * FROM {} ORDER BY rowid LIMIT {} OFFSET {}",
            quote_ident(relation),
            limit,
            offset
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::query(&sql, e))?;
        Ok(RecordBatch {
            columns,
            rows: rows.iter().map(row_to_text).collect(),
        })
    }

    async fn bulk_insert(
        &self,
        relation: &str,
        columns: &[String],
        rows: &[Row],
    ) -> Result<u64, DbError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let column_list = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(relation),
            column_list,
            placeholders
        );
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::query("BEGIN", e))?;
        let mut inserted = 0u64;
        for row in rows {
            if row.len() != columns.len() {
                return Err(DbError::query(
                    &sql,
                    format!("row has {} values for {} columns", row.len(), columns.len()),
                ));
            }
            let mut q = sqlx::query(&sql);
            for v in row {
                q = q.bind(v.as_deref());
            }
            inserted += q
                .execute(&mut *tx)
                .await
                .map_err(|e| DbError::query(&sql, e))?
                .rows_affected();
        }
        tx.commit()
            .await
            .map_err(|e| DbError::query("COMMIT", e))?;
        Ok(inserted)
    }

    async fn create_index(
        &self,
        relation: &str,
        column: &str,
        index_name: &str,
    ) -> Result<(), DbError> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(index_name),
            quote_ident(relation),
            quote_ident(column)
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn create_wide_relation(
        &self,
        left_columns: &[String],
        right_columns: &[String],
        left_prefix: &str,
        right_prefix: &str,
        extra_columns: &[String],
        output_name: &str,
    ) -> Result<(), DbError> {
        let defs: Vec<String> = left_columns
            .iter()
            .map(|c| format!("{}_{}", left_prefix, c))
            .chain(right_columns.iter().map(|c| format!("{}_{}", right_prefix, c)))
            .chain(extra_columns.iter().cloned())
            .map(|c| format!("{} TEXT", quote_ident(&c)))
            .collect();
        if defs.is_empty() {
            return Err(DbError::query(
                output_name,
                "wide relation needs at least one column",
            ));
        }
        let sql = format!(
            "CREATE TABLE {} ({})",
            quote_ident(output_name),
            defs.join(", ")
        );
        self.execute(&sql).await.map(|_| ())
    }

    async fn row_count(&self, relation: &str) -> Result<u64, DbError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(relation));
        let n: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::query(&sql, e))?;
        Ok(n.max(0) as u64)
    }

    async fn fresh_temporary_name(&self, hint: Option<&str>) -> Result<String, DbError> {
        let hint: String = hint
            .unwrap_or("tmp")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        loop {
            let name = format!("temp_{}_{}", hint, Uuid::new_v4().simple());
            if !self.exists(&name).await? {
                return Ok(name);
            }
        }
    }

    async fn drop_if_exists(&self, relation: &str) -> Result<(), DbError> {
        let sql = match self.object_type(relation).await?.as_deref() {
            Some("view") => format!("DROP VIEW IF EXISTS {}", quote_ident(relation)),
            Some(_) => format!("DROP TABLE IF EXISTS {}", quote_ident(relation)),
            None => return Ok(()),
        };
        self.execute(&sql).await.map(|_| ())
    }
}
