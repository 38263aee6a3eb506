use crate::db::RelationalStore;
use crate::error::DbError;
use crate::models::Row;

/// Fuzzy output rows waiting to be bulk-inserted. Owned by one run; the
/// orchestrator decides when to flush.
#[derive(Debug)]
pub struct OutputBuffer {
    relation: String,
    columns: Vec<String>,
    rows: Vec<Row>,
    threshold: usize,
    flushes: usize,
    written: u64,
}

impl OutputBuffer {
    pub fn new(relation: impl Into<String>, columns: Vec<String>, threshold: usize) -> Self {
        Self {
            relation: relation.into(),
            columns,
            rows: Vec::new(),
            threshold,
            flushes: 0,
            written: 0,
        }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True once the buffer holds more rows than the threshold.
    pub fn is_over_threshold(&self) -> bool {
        self.len() > self.threshold
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Insert all buffered rows and clear the buffer. Rows inserted by
    /// earlier flushes stay in place if this one fails.
    pub async fn flush<S: RelationalStore>(&mut self, store: &S) -> Result<u64, DbError> {
        if self.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut self.rows);
        let n = store.bulk_insert(&self.relation, &self.columns, &rows).await?;
        self.flushes += 1;
        self.written += n;
        log::debug!(
            "flushed {} rows into {} (flush #{}, {} total)",
            n,
            self.relation,
            self.flushes,
            self.written
        );
        Ok(n)
    }

    pub async fn flush_if_full<S: RelationalStore>(&mut self, store: &S) -> Result<u64, DbError> {
        if self.is_over_threshold() {
            self.flush(store).await
        } else {
            Ok(0)
        }
    }
}
