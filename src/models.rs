use serde::{Deserialize, Serialize};

use crate::db::RelationalStore;
use crate::error::DbError;

/// One record as exchanged with the store. Every value is text; `None` is a
/// SQL NULL.
pub type Row = Vec<Option<String>>;

/// A relation name plus its ordered attribute list as known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    pub name: String,
    pub columns: Vec<String>,
}

impl RelationRef {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Introspect `name` through the store. A relation without columns does
    /// not exist as far as the engine is concerned.
    pub async fn discover<S: RelationalStore>(store: &S, name: &str) -> Result<Self, DbError> {
        let columns = store.column_names(name).await?;
        Ok(Self::new(name, columns))
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// Rows returned by a query together with the column names they carry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in row `row`, `None` for NULL or an unknown column.
    #[cfg(test)]
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}
