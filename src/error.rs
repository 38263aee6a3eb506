use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query error: {message} (sql: {sql})")]
    Query { sql: String, message: String },
}

impl DbError {
    pub(crate) fn query(sql: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DbError::Query {
            sql: sql.into(),
            message: err.to_string(),
        }
    }
}

/// Stage of a match run in which a store call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Exact,
    Fuzzy,
    Cleanup,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Setup => "setup",
            Stage::Exact => "exact",
            Stage::Fuzzy => "fuzzy",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(s)
    }
}

/// Terminal failure of a match run. Configuration problems are detected
/// before any relation is touched; store failures abort the run without
/// retry. Rows already flushed to the fuzzy output stay in place.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store operation failed during {stage} stage: {source}")]
    Store {
        stage: Stage,
        #[source]
        source: DbError,
    },
}

impl MatchError {
    pub(crate) fn store(stage: Stage) -> impl FnOnce(DbError) -> MatchError {
        move |source| MatchError::Store { stage, source }
    }
}
