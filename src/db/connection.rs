use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::DbError;

/// Open the store session. The engine is the only writer during a run and
/// issues its calls strictly in sequence, so the pool holds exactly one
/// connection; that also keeps `sqlite::memory:` databases alive and shared.
pub async fn make_pool(cfg: &DatabaseConfig) -> Result<SqlitePool, DbError> {
    let acquire_ms: u64 = std::env::var("RECORD_MATCHER_ACQUIRE_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(cfg.acquire_timeout_ms);

    let opts = SqliteConnectOptions::from_str(&cfg.url)
        .map_err(|e| DbError::Connection(format!("{}: {}", cfg.url, e)))?
        .create_if_missing(cfg.create_if_missing);

    log::debug!(
        "opening store {} (acquire timeout {}ms)",
        cfg.url,
        acquire_ms
    );

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_millis(acquire_ms))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(opts)
        .await
        .map_err(|e| DbError::Connection(format!("{}: {}", cfg.url, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_keeps_state_between_calls() {
        let pool = make_pool(&DatabaseConfig::default()).await.unwrap();
        sqlx::query("CREATE TABLE t (a TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t VALUES ('x')")
            .execute(&pool)
            .await
            .unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn unopenable_database_is_connection_error() {
        let cfg = DatabaseConfig {
            url: "sqlite:///definitely/missing/dir/store.db".into(),
            acquire_timeout_ms: 2_000,
            ..DatabaseConfig::default()
        };
        assert!(matches!(
            make_pool(&cfg).await,
            Err(DbError::Connection(_))
        ));
    }
}
