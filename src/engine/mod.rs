//! Match run orchestration: exact stage, fuzzy stage, cleanup.

pub mod buffer;
pub mod context;
pub mod exact_stage;
pub mod fuzzy_stage;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::db::{RelationalStore, validate_ident};
use crate::error::{MatchError, Stage};
use crate::matching::{MatchSpecification, SelectionScope};
use crate::metrics::memory_stats_mb;
use crate::models::RelationRef;
use context::MatchContext;
use exact_stage::{ExactStageOutcome, run_exact_stage};
use fuzzy_stage::{FuzzyStageOutcome, run_fuzzy_stage};

/// Progress of a run, reported once per partition pair and at stage
/// boundaries.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProgressUpdate {
    pub stage: &'static str,
    pub left_partition: u64,
    pub right_partition: u64,
    pub processed_pairs: usize,
    pub total_pairs: usize,
    pub percent: f32,
    pub eta_secs: u64,
    pub rows_written: u64,
    pub mem_used_mb: u64,
    pub mem_avail_mb: u64,
}

impl ProgressUpdate {
    fn stage_only(stage: &'static str, rows_written: u64) -> Self {
        let mem = memory_stats_mb();
        Self {
            stage,
            left_partition: 0,
            right_partition: 0,
            processed_pairs: 0,
            total_pairs: 0,
            percent: if stage == "done" { 100.0 } else { 0.0 },
            eta_secs: 0,
            rows_written,
            mem_used_mb: mem.used_mb,
            mem_avail_mb: mem.avail_mb,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub target: String,
    pub left: String,
    pub right: String,
    pub exact_relation: String,
    pub fuzzy_relation: String,
    pub exact_rows: u64,
    pub fuzzy_rows: u64,
    pub reduced_left_rows: u64,
    pub reduced_right_rows: u64,
    pub left_partitions: usize,
    pub right_partitions: usize,
    pub partition_pairs: usize,
    pub flushes: usize,
    pub selection_scope: SelectionScope,
    pub started_utc: DateTime<Utc>,
    pub ended_utc: DateTime<Utc>,
    pub elapsed_ms: u64,
}

/// One match run against a store. Consumed by [`MatchEngine::run`].
pub struct MatchEngine<'s, S: RelationalStore> {
    store: &'s S,
    config: EngineConfig,
}

impl<'s, S: RelationalStore> MatchEngine<'s, S> {
    pub fn new(store: &'s S, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Match `left` against `right` and write `<target>_exact_matches` and
    /// `<target>_fuzzy_matches`. Configuration problems fail before any
    /// relation is created. Intermediate relations are dropped whether or
    /// not the run succeeds.
    pub async fn run<F>(
        self,
        left: &str,
        right: &str,
        spec: &MatchSpecification,
        target: &str,
        on_progress: F,
    ) -> Result<MatchOutcome, MatchError>
    where
        F: Fn(ProgressUpdate),
    {
        let started_utc = Utc::now();
        let t0 = Instant::now();
        self.config.validate()?;
        validate_ident(target)?;

        let setup = || MatchError::store(Stage::Setup);
        let left_rel = RelationRef::discover(self.store, left).await.map_err(setup())?;
        let right_rel = RelationRef::discover(self.store, right).await.map_err(setup())?;
        let ctx = MatchContext::new(left_rel, right_rel, spec, target, self.config.selection_scope)?;
        log::info!(
            "matching {}({}) on {}({}) into {}",
            left,
            spec.left_attributes().join(", "),
            right,
            spec.right_attributes().join(", "),
            target
        );

        let mut temporaries = Vec::new();
        let result = self.stages(&ctx, &mut temporaries, &on_progress).await;
        if let Err(MatchError::Store {
            stage: Stage::Exact,
            ..
        }) = &result
        {
            temporaries.push(ctx.exact_matches_name());
        }
        let cleanup = self.drop_temporaries(&temporaries).await;

        let (exact, fuzzy) = match (result, cleanup) {
            (Ok(stages), Ok(())) => stages,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), Err(cleanup_err)) => {
                log::warn!("cleanup after failed match run: {}", cleanup_err);
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
        };

        on_progress(ProgressUpdate::stage_only("done", fuzzy.fuzzy_rows));
        let outcome = MatchOutcome {
            target: target.to_string(),
            left: left.to_string(),
            right: right.to_string(),
            exact_relation: exact.exact_relation,
            fuzzy_relation: fuzzy.fuzzy_relation,
            exact_rows: exact.exact_rows,
            fuzzy_rows: fuzzy.fuzzy_rows,
            reduced_left_rows: exact.reduced_left_rows,
            reduced_right_rows: exact.reduced_right_rows,
            left_partitions: fuzzy.left_partitions,
            right_partitions: fuzzy.right_partitions,
            partition_pairs: fuzzy.partition_pairs,
            flushes: fuzzy.flushes,
            selection_scope: ctx.options.selection_scope,
            started_utc,
            ended_utc: Utc::now(),
            elapsed_ms: t0.elapsed().as_millis() as u64,
        };
        log::info!(
            "match {} done: {} exact, {} fuzzy rows in {} ms",
            target,
            outcome.exact_rows,
            outcome.fuzzy_rows,
            outcome.elapsed_ms
        );
        Ok(outcome)
    }

    async fn stages<F: Fn(ProgressUpdate)>(
        &self,
        ctx: &MatchContext,
        temporaries: &mut Vec<String>,
        on_progress: &F,
    ) -> Result<(ExactStageOutcome, FuzzyStageOutcome), MatchError> {
        let exact = run_exact_stage(self.store, ctx, temporaries).await?;
        on_progress(ProgressUpdate::stage_only("exact_done", 0));
        let fuzzy = run_fuzzy_stage(self.store, ctx, &self.config, &exact, on_progress).await?;
        Ok((exact, fuzzy))
    }

    async fn drop_temporaries(&self, temporaries: &[String]) -> Result<(), MatchError> {
        let mut first_err = None;
        for name in temporaries.iter().rev() {
            if let Err(e) = self.store.drop_if_exists(name).await {
                log::warn!("could not drop {}: {}", name, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(MatchError::store(Stage::Cleanup)(e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{SqliteStore, make_pool, quote_literal};
    use crate::error::ConfigError;
    use crate::error::DbError;
    use crate::matching::{MatchOption, parse_with_clause};
    use crate::models::{RecordBatch, Row};
    use std::cell::{Cell, RefCell};

    /// SQLite store that fails selected operations.
    struct FlakyStore {
        inner: SqliteStore,
        /// Fail `execute` for statements containing this text.
        fail_execute_on: Option<&'static str>,
        /// Fail the n-th `bulk_insert` (1-based).
        fail_insert_no: Option<usize>,
        inserts: Cell<usize>,
    }

    impl FlakyStore {
        fn new(inner: SqliteStore) -> Self {
            Self {
                inner,
                fail_execute_on: None,
                fail_insert_no: None,
                inserts: Cell::new(0),
            }
        }
    }

    impl RelationalStore for FlakyStore {
        async fn column_names(&self, relation: &str) -> Result<Vec<String>, DbError> {
            self.inner.column_names(relation).await
        }

        async fn exists(&self, relation: &str) -> Result<bool, DbError> {
            self.inner.exists(relation).await
        }

        async fn execute(&self, sql: &str) -> Result<u64, DbError> {
            if self.fail_execute_on.is_some_and(|t| sql.contains(t)) {
                return Err(DbError::query(sql, "disk I/O error"));
            }
            self.inner.execute(sql).await
        }

        async fn run_query(&self, sql: &str) -> Result<RecordBatch, DbError> {
            self.inner.run_query(sql).await
        }

        async fn fetch_range(
            &self,
            relation: &str,
            offset: u64,
            limit: u64,
        ) -> Result<RecordBatch, DbError> {
            self.inner.fetch_range(relation, offset, limit).await
        }

        async fn bulk_insert(
            &self,
            relation: &str,
            columns: &[String],
            rows: &[Row],
        ) -> Result<u64, DbError> {
            let n = self.inserts.get() + 1;
            self.inserts.set(n);
            if self.fail_insert_no == Some(n) {
                return Err(DbError::query(format!("INSERT INTO {}", relation), "disk full"));
            }
            self.inner.bulk_insert(relation, columns, rows).await
        }

        async fn create_index(
            &self,
            relation: &str,
            column: &str,
            index_name: &str,
        ) -> Result<(), DbError> {
            self.inner.create_index(relation, column, index_name).await
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
            self.inner
                .create_wide_relation(
                    left_columns,
                    right_columns,
                    left_prefix,
                    right_prefix,
                    extra_columns,
                    output_name,
                )
                .await
        }

        async fn row_count(&self, relation: &str) -> Result<u64, DbError> {
            self.inner.row_count(relation).await
        }

        async fn fresh_temporary_name(&self, hint: Option<&str>) -> Result<String, DbError> {
            self.inner.fresh_temporary_name(hint).await
        }

        async fn drop_if_exists(&self, relation: &str) -> Result<(), DbError> {
            self.inner.drop_if_exists(relation).await
        }
    }

    async fn table_names<S: RelationalStore>(s: &S) -> Vec<String> {
        let b = s
            .run_query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .unwrap();
        b.rows.into_iter().filter_map(|mut r| r.remove(0)).collect()
    }

    async fn store() -> SqliteStore {
        SqliteStore::new(make_pool(&DatabaseConfig::default()).await.unwrap())
    }

    async fn table(s: &SqliteStore, name: &str, cols: &[&str], rows: &[&[&str]]) {
        let defs: Vec<String> = cols.iter().map(|c| format!("{} TEXT", c)).collect();
        s.execute(&format!("CREATE TABLE {} ({})", name, defs.join(", ")))
            .await
            .unwrap();
        for r in rows {
            let vals: Vec<String> = r.iter().map(|v| quote_literal(v)).collect();
            s.execute(&format!("INSERT INTO {} VALUES ({})", name, vals.join(", ")))
                .await
                .unwrap();
        }
    }

    async fn count(s: &SqliteStore, sql: &str) -> i64 {
        let b = s.run_query(sql).await.unwrap();
        b.rows[0][0].as_deref().unwrap().parse().unwrap()
    }

    fn spec(attrs: &str, with: &str) -> MatchSpecification {
        let a: Vec<String> = attrs.split(',').map(|s| s.trim().to_string()).collect();
        MatchSpecification::new(a.clone(), a, &parse_with_clause(with).unwrap()).unwrap()
    }

    fn cfg(left: usize, right: usize) -> EngineConfig {
        EngineConfig {
            left_partition_size: left,
            right_partition_size: right,
            ..EngineConfig::default()
        }
    }

    async fn run(
        s: &SqliteStore,
        spec: &MatchSpecification,
        target: &str,
        cfg: EngineConfig,
    ) -> MatchOutcome {
        MatchEngine::new(s, cfg)
            .run("un", "c", spec, target, |_| {})
            .await
            .unwrap()
    }

    async fn graciela_store() -> SqliteStore {
        let s = store().await;
        table(&s, "un", &["id", "name"], &[&["1", "Graciela Ruta"]]).await;
        table(
            &s,
            "c",
            &["id", "name"],
            &[&["9", "Graciela Ruta"], &["10", "Gratiela Ruta"]],
        )
        .await;
        s
    }

    #[tokio::test]
    async fn graciela_ruta_exact_pair_routes_to_exact_matches() {
        let s = graciela_store().await;
        let out = run(
            &s,
            &spec("name", "THRESHOLD(0.80), SUPPRESSSECONDBEST"),
            "m",
            EngineConfig::default(),
        )
        .await;
        assert_eq!(out.exact_rows, 1);
        assert_eq!(
            count(&s, "SELECT COUNT(*) FROM m_exact_matches WHERE un_name = 'Graciela Ruta' AND c_name = 'Graciela Ruta'").await,
            1
        );
        // the exactly matched left row does not compete again
        assert_eq!(out.reduced_left_rows, 0);
        assert_eq!(count(&s, "SELECT COUNT(*) FROM m_fuzzy_matches").await, 0);
    }

    #[tokio::test]
    async fn graciela_ruta_single_best_fuzzy_row() {
        let s = graciela_store().await;
        let out = run(
            &s,
            &spec(
                "name",
                "THRESHOLD(0.80), SUPPRESSSECONDBEST, HUNGRYLEFT, GREEDYLEFT",
            ),
            "m",
            EngineConfig::default(),
        )
        .await;
        assert_eq!(out.exact_rows, 1);
        assert_eq!(
            count(&s, "SELECT COUNT(*) FROM m_fuzzy_matches WHERE un_name = 'Graciela Ruta'").await,
            1
        );
        let b = s
            .run_query("SELECT c_name, match_exact, match_exact_name FROM m_fuzzy_matches")
            .await
            .unwrap();
        assert_eq!(b.value(0, "c_name"), Some("Gratiela Ruta"));
        assert_eq!(b.value(0, "match_exact"), Some("no"));
        assert_eq!(b.value(0, "match_exact_name"), Some("no"));
    }

    #[tokio::test]
    async fn exact_matches_are_complete_and_kept_out_of_fuzzy() {
        let s = store().await;
        table(
            &s,
            "un",
            &["id", "first", "last"],
            &[
                &["1", "Ann", "Lee"],
                &["2", "Bo b", "Ray"],
                &["3", "Cy", "Po"],
                &["4", "Dee", "Dum"],
            ],
        )
        .await;
        table(
            &s,
            "c",
            &["id", "first", "last"],
            &[
                &["7", "A nn", "L ee"],
                &["8", "Bob", "Ray"],
                &["9", "Cyd", "Po"],
                &["10", "Bob", "Ray "],
            ],
        )
        .await;
        let out = run(&s, &spec("first, last", ""), "m", EngineConfig::default()).await;
        // Ann/Lee once, Bob/Ray twice (8 and 10)
        assert_eq!(out.exact_rows, 3);
        for (f, l) in [("Ann", "Lee"), ("Bo b", "Ray")] {
            let n = count(
                &s,
                &format!(
                    "SELECT COUNT(*) FROM m_fuzzy_matches WHERE un_first = '{}' AND un_last = '{}'",
                    f, l
                ),
            )
            .await;
            assert_eq!(n, 0);
        }
        // default threshold keeps every pair for the two unmatched left rows
        assert_eq!(out.fuzzy_rows, 2 * 4);
    }

    #[tokio::test]
    async fn raising_threshold_never_adds_fuzzy_rows() {
        let s = store().await;
        table(
            &s,
            "un",
            &["name"],
            &[&["Graciela Ruta"], &["Martha Meier"], &["Jon Smith"]],
        )
        .await;
        table(
            &s,
            "c",
            &["name"],
            &[
                &["Gratiela Ruta"],
                &["Marhta Meyer"],
                &["John Smyth"],
                &["Zed Zulu"],
            ],
        )
        .await;
        let mut last = i64::MAX;
        for (i, t) in ["-1", "0.3", "0.6", "0.8", "0.9", "0.99"].iter().enumerate() {
            let target = format!("t{}", i);
            run(&s, &spec("name", &format!("threshold({})", t)), &target, cfg(2, 3)).await;
            let n = count(
                &s,
                &format!("SELECT COUNT(*) FROM {}_fuzzy_matches WHERE match_exact = 'no'", target),
            )
            .await;
            assert!(n <= last, "threshold {} gave {} > {}", t, n, last);
            last = n;
        }
        assert!(last < 12);
    }

    #[tokio::test]
    async fn suppress_emits_one_row_per_right_partition() {
        let s = store().await;
        table(&s, "un", &["name"], &[&["alpha"], &["beta"]]).await;
        table(
            &s,
            "c",
            &["name"],
            &[&["alpah"], &["bteta"], &["gamma"], &["delta"], &["alp"], &["be"]],
        )
        .await;
        let out = run(&s, &spec("name", "suppresssecondbest"), "m", cfg(10, 2)).await;
        assert_eq!(out.right_partitions, 3);
        for name in ["alpha", "beta"] {
            let n = count(
                &s,
                &format!("SELECT COUNT(*) FROM m_fuzzy_matches WHERE un_name = '{}'", name),
            )
            .await;
            assert_eq!(n, 3);
        }
    }

    #[tokio::test]
    async fn exact_matches_do_not_depend_on_partition_sizes() {
        let s = store().await;
        let names: Vec<String> = (0..7).map(|i| format!("name {}", i)).collect();
        let left: Vec<[&str; 1]> = names.iter().map(|n| [n.as_str()]).collect();
        let left_rows: Vec<&[&str]> = left.iter().map(|r| &r[..]).collect();
        table(&s, "un", &["name"], &left_rows).await;
        table(
            &s,
            "c",
            &["name"],
            &[&["name1"], &["na me 3"], &["name 6"], &["other"]],
        )
        .await;
        let mut snapshots = Vec::new();
        for (i, (l, r)) in [(1, 1), (2, 3), (10_000, 10_000)].into_iter().enumerate() {
            let target = format!("p{}", i);
            run(&s, &spec("name", "threshold(0.9)"), &target, cfg(l, r)).await;
            let b = s
                .run_query(&format!(
                    "SELECT * FROM {}_exact_matches ORDER BY un_name, c_name",
                    target
                ))
                .await
                .unwrap();
            snapshots.push(b.rows);
        }
        assert_eq!(snapshots[0].len(), 3);
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[1], snapshots[2]);
    }

    #[tokio::test]
    async fn selection_is_local_to_each_right_partition() {
        let s = store().await;
        table(&s, "un", &["name"], &[&["Graciela Ruta"]]).await;
        // partition 1: a passing but weaker candidate; partition 2: the best
        table(&s, "c", &["name"], &[&["Gratiela Ruta"], &["Graciela Rutz"]]).await;
        let with = "threshold(0.8), suppresssecondbest";
        let local = run(&s, &spec("name", with), "local", cfg(10, 1)).await;
        assert_eq!(local.fuzzy_rows, 2);
        let b = s
            .run_query("SELECT c_name FROM local_fuzzy_matches ORDER BY rowid")
            .await
            .unwrap();
        assert_eq!(b.value(0, "c_name"), Some("Gratiela Ruta"));
        assert_eq!(b.value(1, "c_name"), Some("Graciela Rutz"));

        let global = run(
            &s,
            &spec("name", &format!("{}, globalbest", with)),
            "global",
            cfg(10, 1),
        )
        .await;
        assert_eq!(global.selection_scope, SelectionScope::Global);
        assert_eq!(global.fuzzy_rows, 1);
        let g = s
            .run_query("SELECT c_name FROM global_fuzzy_matches")
            .await
            .unwrap();
        assert_eq!(g.value(0, "c_name"), Some("Graciela Rutz"));
    }

    #[tokio::test]
    async fn global_scope_matches_a_single_partition_run() {
        let s = store().await;
        table(&s, "un", &["name"], &[&["Martha"], &["Jon"], &["Zed"]]).await;
        table(
            &s,
            "c",
            &["name"],
            &[&["Marhta"], &["John"], &["Marta"], &["Jonny"], &["Zeb"]],
        )
        .await;
        let mut results = Vec::new();
        for (target, scope, size) in [
            ("one", SelectionScope::PerPartition, 10_000),
            ("many", SelectionScope::Global, 2),
        ] {
            let cfg = EngineConfig {
                right_partition_size: size,
                selection_scope: Some(scope),
                ..EngineConfig::default()
            };
            run(&s, &spec("name", "threshold(0.7)"), target, cfg).await;
            let b = s
                .run_query(&format!(
                    "SELECT un_name, c_name FROM {}_fuzzy_matches ORDER BY un_name, c_name",
                    target
                ))
                .await
                .unwrap();
            results.push(b.rows);
        }
        assert_eq!(results[0], results[1]);
    }

    #[tokio::test]
    async fn transposition_flag_and_output_schema() {
        let s = store().await;
        table(
            &s,
            "un",
            &["id", "first", "last"],
            &[&["1", "Lee", "Ann"], &["2", "Bob", "Ray"]],
        )
        .await;
        table(&s, "c", &["fn", "ln"], &[&["Ann", "Lee"]]).await;
        let spec = MatchSpecification::new(
            vec!["first".into(), "last".into()],
            vec!["fn".into(), "ln".into()],
            &[
                MatchOption::TranspositionCheck("first".into(), "last".into()),
                MatchOption::DisplayLeft(crate::matching::DisplaySelection::All),
            ],
        )
        .unwrap();
        run(&s, &spec, "m", EngineConfig::default()).await;
        assert_eq!(
            s.column_names("m_fuzzy_matches").await.unwrap(),
            vec![
                "un_id",
                "un_first",
                "un_last",
                "c_fn",
                "c_ln",
                "match_exact",
                "match_dice",
                "match_jaro",
                "match_jarowinkler",
                "match_exact_first_fn",
                "match_exact_last_ln",
                "un_key",
                "c_key",
                "swap_first_last_to_match",
            ]
        );
        let b = s
            .run_query("SELECT un_id, un_key, c_key, swap_first_last_to_match FROM m_fuzzy_matches ORDER BY un_id")
            .await
            .unwrap();
        assert_eq!(b.value(0, "un_key"), Some("Lee*Ann"));
        assert_eq!(b.value(0, "c_key"), Some("Ann*Lee"));
        assert_eq!(b.value(0, "swap_first_last_to_match"), Some("yes"));
        assert_eq!(b.value(1, "swap_first_last_to_match"), Some("no"));
    }

    #[tokio::test]
    async fn hungry_left_keeps_exact_rows_in_fuzzy_output() {
        let s = graciela_store().await;
        let out = run(&s, &spec("name", "hungryleft"), "m", EngineConfig::default()).await;
        assert_eq!(out.reduced_left_rows, 1);
        // the exact candidate is emitted alone, without scores
        let b = s
            .run_query("SELECT c_name, match_exact, match_dice FROM m_fuzzy_matches")
            .await
            .unwrap();
        assert_eq!(b.len(), 1);
        assert_eq!(b.value(0, "c_name"), Some("Graciela Ruta"));
        assert_eq!(b.value(0, "match_exact"), Some("yes"));
        assert_eq!(b.value(0, "match_dice"), None);
    }

    #[tokio::test]
    async fn small_flush_threshold_and_parallel_scoring_keep_rows() {
        let s = store().await;
        let names: Vec<String> = (0..9).map(|i| format!("row{}", i)).collect();
        let rows: Vec<[&str; 1]> = names.iter().map(|n| [n.as_str()]).collect();
        let rows: Vec<&[&str]> = rows.iter().map(|r| &r[..]).collect();
        table(&s, "un", &["name"], &rows).await;
        table(&s, "c", &["name"], &[&["x1"], &["x2"], &["x3"]]).await;
        let mut outputs = Vec::new();
        for (target, parallel) in [("seq", false), ("par", true)] {
            let cfg = EngineConfig {
                left_partition_size: 4,
                right_partition_size: 2,
                flush_threshold: 1,
                parallel_scoring: parallel,
                selection_scope: None,
            };
            let out = run(&s, &spec("name", ""), target, cfg).await;
            assert_eq!(out.fuzzy_rows, 27);
            assert_eq!(out.left_partitions, 3);
            assert_eq!(out.partition_pairs, 6);
            assert!(out.flushes > 6);
            let b = s
                .run_query(&format!(
                    "SELECT un_name, c_name FROM {}_fuzzy_matches ORDER BY rowid",
                    target
                ))
                .await
                .unwrap();
            outputs.push(b.rows);
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[tokio::test]
    async fn temporaries_are_dropped_after_the_run() {
        let s = graciela_store().await;
        let progress = RefCell::new(Vec::new());
        MatchEngine::new(&s, EngineConfig::default())
            .run("un", "c", &spec("name", "hungryleft"), "m", |p| {
                progress.borrow_mut().push(p.stage)
            })
            .await
            .unwrap();
        let b = s
            .run_query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .await
            .unwrap();
        let names: Vec<&str> = b.rows.iter().filter_map(|r| r[0].as_deref()).collect();
        assert_eq!(names, vec!["c", "m_exact_matches", "m_fuzzy_matches", "un"]);
        let stages = progress.into_inner();
        assert_eq!(stages.first(), Some(&"exact_done"));
        assert_eq!(stages.last(), Some(&"done"));
        assert!(stages.contains(&"fuzzy"));
    }

    #[tokio::test]
    async fn exact_stage_failure_drops_partial_outputs_and_temporaries() {
        let mut s = FlakyStore::new(graciela_store().await);
        // keyed relations and the exact join succeed, the reduced left set fails
        s.fail_execute_on = Some("temp_reduced_left_");
        let err = MatchEngine::new(&s, EngineConfig::default())
            .run("un", "c", &spec("name", ""), "m", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Store {
                stage: Stage::Exact,
                ..
            }
        ));
        assert_eq!(table_names(&s).await, vec!["c", "un"]);
        let indexes = s
            .run_query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index'")
            .await
            .unwrap();
        assert_eq!(indexes.rows[0][0].as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn fuzzy_stage_failure_keeps_flushed_rows() {
        let base = store().await;
        table(&base, "un", &["name"], &[&["alpha"]]).await;
        table(&base, "c", &["name"], &[&["beta"], &["gamma"], &["delta"]]).await;
        let mut s = FlakyStore::new(base);
        s.fail_insert_no = Some(2);
        let progress = RefCell::new(Vec::new());
        let err = MatchEngine::new(&s, cfg(10, 1))
            .run("un", "c", &spec("name", ""), "m", |p| {
                progress.borrow_mut().push(p.stage)
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Store {
                stage: Stage::Fuzzy,
                ..
            }
        ));
        // the first partition pair was flushed before the failing insert
        assert_eq!(s.row_count("m_fuzzy_matches").await.unwrap(), 1);
        let b = s
            .run_query("SELECT un_name, c_name FROM m_fuzzy_matches")
            .await
            .unwrap();
        assert_eq!(b.value(0, "c_name"), Some("beta"));
        assert_eq!(
            table_names(&s).await,
            vec!["c", "m_exact_matches", "m_fuzzy_matches", "un"]
        );
        let stages = progress.into_inner();
        assert!(!stages.contains(&"done"));
        assert_eq!(stages.iter().filter(|st| **st == "fuzzy").count(), 1);
    }

    #[tokio::test]
    async fn rerun_replaces_previous_outputs() {
        let s = graciela_store().await;
        run(&s, &spec("name", "hungryleft"), "m", EngineConfig::default()).await;
        let out = run(&s, &spec("name", "hungryleft"), "m", EngineConfig::default()).await;
        assert_eq!(out.exact_rows, 1);
        assert_eq!(count(&s, "SELECT COUNT(*) FROM m_fuzzy_matches").await, 1);
    }

    #[tokio::test]
    async fn self_match_uses_side_prefixes() {
        let s = store().await;
        table(&s, "p", &["name"], &[&["Ann"], &["Anne"]]).await;
        let out = MatchEngine::new(&s, EngineConfig::default())
            .run("p", "p", &spec("name", "threshold(0.5)"), "dup", |_| {})
            .await
            .unwrap();
        assert_eq!(out.exact_rows, 2);
        assert_eq!(
            s.column_names("dup_exact_matches").await.unwrap(),
            vec!["p_left_name", "p_right_name", "p_left_match_key", "p_right_match_key"]
        );
    }

    #[tokio::test]
    async fn configuration_errors_touch_nothing() {
        let s = graciela_store().await;
        let engine = MatchEngine::new(&s, EngineConfig::default());
        let err = engine
            .run("un", "c", &spec("name", ""), "bad-target", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Config(_)));

        let err = MatchEngine::new(&s, EngineConfig::default())
            .run("un", "c", &spec("nom", ""), "m", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Config(ConfigError::InvalidValue {
                field: "left_attributes",
                ..
            })
        ));

        let err = MatchEngine::new(&s, cfg(0, 10))
            .run("un", "c", &spec("name", ""), "m", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Config(_)));

        let err = MatchEngine::new(&s, EngineConfig::default())
            .run("un", "missing", &spec("name", ""), "m", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Config(_)));
        assert!(!s.exists("m_exact_matches").await.unwrap());
    }

    #[tokio::test]
    async fn outcome_serializes() {
        let s = graciela_store().await;
        let out = run(&s, &spec("name", ""), "m", EngineConfig::default()).await;
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["exact_relation"], "m_exact_matches");
        assert_eq!(json["selection_scope"], "per_partition");
        assert!(json["started_utc"].is_string());
    }
}
