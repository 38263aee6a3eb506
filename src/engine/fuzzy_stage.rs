use rayon::prelude::*;
use serde::Serialize;
use std::time::Instant;

use super::ProgressUpdate;
use super::buffer::OutputBuffer;
use super::context::MatchContext;
use super::exact_stage::ExactStageOutcome;
use crate::config::EngineConfig;
use crate::db::RelationalStore;
use crate::error::{MatchError, Stage};
use crate::matching::{MatchCandidate, MatchSet, SelectionScope, select_indices};
use crate::metrics::memory_stats_mb;
use crate::models::{RecordBatch, Row};
use crate::util::partition::{Partition, Partitioning};

#[derive(Debug, Clone, Serialize)]
pub struct FuzzyStageOutcome {
    pub fuzzy_relation: String,
    pub fuzzy_rows: u64,
    pub left_partitions: usize,
    pub right_partitions: usize,
    pub partition_pairs: usize,
    pub flushes: usize,
}

/// Locally selected candidates for every left row of a batch, in left order.
fn select_for_batch(
    ctx: &MatchContext,
    left_rows: &[Row],
    right_rows: &[Row],
    parallel: bool,
) -> Vec<Vec<MatchCandidate>> {
    let one = |left: &Row| MatchSet::score_batch(left, right_rows, ctx).into_selected(&ctx.options);
    if parallel {
        left_rows.par_iter().map(one).collect()
    } else {
        left_rows.iter().map(one).collect()
    }
}

fn log_sparse_keys(ctx: &MatchContext, batch: &RecordBatch, side: &str) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let positions = if side == "left" {
        &ctx.left.key_positions
    } else {
        &ctx.right.key_positions
    };
    let nulls = batch
        .rows
        .iter()
        .filter(|r| positions.iter().any(|&i| r.get(i).is_none_or(|v| v.is_none())))
        .count();
    if nulls > 0 {
        log::trace!("{} {} rows with null key values scored as empty", nulls, side);
    }
}

struct Progress<'a, F: Fn(ProgressUpdate)> {
    on_progress: &'a F,
    start: Instant,
    total_pairs: usize,
    processed_pairs: usize,
}

impl<F: Fn(ProgressUpdate)> Progress<'_, F> {
    fn pair_done(&mut self, left: &Partition, right: &Partition, rows_written: u64) {
        self.processed_pairs += 1;
        let frac = (self.processed_pairs as f32 / self.total_pairs.max(1) as f32).clamp(0.0, 1.0);
        let eta = if frac > 0.0 {
            (self.start.elapsed().as_secs_f32() * (1.0 - frac) / frac) as u64
        } else {
            0
        };
        let mem = memory_stats_mb();
        log::info!(
            "partition pair {}/{} (left {}, right {}): {} rows written, eta {}s, mem used {} MB, avail {} MB",
            self.processed_pairs,
            self.total_pairs,
            left.number,
            right.number,
            rows_written,
            eta,
            mem.used_mb,
            mem.avail_mb
        );
        (self.on_progress)(ProgressUpdate {
            stage: "fuzzy",
            left_partition: left.number,
            right_partition: right.number,
            processed_pairs: self.processed_pairs,
            total_pairs: self.total_pairs,
            percent: frac * 100.0,
            eta_secs: eta,
            rows_written,
            mem_used_mb: mem.used_mb,
            mem_avail_mb: mem.avail_mb,
        });
    }
}

/// Compare every reduced left row with every reduced right row, one
/// (left partition, right partition) pair at a time, and write the selected
/// candidates into `<target>_fuzzy_matches`. Rows flushed before a failure
/// remain in the output relation.
pub async fn run_fuzzy_stage<S, F>(
    store: &S,
    ctx: &MatchContext,
    cfg: &EngineConfig,
    exact: &ExactStageOutcome,
    on_progress: &F,
) -> Result<FuzzyStageOutcome, MatchError>
where
    S: RelationalStore,
    F: Fn(ProgressUpdate),
{
    let fail = || MatchError::store(Stage::Fuzzy);
    let fuzzy_relation = ctx.fuzzy_matches_name();
    store.drop_if_exists(&fuzzy_relation).await.map_err(fail())?;
    store
        .create_wide_relation(
            &ctx.left.projection,
            &ctx.right.projection,
            &ctx.left.prefix,
            &ctx.right.prefix,
            &ctx.output.extra_columns,
            &fuzzy_relation,
        )
        .await
        .map_err(fail())?;

    let left_parts = Partitioning::new(exact.reduced_left_rows, cfg.left_partition_size)?;
    let right_parts = Partitioning::new(exact.reduced_right_rows, cfg.right_partition_size)?;
    let total_pairs = left_parts.count_partitions() * right_parts.count_partitions();
    log::info!(
        "fuzzy matching {} x {} rows in {} partition pairs ({:?} selection)",
        exact.reduced_left_rows,
        exact.reduced_right_rows,
        total_pairs,
        ctx.options.selection_scope
    );

    let mut buffer = OutputBuffer::new(
        fuzzy_relation.clone(),
        ctx.output.columns.clone(),
        cfg.flush_threshold,
    );
    let mut progress = Progress {
        on_progress,
        start: Instant::now(),
        total_pairs,
        processed_pairs: 0,
    };

    for lpart in &left_parts {
        let left = store
            .fetch_range(&exact.reduced_left, lpart.first_record, lpart.length)
            .await
            .map_err(fail())?;
        log_sparse_keys(ctx, &left, "left");
        // survivors per left row, carried across right partitions
        let mut carried: Vec<Vec<(MatchCandidate, Row)>> = match ctx.options.selection_scope {
            SelectionScope::Global => vec![Vec::new(); left.len()],
            SelectionScope::PerPartition => Vec::new(),
        };

        for rpart in &right_parts {
            let right = store
                .fetch_range(&exact.reduced_right, rpart.first_record, rpart.length)
                .await
                .map_err(fail())?;
            log_sparse_keys(ctx, &right, "right");
            let selected = select_for_batch(ctx, &left.rows, &right.rows, cfg.parallel_scoring);

            match ctx.options.selection_scope {
                SelectionScope::PerPartition => {
                    for (left_row, picks) in left.rows.iter().zip(selected) {
                        for c in picks {
                            buffer.push(ctx.output_row(&c, left_row, &right.rows[c.right_index]));
                            buffer.flush_if_full(store).await.map_err(fail())?;
                        }
                    }
                    buffer.flush(store).await.map_err(fail())?;
                }
                SelectionScope::Global => {
                    for (slot, picks) in carried.iter_mut().zip(selected) {
                        slot.extend(picks.into_iter().map(|c| {
                            let row = right.rows[c.right_index].clone();
                            (c, row)
                        }));
                        let keep = select_indices(slot.iter().map(|(c, _)| c), &ctx.options);
                        let mut keep = keep.into_iter().peekable();
                        let mut i = 0;
                        slot.retain(|_| {
                            let hit = keep.peek() == Some(&i);
                            if hit {
                                keep.next();
                            }
                            i += 1;
                            hit
                        });
                    }
                }
            }
            progress.pair_done(&lpart, &rpart, buffer.written());
        }

        for (left_row, picks) in left.rows.iter().zip(carried) {
            for (c, right_row) in picks {
                buffer.push(ctx.output_row(&c, left_row, &right_row));
                buffer.flush_if_full(store).await.map_err(fail())?;
            }
        }
        buffer.flush(store).await.map_err(fail())?;
    }

    log::info!(
        "fuzzy matches: {} rows in {} ({} flushes)",
        buffer.written(),
        fuzzy_relation,
        buffer.flushes()
    );
    Ok(FuzzyStageOutcome {
        fuzzy_relation,
        fuzzy_rows: buffer.written(),
        left_partitions: left_parts.count_partitions(),
        right_partitions: right_parts.count_partitions(),
        partition_pairs: progress.processed_pairs,
        flushes: buffer.flushes(),
    })
}
