use anyhow::{Context, Result};
use clap::Parser;

use record_matcher::cli::{Cli, env_file_arg};
use record_matcher::db::{SqliteStore, make_pool};
use record_matcher::engine::{MatchEngine, MatchOutcome, ProgressUpdate};
use record_matcher::logging;
use record_matcher::util::envfile::{load_dotenv_if_present, load_env_file_from};

#[tokio::main]
async fn main() {
    // env files go first so clap's env fallbacks and RUST_LOG see them
    if let Err(e) = load_dotenv_if_present() {
        eprintln!("warning: could not read .env: {}", e);
    }
    if let Some(path) = env_file_arg(std::env::args()) {
        if let Err(e) = load_env_file_from(&path) {
            eprintln!("warning: could not read {}: {}", path.display(), e);
        }
    }

    if logging::tracing_requested() {
        logging::init_tracing_from_env();
    } else {
        logging::init_env_logger();
    }

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(outcome) => print_outcome(&outcome, cli.json),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("match failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: &Cli) -> Result<MatchOutcome> {
    let cfg = cli.to_app_config().context("invalid configuration")?;
    let spec = cli.to_specification().context("invalid match options")?;
    let pool = make_pool(&cfg.database)
        .await
        .with_context(|| format!("opening {}", cfg.database.url))?;
    let store = SqliteStore::new(pool);

    let outcome = MatchEngine::new(&store, cfg.engine.clone())
        .run(&cli.left, &cli.right, &spec, &cli.target, |p: ProgressUpdate| {
            log::debug!(
                "[{}] {}/{} pairs ({:.1}%), eta {}s, {} rows written",
                p.stage,
                p.processed_pairs,
                p.total_pairs,
                p.percent,
                p.eta_secs,
                p.rows_written
            );
        })
        .await
        .with_context(|| format!("matching {} on {}", cli.left, cli.right))?;
    store.pool().close().await;
    Ok(outcome)
}

fn print_outcome(outcome: &MatchOutcome, json: bool) {
    if json {
        match serde_json::to_string_pretty(outcome) {
            Ok(s) => println!("{}", s),
            Err(e) => log::error!("could not serialize outcome: {}", e),
        }
        return;
    }
    println!("Exact matches: {} rows in {}", outcome.exact_rows, outcome.exact_relation);
    println!("Fuzzy matches: {} rows in {}", outcome.fuzzy_rows, outcome.fuzzy_relation);
    println!(
        "Reduced sets: {} left / {} right rows, {} x {} partitions, {} flushes",
        outcome.reduced_left_rows,
        outcome.reduced_right_rows,
        outcome.left_partitions,
        outcome.right_partitions,
        outcome.flushes
    );
    println!("Elapsed: {} ms", outcome.elapsed_ms);
}
