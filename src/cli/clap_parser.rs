use crate::config::{
    AppConfig, DEFAULT_FLUSH_THRESHOLD, DEFAULT_PARTITION_SIZE, DatabaseConfig, EngineConfig,
};
use crate::error::ConfigError;
use crate::matching::{
    MatchOption, MatchSpecification, SelectionScope, parse_attribute_list, parse_with_clause,
};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "record_matcher",
    version,
    about = "Exact and fuzzy record linkage between two relations",
    disable_help_subcommand = true
)]
pub struct Cli {
    /// SQLite database file or sqlx URL (env: RECORD_MATCHER_DB)
    #[arg(long = "db", value_name = "DATABASE", env = "RECORD_MATCHER_DB")]
    pub database: String,
    /// Left relation
    #[arg(value_name = "LEFT")]
    pub left: String,
    /// Comma-separated left key attributes
    #[arg(value_name = "LEFT_ATTRS")]
    pub left_attrs: String,
    /// Right relation
    #[arg(value_name = "RIGHT")]
    pub right: String,
    /// Comma-separated right key attributes
    #[arg(value_name = "RIGHT_ATTRS")]
    pub right_attrs: String,
    /// Stem of the output relations (<TARGET>_exact_matches, <TARGET>_fuzzy_matches)
    #[arg(value_name = "TARGET")]
    pub target: String,
    /// Match options, e.g. "threshold(0.8), suppresssecondbest, displayleft(*)"
    #[arg(long = "with", value_name = "OPTIONS")]
    pub with: Option<String>,
    #[arg(long = "left-partition-size", default_value_t = DEFAULT_PARTITION_SIZE)]
    pub left_partition_size: usize,
    #[arg(long = "right-partition-size", default_value_t = DEFAULT_PARTITION_SIZE)]
    pub right_partition_size: usize,
    /// Flush buffered fuzzy rows once more than this many are pending
    #[arg(long = "flush-threshold", default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    pub flush_threshold: usize,
    /// Select best candidates over the whole right relation instead of per partition
    #[arg(long = "global-best")]
    pub global_best: bool,
    /// Score left rows in parallel (env: RECORD_MATCHER_PARALLEL)
    #[arg(long = "parallel", env = "RECORD_MATCHER_PARALLEL")]
    pub parallel: bool,
    /// Print the run outcome as JSON
    #[arg(long = "json")]
    pub json: bool,
    /// Extra .env file loaded before the environment is read
    #[arg(long = "env-file", value_name = "PATH")]
    pub env_file: Option<PathBuf>,
}

impl Cli {
    pub fn to_app_config(&self) -> Result<AppConfig, ConfigError> {
        let cfg = AppConfig {
            database: DatabaseConfig::from_path(self.database.trim()),
            engine: EngineConfig {
                left_partition_size: self.left_partition_size,
                right_partition_size: self.right_partition_size,
                flush_threshold: self.flush_threshold,
                parallel_scoring: self.parallel,
                selection_scope: self.global_best.then_some(SelectionScope::Global),
            },
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_specification(&self) -> Result<MatchSpecification, ConfigError> {
        let options: Vec<MatchOption> = match &self.with {
            Some(w) => parse_with_clause(w)?,
            None => Vec::new(),
        };
        MatchSpecification::new(
            parse_attribute_list(&self.left_attrs),
            parse_attribute_list(&self.right_attrs),
            &options,
        )
    }
}

/// Value of `--env-file` taken from raw arguments, so the file can be loaded
/// before clap reads its environment fallbacks.
pub fn env_file_arg<I, S>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut it = args.into_iter();
    while let Some(a) = it.next() {
        let a = a.as_ref();
        if a == "--env-file" {
            return it.next().map(|p| PathBuf::from(p.as_ref()));
        }
        if let Some(p) = a.strip_prefix("--env-file=") {
            return Some(PathBuf::from(p));
        }
    }
    None
}
