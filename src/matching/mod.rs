//! Scoring and selection of candidate record pairs.

use serde::{Deserialize, Serialize};

pub mod candidate;
pub mod match_set;
pub mod similarity;
pub mod spec;

pub use candidate::MatchCandidate;
pub use match_set::{MatchSet, select_indices};
pub use similarity::{SimilarityMetric, SimilarityScores, dice, jaro, jaro_winkler};
pub use spec::{
    DEFAULT_THRESHOLD, DisplaySelection, MatchOption, MatchOptions, MatchSpecification,
    parse_attribute_list, parse_with_clause,
};

/// Range over which the selection policy is applied for one left record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionScope {
    /// Each right partition is judged on its own; a left record may receive
    /// one best candidate per right partition.
    #[default]
    PerPartition,
    /// The policy is applied over the whole right scan. Selected candidates
    /// and their right rows are held until the left partition is done, so
    /// memory grows with the number of survivors.
    Global,
}
