use super::similarity::SimilarityScores;
use crate::engine::context::MatchContext;
use crate::models::Row;
use crate::normalize::{fuzzy_key, trimmed_eq, value_or_empty};

/// One left record scored against one right record.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub left_key: String,
    pub right_key: String,
    /// Aligned with `MatchContext::pairs`; empty when the key lists differ
    /// in length.
    pub per_attribute_exact: Vec<bool>,
    pub overall_exact: bool,
    /// Only computed for non-exact candidates.
    pub scores: Option<SimilarityScores>,
    /// Only computed for non-exact candidates with a transposition check.
    pub transposition: Option<bool>,
    /// Position of the right record in the scanned batch.
    pub right_index: usize,
}

impl MatchCandidate {
    pub fn score(left_row: &Row, right_row: &Row, right_index: usize, ctx: &MatchContext) -> Self {
        let left_values: Vec<&str> = ctx
            .left
            .key_positions
            .iter()
            .map(|&i| value_or_empty(left_row.get(i)))
            .collect();
        let right_values: Vec<&str> = ctx
            .right
            .key_positions
            .iter()
            .map(|&i| value_or_empty(right_row.get(i)))
            .collect();

        let per_attribute_exact: Vec<bool> = ctx
            .pairs
            .iter()
            .map(|p| {
                trimmed_eq(
                    value_or_empty(left_row.get(p.left)),
                    value_or_empty(right_row.get(p.right)),
                )
            })
            .collect();
        // no pairs means the lists differ in length; never exact then
        let overall_exact = !per_attribute_exact.is_empty() && per_attribute_exact.iter().all(|e| *e);

        let left_key = fuzzy_key(left_values.iter().copied());
        let right_key = fuzzy_key(right_values.iter().copied());

        let (scores, transposition) = if overall_exact {
            (None, None)
        } else {
            let scores = SimilarityScores::compute(&left_key, &right_key);
            let transposition = ctx.transposition.as_ref().map(|t| {
                let mut swapped = left_values.clone();
                swapped.swap(t.first, t.second);
                trimmed_eq(&fuzzy_key(swapped), &right_key)
            });
            (Some(scores), transposition)
        };

        Self {
            left_key,
            right_key,
            per_attribute_exact,
            overall_exact,
            scores,
            transposition,
            right_index,
        }
    }

    pub fn is_exact(&self) -> bool {
        self.overall_exact
    }

    /// Ranking value for best-only selection; exact candidates rank highest.
    pub fn mean_score(&self) -> f64 {
        self.scores.map(|s| s.mean()).unwrap_or(1.0)
    }

    /// True when the candidate survives the threshold filter.
    pub fn passes(&self, threshold: f64) -> bool {
        match &self.scores {
            Some(s) => s.any_above(threshold),
            None => self.overall_exact,
        }
    }
}
