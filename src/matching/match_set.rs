use super::candidate::MatchCandidate;
use super::spec::MatchOptions;
use crate::engine::context::MatchContext;
use crate::models::Row;

/// Positions of the candidates retained by the selection policy:
/// every exact candidate when there is one, otherwise the single best by
/// mean score under suppress-second-best (first wins ties), otherwise every
/// candidate with a score strictly above the threshold.
pub fn select_indices<'a, I>(candidates: I, options: &MatchOptions) -> Vec<usize>
where
    I: IntoIterator<Item = &'a MatchCandidate>,
{
    let candidates: Vec<&MatchCandidate> = candidates.into_iter().collect();

    let exact: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_exact())
        .map(|(i, _)| i)
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    if options.suppress_second_best {
        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let score = c.mean_score();
            if best.is_none_or(|(_, b)| score > b) {
                best = Some((i, score));
            }
        }
        return best.map(|(i, _)| vec![i]).unwrap_or_default();
    }

    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.passes(options.threshold))
        .map(|(i, _)| i)
        .collect()
}

/// Candidates of one left record against one scanned right batch.
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    candidates: Vec<MatchCandidate>,
}

impl MatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score `left_row` against every row of `right_rows`.
    pub fn score_batch(left_row: &Row, right_rows: &[Row], ctx: &MatchContext) -> Self {
        let mut set = Self::new();
        for (i, r) in right_rows.iter().enumerate() {
            set.push(MatchCandidate::score(left_row, r, i, ctx));
        }
        set
    }

    pub fn push(&mut self, candidate: MatchCandidate) {
        self.candidates.push(candidate);
    }

    #[cfg(test)]
    pub fn select(&self, options: &MatchOptions) -> Vec<&MatchCandidate> {
        select_indices(&self.candidates, options)
            .into_iter()
            .map(|i| &self.candidates[i])
            .collect()
    }

    pub fn into_selected(self, options: &MatchOptions) -> Vec<MatchCandidate> {
        let keep = select_indices(&self.candidates, options);
        let mut keep = keep.into_iter().peekable();
        self.candidates
            .into_iter()
            .enumerate()
            .filter_map(|(i, c)| {
                if keep.peek() == Some(&i) {
                    keep.next();
                    Some(c)
                } else {
                    None
                }
            })
            .collect()
    }
}
