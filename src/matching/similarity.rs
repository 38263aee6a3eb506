//! String similarity metrics. Every metric returns a score in [0, 1].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub fn jaro(a: &str, b: &str) -> f64 {
    strsim::jaro(a, b)
}

pub fn jaro_winkler(a: &str, b: &str) -> f64 {
    strsim::jaro_winkler(a, b)
}

fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Sørensen–Dice coefficient over the character bigram sets of the
/// lower-cased inputs.
pub fn dice(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    let ba = bigrams(&a);
    let bb = bigrams(&b);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }
    let common = ba.intersection(&bb).count();
    (2 * common) as f64 / (ba.len() + bb.len()) as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityMetric {
    Dice,
    Jaro,
    JaroWinkler,
}

impl SimilarityMetric {
    pub const ALL: [SimilarityMetric; 3] = [
        SimilarityMetric::Dice,
        SimilarityMetric::Jaro,
        SimilarityMetric::JaroWinkler,
    ];

    pub fn score(self, a: &str, b: &str) -> f64 {
        match self {
            SimilarityMetric::Dice => dice(a, b),
            SimilarityMetric::Jaro => jaro(a, b),
            SimilarityMetric::JaroWinkler => jaro_winkler(a, b),
        }
    }

    /// Column of the fuzzy output relation carrying this metric.
    pub fn column(self) -> &'static str {
        match self {
            SimilarityMetric::Dice => "match_dice",
            SimilarityMetric::Jaro => "match_jaro",
            SimilarityMetric::JaroWinkler => "match_jarowinkler",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SimilarityScores {
    pub dice: f64,
    pub jaro: f64,
    pub jaro_winkler: f64,
}

impl SimilarityScores {
    pub fn compute(a: &str, b: &str) -> Self {
        let [dice, jaro, jaro_winkler] = SimilarityMetric::ALL.map(|m| m.score(a, b));
        Self {
            dice,
            jaro,
            jaro_winkler,
        }
    }

    pub fn get(&self, metric: SimilarityMetric) -> f64 {
        match metric {
            SimilarityMetric::Dice => self.dice,
            SimilarityMetric::Jaro => self.jaro,
            SimilarityMetric::JaroWinkler => self.jaro_winkler,
        }
    }

    /// Unweighted mean, used to rank candidates for best-only selection.
    pub fn mean(&self) -> f64 {
        (self.dice + self.jaro + self.jaro_winkler) / 3.0
    }

    /// True when at least one score is strictly greater than `threshold`.
    pub fn any_above(&self, threshold: f64) -> bool {
        self.dice > threshold || self.jaro > threshold || self.jaro_winkler > threshold
    }
}
