use crate::error::ConfigError;
use crate::matching::{
    DisplaySelection, MatchOptions, MatchSpecification, SelectionScope, SimilarityMetric,
};
use crate::models::{RelationRef, Row};

const MATCH_KEY: &str = "match_key";

/// Layout of one side of the match: the relation, the prefix of its output
/// columns and the attributes projected into the reduced set.
#[derive(Debug, Clone)]
pub struct SideLayout {
    pub relation: RelationRef,
    pub prefix: String,
    pub key_attributes: Vec<String>,
    /// Key attributes plus displayed attributes, in relation order.
    pub projection: Vec<String>,
    /// Position of each key attribute (in key order) within `projection`.
    pub key_positions: Vec<usize>,
}

impl SideLayout {
    fn build(
        side: &'static str,
        relation: RelationRef,
        prefix: String,
        key_attributes: &[String],
        display: &DisplaySelection,
    ) -> Result<Self, ConfigError> {
        if relation.columns.is_empty() {
            return Err(ConfigError::invalid(
                side,
                format!("relation {} does not exist or has no columns", relation.name),
            ));
        }
        for attr in key_attributes {
            if !relation.has_column(attr) {
                return Err(ConfigError::invalid(
                    side,
                    format!("{} is not an attribute of {}", attr, relation.name),
                ));
            }
        }
        let projection: Vec<String> = relation
            .columns
            .iter()
            .filter(|c| key_attributes.contains(c) || display.allows(c))
            .cloned()
            .collect();
        if let Some(c) = projection.iter().find(|c| c.eq_ignore_ascii_case(MATCH_KEY)) {
            return Err(ConfigError::invalid(
                side,
                format!(
                    "{}.{} clashes with the exact-match key column; leave it out of the display list",
                    relation.name, c
                ),
            ));
        }
        let key_positions = key_attributes
            .iter()
            .map(|k| projection.iter().position(|c| c == k).unwrap_or_default())
            .collect();
        Ok(Self {
            relation,
            prefix,
            key_attributes: key_attributes.to_vec(),
            projection,
            key_positions,
        })
    }

    pub fn prefixed(&self, attribute: &str) -> String {
        format!("{}_{}", self.prefix, attribute)
    }

    pub fn prefixed_projection(&self) -> Vec<String> {
        self.projection.iter().map(|c| self.prefixed(c)).collect()
    }

    /// Column of the SQL composite key built by the exact stage.
    pub fn match_key_column(&self) -> String {
        self.prefixed(MATCH_KEY)
    }

    /// Column carrying the fuzzy composite key in the fuzzy output. For a
    /// single key attribute this is the attribute column itself.
    pub fn key_column(&self) -> String {
        match self.key_attributes.as_slice() {
            [single] => self.prefixed(single),
            _ => self.prefixed("key"),
        }
    }
}

/// Per-attribute exact flag for one (left, right) key pair.
#[derive(Debug, Clone)]
pub struct AttributePair {
    pub column: String,
    /// Positions within the left and right projections.
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone)]
pub struct Transposition {
    pub column: String,
    /// Positions within the left key attribute list.
    pub first: usize,
    pub second: usize,
}

/// Positions of the diagnostic values within a fuzzy output row.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub columns: Vec<String>,
    /// Columns appended after the projected attributes.
    pub extra_columns: Vec<String>,
    pub match_exact: usize,
    pub scores: [(SimilarityMetric, usize); 3],
    pub pair_flags: Vec<usize>,
    pub left_key: usize,
    pub right_key: usize,
    pub transposition: Option<usize>,
}

impl OutputLayout {
    /// Slot for `name`: an existing column is reused, otherwise the column is
    /// appended.
    fn slot(&mut self, name: String, expected_overlap: bool) -> usize {
        if let Some(i) = self.columns.iter().position(|c| *c == name) {
            if expected_overlap {
                log::debug!("{} doubles as key column", name);
            } else {
                log::warn!("Overwriting existing attribute {} in fuzzy output", name);
            }
            return i;
        }
        self.columns.push(name.clone());
        self.extra_columns.push(name);
        self.columns.len() - 1
    }

    pub fn empty_row(&self) -> Row {
        vec![None; self.columns.len()]
    }
}

/// Everything derived from the specification and the two relations before
/// any store work starts. Built once per run and only read afterwards.
#[derive(Debug, Clone)]
pub struct MatchContext {
    pub target: String,
    pub left: SideLayout,
    pub right: SideLayout,
    pub options: MatchOptions,
    pub pairs: Vec<AttributePair>,
    pub transposition: Option<Transposition>,
    pub output: OutputLayout,
}

fn flag_value(b: bool) -> String {
    if b { "yes".into() } else { "no".into() }
}

impl MatchContext {
    pub fn new(
        left: RelationRef,
        right: RelationRef,
        spec: &MatchSpecification,
        target: &str,
        scope_override: Option<SelectionScope>,
    ) -> Result<Self, ConfigError> {
        let mut options = spec.options().clone();
        if let Some(scope) = scope_override {
            options.selection_scope = scope;
        }

        let (left_prefix, right_prefix) = if left.name.eq_ignore_ascii_case(&right.name) {
            (format!("{}_left", left.name), format!("{}_right", right.name))
        } else {
            (left.name.clone(), right.name.clone())
        };
        let left = SideLayout::build(
            "left_attributes",
            left,
            left_prefix,
            spec.left_attributes(),
            &options.display_left,
        )?;
        let right = SideLayout::build(
            "right_attributes",
            right,
            right_prefix,
            spec.right_attributes(),
            &options.display_right,
        )?;

        let pairs: Vec<AttributePair> = if spec.tracks_attribute_pairs() {
            left.key_attributes
                .iter()
                .zip(right.key_attributes.iter())
                .enumerate()
                .map(|(i, (l, r))| {
                    let column = if l.eq_ignore_ascii_case(r) {
                        format!("match_exact_{}", l)
                    } else {
                        format!("match_exact_{}_{}", l, r)
                    };
                    AttributePair {
                        column,
                        left: left.key_positions[i],
                        right: right.key_positions[i],
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let transposition = options.transposition_check.as_ref().and_then(|(a, b)| {
            let first = left.key_attributes.iter().position(|k| k == a)?;
            let second = left.key_attributes.iter().position(|k| k == b)?;
            Some(Transposition {
                column: format!("swap_{}_{}_to_match", a, b),
                first,
                second,
            })
        });

        let mut columns = left.prefixed_projection();
        columns.extend(right.prefixed_projection());
        let mut output = OutputLayout {
            columns,
            extra_columns: Vec::new(),
            match_exact: 0,
            scores: [
                (SimilarityMetric::Dice, 0),
                (SimilarityMetric::Jaro, 0),
                (SimilarityMetric::JaroWinkler, 0),
            ],
            pair_flags: Vec::new(),
            left_key: 0,
            right_key: 0,
            transposition: None,
        };
        output.match_exact = output.slot("match_exact".into(), false);
        for i in 0..output.scores.len() {
            let metric = output.scores[i].0;
            output.scores[i].1 = output.slot(metric.column().into(), false);
        }
        output.pair_flags = pairs
            .iter()
            .map(|p| output.slot(p.column.clone(), false))
            .collect();
        output.left_key = output.slot(left.key_column(), left.key_attributes.len() == 1);
        output.right_key = output.slot(right.key_column(), right.key_attributes.len() == 1);
        output.transposition = transposition
            .as_ref()
            .map(|t| output.slot(t.column.clone(), false));

        Ok(Self {
            target: target.to_string(),
            left,
            right,
            options,
            pairs,
            transposition,
            output,
        })
    }

    pub fn exact_matches_name(&self) -> String {
        format!("{}_exact_matches", self.target)
    }

    pub fn fuzzy_matches_name(&self) -> String {
        format!("{}_fuzzy_matches", self.target)
    }

    /// Project a selected candidate into a fuzzy output row.
    pub fn output_row(
        &self,
        candidate: &crate::matching::MatchCandidate,
        left_row: &Row,
        right_row: &Row,
    ) -> Row {
        let out = &self.output;
        let mut row = out.empty_row();
        let n_left = self.left.projection.len();
        for (i, v) in left_row.iter().take(n_left).enumerate() {
            row[i] = v.clone();
        }
        for (i, v) in right_row.iter().take(self.right.projection.len()).enumerate() {
            row[n_left + i] = v.clone();
        }
        row[out.match_exact] = Some(flag_value(candidate.overall_exact));
        if let Some(scores) = &candidate.scores {
            for (metric, slot) in out.scores {
                row[slot] = Some(scores.get(metric).to_string());
            }
        }
        for (slot, exact) in out.pair_flags.iter().zip(&candidate.per_attribute_exact) {
            row[*slot] = Some(flag_value(*exact));
        }
        row[out.left_key] = Some(candidate.left_key.clone());
        row[out.right_key] = Some(candidate.right_key.clone());
        if let (Some(slot), Some(hit)) = (out.transposition, candidate.transposition) {
            row[slot] = Some(flag_value(hit));
        }
        row
    }
}
