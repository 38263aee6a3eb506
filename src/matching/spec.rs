use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::SelectionScope;
use crate::error::ConfigError;

/// Accept every non-exact candidate. Scores are never negative, so with this
/// threshold the fuzzy output grows with left × right; set a real threshold
/// or best-only selection for anything but small inputs.
pub const DEFAULT_THRESHOLD: f64 = -1.0;

/// Which non-key attributes of one side are carried into the outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplaySelection {
    All,
    /// Attribute names, compared case-insensitively. Key attributes are
    /// always displayed.
    Only(BTreeSet<String>),
}

impl Default for DisplaySelection {
    fn default() -> Self {
        DisplaySelection::Only(BTreeSet::new())
    }
}

impl DisplaySelection {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        DisplaySelection::Only(
            names
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn allows(&self, attribute: &str) -> bool {
        match self {
            DisplaySelection::All => true,
            DisplaySelection::Only(set) => set.contains(&attribute.to_lowercase()),
        }
    }
}

/// One option of a match request. Later options of the same kind replace
/// earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchOption {
    Threshold(f64),
    SuppressSecondBest,
    /// Flag candidates whose left key matches the right key once the values
    /// of these two left attributes are swapped.
    TranspositionCheck(String, String),
    DisplayLeft(DisplaySelection),
    DisplayRight(DisplaySelection),
    /// Exactly matched left rows still compete in fuzzy matching.
    HungryLeft,
    /// Exactly matched right rows are withdrawn from fuzzy matching.
    GreedyLeft,
    SelectionScope(SelectionScope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOptions {
    pub threshold: f64,
    pub suppress_second_best: bool,
    pub transposition_check: Option<(String, String)>,
    pub display_left: DisplaySelection,
    pub display_right: DisplaySelection,
    pub hungry_left: bool,
    pub greedy_left: bool,
    pub selection_scope: SelectionScope,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            suppress_second_best: false,
            transposition_check: None,
            display_left: DisplaySelection::default(),
            display_right: DisplaySelection::default(),
            hungry_left: false,
            greedy_left: false,
            selection_scope: SelectionScope::default(),
        }
    }
}

impl MatchOptions {
    pub fn from_options<'a>(options: impl IntoIterator<Item = &'a MatchOption>) -> Self {
        let mut out = Self::default();
        for opt in options {
            match opt {
                MatchOption::Threshold(t) => out.threshold = *t,
                MatchOption::SuppressSecondBest => out.suppress_second_best = true,
                MatchOption::TranspositionCheck(a, b) => {
                    out.transposition_check = Some((a.trim().to_string(), b.trim().to_string()))
                }
                MatchOption::DisplayLeft(d) => out.display_left = d.clone(),
                MatchOption::DisplayRight(d) => out.display_right = d.clone(),
                MatchOption::HungryLeft => out.hungry_left = true,
                MatchOption::GreedyLeft => out.greedy_left = true,
                MatchOption::SelectionScope(s) => out.selection_scope = *s,
            }
        }
        out
    }
}

/// Attribute lists plus options of one match request. Validated on
/// construction and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSpecification")]
pub struct MatchSpecification {
    left_attributes: Vec<String>,
    right_attributes: Vec<String>,
    options: MatchOptions,
}

#[derive(Deserialize)]
struct RawSpecification {
    left_attributes: Vec<String>,
    right_attributes: Vec<String>,
    #[serde(default)]
    options: MatchOptions,
}

impl TryFrom<RawSpecification> for MatchSpecification {
    type Error = ConfigError;

    fn try_from(raw: RawSpecification) -> Result<Self, Self::Error> {
        Self::with_options(raw.left_attributes, raw.right_attributes, raw.options)
    }
}

fn clean_attributes(field: &'static str, attrs: Vec<String>) -> Result<Vec<String>, ConfigError> {
    if attrs.is_empty() {
        return Err(ConfigError::MissingField { field });
    }
    let cleaned: Vec<String> = attrs.into_iter().map(|a| a.trim().to_string()).collect();
    if cleaned.iter().any(|a| a.is_empty()) {
        return Err(ConfigError::invalid(field, "blank attribute name"));
    }
    Ok(cleaned)
}

impl MatchSpecification {
    pub fn new(
        left_attributes: Vec<String>,
        right_attributes: Vec<String>,
        options: &[MatchOption],
    ) -> Result<Self, ConfigError> {
        Self::with_options(
            left_attributes,
            right_attributes,
            MatchOptions::from_options(options),
        )
    }

    pub fn with_options(
        left_attributes: Vec<String>,
        right_attributes: Vec<String>,
        options: MatchOptions,
    ) -> Result<Self, ConfigError> {
        let left_attributes = clean_attributes("left_attributes", left_attributes)?;
        let right_attributes = clean_attributes("right_attributes", right_attributes)?;
        if !options.threshold.is_finite() {
            return Err(ConfigError::invalid(
                "threshold",
                format!("not a finite number: {}", options.threshold),
            ));
        }
        if let Some((a, b)) = &options.transposition_check {
            for attr in [a, b] {
                if !left_attributes.contains(attr) {
                    return Err(ConfigError::invalid(
                        "transposition_check",
                        format!("{} is not a left key attribute", attr),
                    ));
                }
            }
            if a == b {
                return Err(ConfigError::invalid(
                    "transposition_check",
                    format!("cannot swap {} with itself", a),
                ));
            }
        }
        Ok(Self {
            left_attributes,
            right_attributes,
            options,
        })
    }

    pub fn left_attributes(&self) -> &[String] {
        &self.left_attributes
    }

    pub fn right_attributes(&self) -> &[String] {
        &self.right_attributes
    }

    pub fn options(&self) -> &MatchOptions {
        &self.options
    }

    /// Per-attribute exact flags are only tracked for lists of equal length.
    pub fn tracks_attribute_pairs(&self) -> bool {
        self.left_attributes.len() == self.right_attributes.len()
    }
}

/// Split on commas that are not nested inside parentheses.
fn split_top_level(input: &str) -> Result<Vec<&str>, ConfigError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(ConfigError::invalid("with", "unbalanced ')'"));
                }
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ConfigError::invalid("with", "unbalanced '('"));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

/// Split `name(args)` into the lower-cased name and the raw argument text.
fn split_call(token: &str) -> Result<(String, Option<&str>), ConfigError> {
    match token.find('(') {
        None => Ok((token.trim().to_lowercase(), None)),
        Some(open) => {
            let rest = token[open + 1..].trim_end();
            let args = rest.strip_suffix(')').ok_or_else(|| {
                ConfigError::invalid("with", format!("missing ')' in {}", token.trim()))
            })?;
            Ok((token[..open].trim().to_lowercase(), Some(args)))
        }
    }
}

fn require_args<'a>(name: &str, args: Option<&'a str>) -> Result<&'a str, ConfigError> {
    args.ok_or_else(|| ConfigError::invalid("with", format!("{} needs arguments", name)))
}

fn parse_display(args: &str) -> DisplaySelection {
    if args.split(',').any(|a| a.trim() == "*") {
        DisplaySelection::All
    } else {
        DisplaySelection::only(args.split(','))
    }
}

/// Parse an attribute list such as `"first, last"`.
pub fn parse_attribute_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a textual option list such as
/// `threshold(0.8), suppresssecondbest, displayleft(*)`.
/// Option names are case-insensitive; `legastodetect` is the transposition
/// check and `globalbest` selects the global selection scope.
pub fn parse_with_clause(input: &str) -> Result<Vec<MatchOption>, ConfigError> {
    let mut out = Vec::new();
    for token in split_top_level(input)? {
        if token.trim().is_empty() {
            continue;
        }
        let (name, args) = split_call(token)?;
        let opt = match name.as_str() {
            "threshold" => {
                let raw = require_args(&name, args)?.trim();
                let t: f64 = raw.parse().map_err(|_| {
                    ConfigError::invalid("threshold", format!("not a number: {:?}", raw))
                })?;
                MatchOption::Threshold(t)
            }
            "suppresssecondbest" => MatchOption::SuppressSecondBest,
            "legastodetect" => {
                let attrs = parse_attribute_list(require_args(&name, args)?);
                match attrs.as_slice() {
                    [a, b] => MatchOption::TranspositionCheck(a.clone(), b.clone()),
                    _ => {
                        return Err(ConfigError::invalid(
                            "transposition_check",
                            "legastodetect takes exactly two attributes",
                        ));
                    }
                }
            }
            "displayleft" => MatchOption::DisplayLeft(parse_display(require_args(&name, args)?)),
            "displayright" => MatchOption::DisplayRight(parse_display(require_args(&name, args)?)),
            "hungryleft" => MatchOption::HungryLeft,
            "greedyleft" => MatchOption::GreedyLeft,
            "globalbest" => MatchOption::SelectionScope(SelectionScope::Global),
            other => {
                return Err(ConfigError::invalid(
                    "with",
                    format!("unknown option {:?}", other),
                ));
            }
        };
        out.push(opt);
    }
    Ok(out)
}
