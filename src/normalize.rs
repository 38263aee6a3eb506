//! Value normalisation shared by key building and comparison.

/// Separator of the in-memory composite key used for similarity scoring.
pub const FUZZY_KEY_SEPARATOR: &str = "*";

/// Separator of the SQL composite key used by the exact-match join.
pub const EXACT_KEY_SEPARATOR: &str = "_";

/// Null or absent values compare as empty strings.
#[inline]
pub fn value_or_empty(v: Option<&Option<String>>) -> &str {
    v.and_then(|o| o.as_deref()).unwrap_or("")
}

/// Characters removed from every value before exact keys are compared:
/// space, tab, line feed and carriage return.
pub const KEY_BLANKS: [char; 4] = [' ', '\t', '\n', '\r'];

/// Remove [`KEY_BLANKS`] the same way the SQL key expression does.
#[cfg(test)]
pub fn strip_blanks(input: &str) -> String {
    input.chars().filter(|c| !KEY_BLANKS.contains(c)).collect()
}

/// Pairwise equality used for per-attribute exact flags.
#[inline]
pub fn trimmed_eq(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Join raw values with the fuzzy separator, nulls as empty.
pub fn fuzzy_key<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            out.push_str(FUZZY_KEY_SEPARATOR);
        }
        out.push_str(v);
    }
    out
}

/// In-memory mirror of the SQL exact key: blanks stripped, `_`-joined.
#[cfg(test)]
pub fn exact_key<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    values
        .into_iter()
        .map(strip_blanks)
        .collect::<Vec<_>>()
        .join(EXACT_KEY_SEPARATOR)
}
