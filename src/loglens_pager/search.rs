use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::PagerError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SearchOptions {
    /// Treat the query as a regular expression. `/pattern/` is a regex either way.
    #[serde(default)]
    pub regex: bool,
    /// Inclusive logical range to search within, in the current (possibly filtered) space.
    #[serde(default)]
    pub range: Option<(u64, u64)>,
    /// Stop after this many hits.
    #[serde(default)]
    pub top: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub idx: u64,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub version: u64,
    pub hits: Vec<SearchHit>,
}

#[derive(Clone, Debug)]
pub(crate) enum QueryMatcher {
    Substring(String),
    Regex(Regex),
}

impl QueryMatcher {
    pub(crate) fn matches(&self, text: &str) -> bool {
        match self {
            QueryMatcher::Substring(query) => text.to_lowercase().contains(query.as_str()),
            QueryMatcher::Regex(regex) => regex.is_match(text),
        }
    }
}

pub(crate) fn compile_query(query: &str, regex: bool) -> Result<Option<QueryMatcher>, PagerError> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(None);
    }

    if regex {
        let pattern = strip_regex_delimiters(query).unwrap_or(query);
        return Ok(Some(QueryMatcher::Regex(compile_regex(pattern)?)));
    }

    if let Some(pattern) = strip_regex_delimiters(query) {
        return Ok(Some(QueryMatcher::Regex(compile_regex(pattern)?)));
    }

    Ok(Some(QueryMatcher::Substring(query.to_lowercase())))
}

fn strip_regex_delimiters(query: &str) -> Option<&str> {
    query.strip_prefix('/').and_then(|q| q.strip_suffix('/')).filter(|q| !q.is_empty())
}

fn compile_regex(pattern: &str) -> Result<Regex, PagerError> {
    RegexBuilder::new(pattern).case_insensitive(true).build().map_err(|error| {
        PagerError::InvalidRegex { pattern: pattern.to_string(), message: error.to_string() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DEAUTH", false, "sta deauth reason 3", true)]
    #[case("deauth", false, "assoc ok", false)]
    #[case("/de.uth/", false, "STA DEAUTH", true)]
    #[case("reason \\d+", true, "reason 3", true)]
    #[case("reason \\d+", false, "reason 3", false)]
    fn matcher_follows_mode(
        #[case] query: &str,
        #[case] regex: bool,
        #[case] text: &str,
        #[case] expected: bool,
    ) {
        let matcher = compile_query(query, regex).expect("compile").expect("matcher");
        assert_eq!(matcher.matches(text), expected);
    }

    #[test]
    fn blank_query_has_no_matcher() {
        assert!(compile_query("   ", true).expect("compile").is_none());
    }

    #[test]
    fn invalid_regex_is_reported_with_pattern() {
        let err = compile_query("/(/", false).unwrap_err();
        assert!(matches!(err, PagerError::InvalidRegex { ref pattern, .. } if pattern == "("));
    }
}
