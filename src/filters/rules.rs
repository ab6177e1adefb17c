//! Filter rule trees
//!
//! A rule is a boolean combinator (`and`/`or`) over conditions; a condition
//! is either a header match or a nested rule. Rules are parsed from their
//! configuration form into this typed tree at load time, so unknown
//! operators and malformed conditions are configuration errors, never
//! runtime surprises.

use serde::de;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::mail::Mail;

/// Boolean combinator over an ordered list of conditions
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

/// One condition inside a rule
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Match patterns against a header's value(s); a `!` suffix on the
    /// configured header name inverts the result
    Header {
        name: String,
        negate: bool,
        patterns: Vec<String>,
    },
    /// A nested `and`/`or` rule
    Nested(Rule),
}

impl Rule {
    /// Parse the configuration form of a rule: a single-key mapping from
    /// operator to condition list
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| format!("rule must be a mapping, got: {}", value))?;
        let (operator, conditions) = match map.iter().next() {
            Some(entry) if map.len() == 1 => entry,
            _ => {
                return Err(format!(
                    "rule must have exactly one operator key, got {} keys",
                    map.len()
                ))
            }
        };

        let conditions = conditions
            .as_array()
            .ok_or_else(|| format!("conditions of '{}' must be a list", operator))?
            .iter()
            .map(Condition::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        match operator.as_str() {
            "and" => Ok(Rule::And(conditions)),
            "or" => Ok(Rule::Or(conditions)),
            other => Err(format!("rule operator '{}' is not supported", other)),
        }
    }

    /// Evaluate the rule against a mail's headers
    ///
    /// `and` fails on the first false condition, `or` succeeds on the first
    /// true one; an empty `or` is false, an empty `and` true.
    pub fn matches(&self, mail: &Mail) -> bool {
        match self {
            Rule::And(conditions) => conditions.iter().all(|c| c.matches(mail)),
            Rule::Or(conditions) => conditions.iter().any(|c| c.matches(mail)),
        }
    }
}

impl Condition {
    fn from_value(value: &Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| format!("condition must be a mapping, got: {}", value))?;
        let (key, patterns) = match map.iter().next() {
            Some(entry) if map.len() == 1 => entry,
            _ => {
                return Err(format!(
                    "condition must have exactly one key, got {} keys",
                    map.len()
                ))
            }
        };

        if key.as_str() == "and" || key.as_str() == "or" {
            return Ok(Condition::Nested(Rule::from_value(value)?));
        }

        let (name, negate) = match key.strip_suffix('!') {
            Some(name) => (name.to_string(), true),
            None => (key.clone(), false),
        };

        let patterns = match patterns {
            Value::String(pattern) => vec![pattern.clone()],
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        format!("pattern for header '{}' must be a string, got: {}", name, item)
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(format!(
                    "patterns for header '{}' must be a string or list of strings, got: {}",
                    name, other
                ))
            }
        };

        Ok(Condition::Header {
            name,
            negate,
            patterns,
        })
    }

    fn matches(&self, mail: &Mail) -> bool {
        match self {
            Condition::Nested(rule) => rule.matches(mail),
            Condition::Header {
                name,
                negate,
                patterns,
            } => {
                // a missing header never matches, negated or not; most
                // headers are optional and rules must fail open
                let values = match mail.get_header_values(name) {
                    Some(values) => values,
                    None => return false,
                };
                let matched = values
                    .iter()
                    .any(|value| patterns.iter().any(|pattern| check_match(value, pattern)));
                matched != *negate
            }
        }
    }
}

impl<'de> Deserialize<'de> for Rule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Rule::from_value(&value).map_err(de::Error::custom)
    }
}

/// Test whether a header value matches a pattern
///
/// Matching is case-insensitive. The pattern is first tried as a literal
/// substring; when that fails it is additionally compiled as a regular
/// expression and matched against the start of the value. The regex
/// fallback runs for every pattern, not just ones that look like regexes,
/// so characters such as `.` or `+` are regex-special even in plain-looking
/// patterns. A pattern that does not compile simply never regex-matches.
pub fn check_match(value: &str, pattern: &str) -> bool {
    if value.is_empty() {
        return false;
    }

    if value.to_lowercase().contains(&pattern.to_lowercase()) {
        return true;
    }

    match regex_lite::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.find(value).map_or(false, |m| m.start() == 0),
        Err(err) => {
            log::debug!("Pattern '{}' is not a valid regex: {}", pattern, err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::HeaderMap;

    fn test_mail() -> Mail {
        let mut headers = HeaderMap::new();
        headers.set("From", "sales@example.com");
        headers.set("To", "<me@example.net>");
        headers.set("Subject", "Quarterly report");
        headers.append("Received", "from relay-1.example.com");
        headers.append("Received", "from relay-2.example.org");
        Mail::new(headers, "body")
    }

    fn rule(json: &str) -> Rule {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_check_match_substring() {
        assert!(check_match("foo@example.com", "@example.com"));
        assert!(check_match("foo@example.com", "foo@example.com"));
        assert!(check_match("foo", "foo"));
        assert!(check_match("Sönderzäichen", "nderz"));
        assert!(check_match("Sönderzäichen", "Sönder"));
        assert!(!check_match("", "foo"));
        assert!(!check_match("foo", "bar"));
    }

    #[test]
    fn test_check_match_is_case_insensitive() {
        assert!(check_match("UPPERCASE", "Uppercase"));
        assert!(check_match("lowercase", "LOWERCASE"));
        assert!(check_match("foo@Example.COM", "^.*@example.com$"));
    }

    #[test]
    fn test_check_match_regex() {
        assert!(check_match("foo", "^.*$"));
        assert!(check_match("foo", "^fo+$"));
        assert!(check_match("foo@example.com", "^.*@example.com$"));
        assert!(check_match("foo@example.com", "^.*@example.(com|net)$"));
        assert!(check_match("Sönderzäichen", "^Sönder.*"));
        assert!(!check_match("foo", "^fo+!$"));
    }

    #[test]
    fn test_check_match_regex_is_anchored_at_start() {
        // "example" matches as a substring, "^example" must not
        assert!(!check_match("foo@example.com", "^example"));
        assert!(check_match("foo@example.com", "^foo"));
    }

    #[test]
    fn test_check_match_invalid_regex_is_no_match() {
        assert!(!check_match("foo", "fo(o"));
        // still matches as a substring before the regex is even tried
        assert!(check_match("fo(o)", "fo(o"));
    }

    #[test]
    fn test_and_requires_all_conditions() {
        let mail = test_mail();
        assert!(rule(r#"{"and": [{"from": "example.com"}, {"subject": "report"}]}"#).matches(&mail));
        assert!(!rule(r#"{"and": [{"from": "example.com"}, {"subject": "invoice"}]}"#).matches(&mail));
    }

    #[test]
    fn test_or_requires_one_condition() {
        let mail = test_mail();
        assert!(rule(r#"{"or": [{"from": "nomatch"}, {"subject": "report"}]}"#).matches(&mail));
        assert!(!rule(r#"{"or": [{"from": "nomatch"}, {"subject": "invoice"}]}"#).matches(&mail));
    }

    #[test]
    fn test_empty_condition_lists() {
        let mail = test_mail();
        // vacuous conjunction is true, vacuous disjunction false
        assert!(rule(r#"{"and": []}"#).matches(&mail));
        assert!(!rule(r#"{"or": []}"#).matches(&mail));
    }

    #[test]
    fn test_missing_header_is_false_even_negated() {
        let mail = test_mail();
        assert!(!rule(r#"{"and": [{"list-id": "foo"}]}"#).matches(&mail));
        assert!(!rule(r#"{"and": [{"list-id!": "foo"}]}"#).matches(&mail));
    }

    #[test]
    fn test_negated_condition() {
        let mail = test_mail();
        assert!(!rule(r#"{"and": [{"from!": "example.com"}]}"#).matches(&mail));
        assert!(rule(r#"{"and": [{"from!": "example.org"}]}"#).matches(&mail));
    }

    #[test]
    fn test_multiple_patterns_match_any() {
        let mail = test_mail();
        assert!(rule(r#"{"and": [{"from": ["nomatch", "example.com"]}]}"#).matches(&mail));
        assert!(!rule(r#"{"and": [{"from": ["nomatch", "also-nomatch"]}]}"#).matches(&mail));
    }

    #[test]
    fn test_repeated_header_matches_any_value() {
        let mail = test_mail();
        assert!(rule(r#"{"and": [{"received": "relay-2.example.org"}]}"#).matches(&mail));
        assert!(rule(r#"{"and": [{"received": "relay-1"}]}"#).matches(&mail));
        assert!(!rule(r#"{"and": [{"received": "relay-3"}]}"#).matches(&mail));
    }

    #[test]
    fn test_nested_rules() {
        let mail = test_mail();
        let nested = rule(
            r#"{"and": [
                {"from": "example.com"},
                {"or": [{"subject": "invoice"}, {"subject": "report"}]}
            ]}"#,
        );
        assert!(nested.matches(&mail));

        let nested = rule(
            r#"{"or": [
                {"from": "nomatch"},
                {"and": [{"subject": "report"}, {"to": "example.net"}]}
            ]}"#,
        );
        assert!(nested.matches(&mail));
    }

    #[test]
    fn test_header_names_are_case_insensitive() {
        let mail = test_mail();
        assert!(rule(r#"{"and": [{"FROM": "example.com"}]}"#).matches(&mail));
        assert!(rule(r#"{"and": [{"sUbJeCt": "report"}]}"#).matches(&mail));
    }

    #[test]
    fn test_unknown_operator_is_rejected_at_parse_time() {
        let err = serde_json::from_str::<Rule>(r#"{"xor": [{"from": "x"}]}"#).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_malformed_rules_are_rejected() {
        assert!(serde_json::from_str::<Rule>(r#"["and"]"#).is_err());
        assert!(serde_json::from_str::<Rule>(r#"{"and": [{"from": 42}]}"#).is_err());
        assert!(serde_json::from_str::<Rule>(r#"{"and": [{"from": "x", "to": "y"}]}"#).is_err());
        assert!(serde_json::from_str::<Rule>(r#"{"and": "from"}"#).is_err());
    }

    #[test]
    fn test_negation_suffix_is_stripped_from_name() {
        let parsed = rule(r#"{"and": [{"from!": "x"}]}"#);
        match parsed {
            Rule::And(conditions) => match &conditions[0] {
                Condition::Header { name, negate, .. } => {
                    assert_eq!(name, "from");
                    assert!(*negate);
                }
                other => panic!("expected header condition, got {:?}", other),
            },
            other => panic!("expected and rule, got {:?}", other),
        }
    }
}
