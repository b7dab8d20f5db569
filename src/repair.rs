use std::fmt;

use log::{debug, info};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Strategy patterns, compiled once
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
static KEY_MISSING_QUOTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""(protein|carbs|fat):"#).expect("valid regex"));
static BARE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([{,]\s*)(protein|carbs|fat)(\s*:)").expect("valid regex"));

/// Exact truncation signatures seen in assistant output and their fixes.
///
/// Each entry matches the end of a payload that was cut off one brace short
/// of closing its nested macros object.
pub const KNOWN_SIGNATURES: &[(&str, &str)] = &[
    ("\"fat\": 20}", "\"fat\": 20}}"),
    ("\"fat\": 20", "\"fat\": 20}}"),
];

/// Repair strategies in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStrategy {
    Direct,
    QuoteNormalization,
    TrailingCommas,
    UnquotedKeys,
    BalanceDelimiters,
    KnownSignature,
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairStrategy::Direct => write!(f, "direct parse"),
            RepairStrategy::QuoteNormalization => write!(f, "quote normalization"),
            RepairStrategy::TrailingCommas => write!(f, "trailing-comma removal"),
            RepairStrategy::UnquotedKeys => write!(f, "unquoted-key repair"),
            RepairStrategy::BalanceDelimiters => write!(f, "brace balancing"),
            RepairStrategy::KnownSignature => write!(f, "known signature"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub object: Map<String, Value>,
    pub strategy: RepairStrategy,
}

impl RepairOutcome {
    pub fn was_repaired(&self) -> bool {
        self.strategy != RepairStrategy::Direct
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("payload is empty")]
    Empty,

    #[error("no repair strategy produced a JSON object: {last_error}")]
    Exhausted { last_error: String },
}

/// Progressive JSON repair for command payloads.
///
/// Each strategy works on the output of the previous one and the first
/// candidate that parses strictly into a JSON object wins.
pub struct JsonRepairer;

impl JsonRepairer {
    pub fn new() -> Self {
        Self
    }

    pub fn repair(&self, candidate: &str) -> Result<RepairOutcome, RepairError> {
        if candidate.trim().is_empty() {
            return Err(RepairError::Empty);
        }

        let mut last_error = match parse_object(candidate) {
            Ok(object) => return Ok(RepairOutcome { object, strategy: RepairStrategy::Direct }),
            Err(e) => e,
        };

        let quoted = normalize_quotes(candidate);
        let no_commas = remove_trailing_commas(&quoted);
        let keyed = quote_known_keys(&no_commas);
        let balanced = balance_delimiters(&keyed);

        let mut attempts = vec![
            (RepairStrategy::QuoteNormalization, quoted),
            (RepairStrategy::TrailingCommas, no_commas),
            (RepairStrategy::UnquotedKeys, keyed.clone()),
            (RepairStrategy::BalanceDelimiters, balanced),
        ];
        // Signatures patch the unbalanced text; applying them after balancing would double the closers
        if let Some(patched) = apply_known_signatures(&keyed) {
            attempts.push((RepairStrategy::KnownSignature, patched));
        }

        for (strategy, text) in attempts {
            match parse_object(&text) {
                Ok(object) => {
                    info!("Repaired command payload with {}", strategy);
                    return Ok(RepairOutcome { object, strategy });
                }
                Err(e) => {
                    debug!("{} did not yield valid JSON: {}", strategy, e);
                    last_error = e;
                }
            }
        }

        Err(RepairError::Exhausted { last_error })
    }
}

impl Default for JsonRepairer {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(format!("expected a JSON object, found {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Every `'` becomes `"`. Apostrophes inside values are not told apart.
pub fn normalize_quotes(text: &str) -> String {
    text.replace('\'', "\"")
}

pub fn remove_trailing_commas(text: &str) -> String {
    TRAILING_COMMA.replace_all(text, "$1").into_owned()
}

/// Restore quotes around the macro keys the assistant tends to mangle.
pub fn quote_known_keys(text: &str) -> String {
    let closed = KEY_MISSING_QUOTE.replace_all(text, "\"$1\":");
    BARE_KEY.replace_all(&closed, "$1\"$2\"$3").into_owned()
}

/// Close whatever a truncated payload left open.
///
/// Open braces and brackets are tracked outside string literals; an
/// unterminated string is closed and a dangling comma dropped before the
/// missing closers are appended innermost first.
pub fn balance_delimiters(text: &str) -> String {
    let mut repaired = text.trim_end().to_string();
    let mut open: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in repaired.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => open.push('}'),
            '[' => open.push(']'),
            '}' | ']' => {
                if open.last() == Some(&c) {
                    open.pop();
                }
            }
            _ => {}
        }
    }

    if open.is_empty() && !in_string {
        return repaired;
    }

    if in_string {
        if escaped {
            repaired.pop();
        }
        repaired.push('"');
    } else if repaired.ends_with(',') {
        repaired.pop();
    }

    while let Some(closer) = open.pop() {
        repaired.push(closer);
    }
    repaired
}

pub fn apply_known_signatures(text: &str) -> Option<String> {
    let trimmed = text.trim_end();
    KNOWN_SIGNATURES.iter().find_map(|(signature, replacement)| {
        trimmed
            .strip_suffix(signature)
            .map(|head| format!("{}{}", head, replacement))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repair(text: &str) -> RepairOutcome {
        JsonRepairer::new().repair(text).unwrap()
    }

    #[test]
    fn test_valid_json_is_untouched() {
        let text = r#"{"goal_id": "g1", "nutrition_targets": [{"daily_calories": 2000}]}"#;
        let outcome = repair(text);
        assert_eq!(outcome.strategy, RepairStrategy::Direct);
        assert!(!outcome.was_repaired());
        assert_eq!(Value::Object(outcome.object), serde_json::from_str::<Value>(text).unwrap());
    }

    #[test]
    fn test_single_quoted_goal_payload() {
        let outcome = repair("{'goal_id': 'abc123', 'nutrition_targets': [{'daily_calories': 2000}]}");
        assert_eq!(outcome.strategy, RepairStrategy::QuoteNormalization);
        assert_eq!(outcome.object["goal_id"], json!("abc123"));
    }

    #[test]
    fn test_trailing_comma_alone_is_enough() {
        let text = r#"{"name": "rice", "amount": 200,}"#;
        let fixed = remove_trailing_commas(text);
        assert!(serde_json::from_str::<Value>(&fixed).is_ok());
        assert_eq!(repair(text).strategy, RepairStrategy::TrailingCommas);

        let in_array = r#"{"items": [1, 2, ]}"#;
        assert!(serde_json::from_str::<Value>(&remove_trailing_commas(in_array)).is_ok());
    }

    #[test]
    fn test_unquoted_macro_keys() {
        assert_eq!(quote_known_keys(r#"{"protein: 40}"#), r#"{"protein": 40}"#);
        assert_eq!(
            quote_known_keys(r#"{"calories": 500, carbs: 60, fat :10}"#),
            r#"{"calories": 500, "carbs": 60, "fat" :10}"#
        );
        let outcome = repair(r#"{"calories": 500, "protein: 40, carbs: 60}"#);
        assert_eq!(outcome.strategy, RepairStrategy::UnquotedKeys);
        assert_eq!(outcome.object["carbs"], json!(60));
    }

    #[test]
    fn test_unrelated_keys_are_left_alone() {
        let text = r#"{"proteins": 1, "fatty": 2}"#;
        assert_eq!(quote_known_keys(text), text);
    }

    #[test]
    fn test_truncated_meal_suggestion() {
        let text = r#"{"meal_type": "dinner", "time_of_day": "evening", "preference": "high-protein", "remaining_macros": {"calories": 600, "protein": 40, "carbs": 50, "fat": 20}"#;
        let balanced = balance_delimiters(text);
        assert_eq!(balanced, format!("{}}}", text));

        let outcome = repair(text);
        assert_eq!(outcome.strategy, RepairStrategy::BalanceDelimiters);
        assert_eq!(outcome.object["remaining_macros"]["fat"], json!(20));
    }

    #[test]
    fn test_balancing_appends_exactly_the_missing_braces() {
        for missing in 1..=4 {
            let full = r#"{"a": {"b": {"c": {"d": {"e": 1}}}}}"#;
            let truncated = &full[..full.len() - missing];
            let balanced = balance_delimiters(truncated);
            assert_eq!(balanced.len(), truncated.len() + missing);
            assert!(serde_json::from_str::<Value>(&balanced).is_ok());
        }
    }

    #[test]
    fn test_balancing_closes_brackets_inside_braces() {
        let balanced = balance_delimiters(r#"{"nutrition_targets": [{"daily_calories": 2000"#);
        assert_eq!(balanced, r#"{"nutrition_targets": [{"daily_calories": 2000}]}"#);
    }

    #[test]
    fn test_balancing_drops_dangling_comma_and_closes_string() {
        assert_eq!(balance_delimiters(r#"{"a": 1, "#), r#"{"a": 1}"#);
        assert_eq!(balance_delimiters(r#"{"name": "chick"#), r#"{"name": "chick"}"#);
    }

    #[test]
    fn test_balanced_text_is_returned_trimmed() {
        assert_eq!(balance_delimiters("{\"a\": 1}  \n"), "{\"a\": 1}");
    }

    #[test]
    fn test_known_signatures_match_balancing() {
        // Each recorded signature fix must agree with what balancing produces
        for (signature, replacement) in KNOWN_SIGNATURES {
            let truncated = format!(r#"{{"remaining_macros": {{"calories": 600, {}"#, signature.trim_end_matches('}'));
            let truncated = if signature.ends_with('}') {
                format!("{}}}", truncated)
            } else {
                truncated
            };
            let patched = apply_known_signatures(&truncated).unwrap();
            assert!(patched.ends_with(replacement));
            let patched_value: Value = serde_json::from_str(&patched).unwrap();
            let balanced_value: Value = serde_json::from_str(&balance_delimiters(&truncated)).unwrap();
            assert_eq!(patched_value, balanced_value);
        }
    }

    #[test]
    fn test_exhausted_without_object() {
        let err = JsonRepairer::new().repair("no json here").unwrap_err();
        assert!(matches!(err, RepairError::Exhausted { .. }));
        assert!(matches!(JsonRepairer::new().repair("   "), Err(RepairError::Empty)));
    }

    #[test]
    fn test_arrays_are_not_objects() {
        let err = JsonRepairer::new().repair("[1, 2, 3]").unwrap_err();
        assert!(err.to_string().contains("an array"));
    }
}
