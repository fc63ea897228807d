use regex::Regex;
use std::cmp::Ordering;
use std::sync::LazyLock;

use crate::error::DbError;

/// Comparison applied by a filter pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `=` and `==`: loose equality, comma lists act as sets.
    Eq,
    /// `===`: exact equality of the stored value.
    Identical,
    /// `!=` and `<>`
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Like,
    In,
}

impl Comparator {
    pub fn parse(op: &str) -> Result<Self, DbError> {
        match op.trim().to_ascii_uppercase().as_str() {
            "=" | "==" => Ok(Comparator::Eq),
            "===" => Ok(Comparator::Identical),
            "!=" | "<>" => Ok(Comparator::NotEq),
            "<" => Ok(Comparator::Lt),
            ">" => Ok(Comparator::Gt),
            "<=" => Ok(Comparator::Le),
            ">=" => Ok(Comparator::Ge),
            "LIKE" => Ok(Comparator::Like),
            "IN" => Ok(Comparator::In),
            other => Err(DbError::Configuration(format!(
                "unknown filter comparator '{}'",
                other
            ))),
        }
    }
}

/// One `(column, comparator, value)` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub column: String,
    pub comparator: Comparator,
    pub value: serde_json::Value,
}

/// In-memory post-fetch filter. A row is kept when it satisfies every pattern.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    patterns: Vec<Pattern>,
}

static OPERATOR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([\w.]+)\s*(===|==|!=|<>|<=|>=|=|<|>)\s*(.*?)\s*$").expect("valid regex")
});

static KEYWORD_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*([\w.]+)\s+(LIKE|IN)\s+(.*?)\s*$").expect("valid regex"));

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn add(
        &mut self,
        column: &str,
        comparator: Comparator,
        value: impl Into<serde_json::Value>,
    ) -> &mut Self {
        self.patterns.push(Pattern {
            column: column.to_string(),
            comparator,
            value: value.into(),
        });
        self
    }

    /// Add a textual pattern such as `age>=18`, `name LIKE a%` or `id IN 1,2,3`.
    pub fn add_pattern(&mut self, text: &str) -> Result<&mut Self, DbError> {
        let captures = KEYWORD_PATTERN
            .captures(text)
            .or_else(|| OPERATOR_PATTERN.captures(text))
            .ok_or_else(|| DbError::Configuration(format!("invalid filter pattern '{}'", text)))?;

        let comparator = Comparator::parse(&captures[2])?;
        let value = literal(&captures[3]);
        Ok(self.add(&captures[1], comparator, value))
    }

    /// Whether a fetched row (a record, or a scalar from a single-column
    /// query) satisfies every pattern.
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        self.patterns.iter().all(|pattern| {
            let stored = match row {
                serde_json::Value::Object(map) => {
                    map.get(&pattern.column).unwrap_or(&serde_json::Value::Null)
                }
                scalar => scalar,
            };
            compare(stored, pattern.comparator, &pattern.value)
        })
    }

    pub fn apply(&self, rows: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        if self.patterns.is_empty() {
            return rows;
        }
        rows.into_iter().filter(|row| self.matches(row)).collect()
    }
}

/// Parse the value side of a textual pattern.
fn literal(text: &str) -> serde_json::Value {
    let text = text.trim();
    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return serde_json::Value::String(text[1..text.len() - 1].to_string());
        }
    }
    if let Ok(i) = text.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Some(n) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
        return serde_json::Value::Number(n);
    }
    if text.eq_ignore_ascii_case("null") {
        return serde_json::Value::Null;
    }
    serde_json::Value::String(text.to_string())
}

/// Text form used for loose comparisons.
pub(crate) fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::Bool(true) => "1".to_string(),
        serde_json::Value::Bool(false) => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn loose_eq(a: &str, b: &str) -> bool {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn members(value: &serde_json::Value) -> Vec<String> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(as_text).collect(),
        other => as_text(other).split(',').map(|s| s.trim().to_string()).collect(),
    }
}

fn ordering(stored: &serde_json::Value, expected: &serde_json::Value) -> Option<Ordering> {
    if stored.is_null() {
        return None;
    }
    match (as_number(stored), as_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(as_text(stored).cmp(&as_text(expected))),
    }
}

fn like(stored: &str, pattern: &str) -> bool {
    let mut expr = String::from("(?is)^");
    for ch in pattern.chars() {
        match ch {
            '%' => expr.push_str(".*"),
            '_' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map(|re| re.is_match(stored)).unwrap_or(false)
}

fn compare(stored: &serde_json::Value, comparator: Comparator, expected: &serde_json::Value) -> bool {
    match comparator {
        Comparator::Eq => {
            let expected = as_text(expected);
            members(stored).iter().any(|m| loose_eq(m, &expected))
        }
        Comparator::Identical => stored == expected,
        Comparator::NotEq => !compare(stored, Comparator::Eq, expected),
        Comparator::In => {
            let wanted = members(expected);
            members(stored)
                .iter()
                .any(|m| wanted.iter().any(|w| loose_eq(m, w)))
        }
        Comparator::Like => like(&as_text(stored), &as_text(expected)),
        Comparator::Lt => ordering(stored, expected) == Some(Ordering::Less),
        Comparator::Gt => ordering(stored, expected) == Some(Ordering::Greater),
        Comparator::Le => matches!(
            ordering(stored, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Comparator::Ge => matches!(
            ordering(stored, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filtered(pattern: &str, rows: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        let mut filter = Filter::new();
        filter.add_pattern(pattern).unwrap();
        filter.apply(rows)
    }

    #[test]
    fn test_numeric_comparison() {
        let rows = vec![json!({"age": 17}), json!({"age": 18}), json!({"age": 21})];
        assert_eq!(
            filtered("age>=18", rows),
            vec![json!({"age": 18}), json!({"age": 21})]
        );
    }

    #[test]
    fn test_comma_list_is_a_set() {
        let rows = vec![json!({"tags": "rock,pop"}), json!({"tags": "jazz"})];
        assert_eq!(filtered("tags=rock", rows), vec![json!({"tags": "rock,pop"})]);
    }

    #[test]
    fn test_in_list() {
        let rows = vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})];
        assert_eq!(
            filtered("id IN 1,3", rows),
            vec![json!({"id": 1}), json!({"id": 3})]
        );
    }

    #[test]
    fn test_like_is_case_insensitive() {
        let rows = vec![json!({"name": "Alice"}), json!({"name": "bob"}), json!({"name": "alfred"})];
        assert_eq!(
            filtered("name like al%", rows),
            vec![json!({"name": "Alice"}), json!({"name": "alfred"})]
        );
    }

    #[test]
    fn test_identical_is_strict() {
        let mut filter = Filter::new();
        filter.add("id", Comparator::Identical, json!(1));
        assert!(filter.matches(&json!({"id": 1})));
        assert!(!filter.matches(&json!({"id": "1"})));

        let mut loose = Filter::new();
        loose.add("id", Comparator::Eq, json!(1));
        assert!(loose.matches(&json!({"id": "1"})));
    }

    #[test]
    fn test_not_equal_and_missing_column() {
        let rows = vec![json!({"state": "open"}), json!({"state": "closed"}), json!({})];
        assert_eq!(
            filtered("state<>closed", rows),
            vec![json!({"state": "open"}), json!({})]
        );
        assert!(filtered("score>1", vec![json!({})]).is_empty());
    }

    #[test]
    fn test_scalar_rows() {
        let rows = vec![json!("alice"), json!("bob")];
        assert_eq!(filtered("name!=bob", rows), vec![json!("alice")]);
    }

    #[test]
    fn test_multiple_patterns_all_apply() {
        let mut filter = Filter::new();
        filter.add_pattern("age>18").unwrap();
        filter.add("name", Comparator::Like, "%e");
        let rows = vec![
            json!({"name": "Jane", "age": 30}),
            json!({"name": "Joe", "age": 12}),
            json!({"name": "Sam", "age": 40}),
        ];
        assert_eq!(filter.apply(rows), vec![json!({"name": "Jane", "age": 30})]);
    }

    #[test]
    fn test_invalid_pattern() {
        let mut filter = Filter::new();
        assert!(matches!(filter.add_pattern("just words"), Err(DbError::Configuration(_))));
    }
}
