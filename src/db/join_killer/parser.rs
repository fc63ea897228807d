//! Parser for the restricted join form the decomposer accepts:
//!
//! ```text
//! SELECT a.col [AS label], b.* FROM t1 a, t2 [AS] b WHERE a.x = b.y AND b.z > 3
//! ```

use regex::Regex;
use std::sync::LazyLock;

use crate::error::DbError;

static JOIN_PREDICATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_]\w*)\.([A-Za-z_]\w*)\s*=\s*([A-Za-z_]\w*)\.([A-Za-z_]\w*)$").expect("valid regex")
});

static ALIAS_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\w.])([A-Za-z_]\w*)\.").expect("valid regex"));

static FORBIDDEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(ORDER BY|GROUP BY|LIMIT|OFFSET|HAVING|JOIN|UNION)\b").expect("valid regex"));

static DISJUNCTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bOR\b").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectItem {
    pub alias: String,
    /// Column name, or `*`.
    pub column: String,
    pub label: Option<String>,
}

impl SelectItem {
    /// Key the column appears under in a fetched row.
    pub fn output_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `left = right` across two tables: `left`'s table needs `right`'s values.
    Join { left: ColumnRef, right: ColumnRef },
    /// A predicate on one table, with its alias prefixes removed.
    Filter { alias: String, sql: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinQuery {
    pub select: Vec<SelectItem>,
    pub tables: Vec<TableRef>,
    pub conditions: Vec<Condition>,
}

impl JoinQuery {
    pub fn table(&self, alias: &str) -> Option<&TableRef> {
        self.tables.iter().find(|t| t.alias == alias)
    }
}

fn unsupported(message: impl Into<String>) -> DbError {
    DbError::UnsupportedQuery(message.into())
}

/// Copy of `sql` with the contents of quoted strings blanked out, so that
/// keyword searches cannot match inside literals. Byte offsets are preserved.
fn mask_literals(sql: &str) -> String {
    let mut masked = Vec::with_capacity(sql.len());
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for &byte in sql.as_bytes() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                    masked.push(b' ');
                } else if byte == b'\\' {
                    escaped = true;
                    masked.push(b' ');
                } else if byte == q {
                    quote = None;
                    masked.push(byte);
                } else {
                    masked.push(b' ');
                }
            }
            None => {
                if byte == b'\'' || byte == b'"' || byte == b'`' {
                    quote = Some(byte);
                }
                masked.push(byte.to_ascii_uppercase());
            }
        }
    }
    String::from_utf8_lossy(&masked).into_owned()
}

/// Collapse runs of whitespace outside quoted strings into single spaces.
fn normalize_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;
    for ch in sql.trim().chars() {
        if quote.is_none() && ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        match quote {
            Some(q) if ch == q => quote = None,
            None if ch == '\'' || ch == '"' || ch == '`' => quote = Some(ch),
            _ => {}
        }
        out.push(ch);
    }
    out.trim_end_matches(';').trim_end().to_string()
}

/// Split `text` on a keyword surrounded by spaces, ignoring matches inside
/// quoted strings.
fn split_keyword<'s>(text: &'s str, keyword: &str) -> Vec<&'s str> {
    let masked = mask_literals(text);
    let needle = format!(" {} ", keyword);
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(found) = masked[search..].find(&needle) {
        let at = search + found;
        parts.push(text[start..at].trim());
        start = at + needle.len();
        search = start;
    }
    parts.push(text[start..].trim());
    parts
}

fn split_commas(text: &str) -> Vec<&str> {
    let masked = mask_literals(text);
    let mut parts = Vec::new();
    let mut start = 0;
    for (idx, byte) in masked.bytes().enumerate() {
        if byte == b',' {
            parts.push(text[start..idx].trim());
            start = idx + 1;
        }
    }
    parts.push(text[start..].trim());
    parts
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn parse(sql: &str) -> Result<JoinQuery, DbError> {
    let sql = normalize_whitespace(sql);
    let masked = mask_literals(&sql);

    if let Some(found) = FORBIDDEN.find(&masked) {
        return Err(unsupported(format!("{} is not supported", found.as_str())));
    }
    if !masked.starts_with("SELECT ") {
        return Err(unsupported("only SELECT statements can be decomposed"));
    }

    let body = &sql["SELECT ".len()..];
    let mut sections = split_keyword(body, "FROM");
    if sections.len() != 2 {
        return Err(unsupported("expected exactly one FROM clause"));
    }
    let from_and_where = sections.pop().unwrap_or_default();
    let select_list = sections.pop().unwrap_or_default();

    let mut clauses = split_keyword(from_and_where, "WHERE");
    let (from_list, where_clause) = match clauses.len() {
        1 => (clauses.remove(0), None),
        2 => {
            let where_clause = clauses.pop();
            (clauses.remove(0), where_clause)
        }
        _ => return Err(unsupported("expected at most one WHERE clause")),
    };

    let tables = parse_tables(from_list)?;
    let select = parse_select(select_list, &tables)?;
    let conditions = match where_clause {
        Some(clause) => parse_conditions(clause, &tables)?,
        None => Vec::new(),
    };

    Ok(JoinQuery {
        select,
        tables,
        conditions,
    })
}

fn parse_tables(from_list: &str) -> Result<Vec<TableRef>, DbError> {
    let mut tables: Vec<TableRef> = Vec::new();
    for entry in split_commas(from_list) {
        let words: Vec<&str> = entry.split(' ').filter(|w| !w.is_empty()).collect();
        let (table, alias) = match words.as_slice() {
            [table] => (*table, *table),
            [table, alias] => (*table, *alias),
            [table, kw, alias] if kw.eq_ignore_ascii_case("AS") => (*table, *alias),
            _ => return Err(unsupported(format!("cannot read table reference '{}'", entry))),
        };
        let table = table.trim_matches('`');
        if !is_identifier(table) || !is_identifier(alias) {
            return Err(unsupported(format!("cannot read table reference '{}'", entry)));
        }
        if tables.iter().any(|t| t.alias == alias) {
            return Err(unsupported(format!("alias '{}' is used twice", alias)));
        }
        tables.push(TableRef {
            table: table.to_string(),
            alias: alias.to_string(),
        });
    }
    Ok(tables)
}

fn parse_select(select_list: &str, tables: &[TableRef]) -> Result<Vec<SelectItem>, DbError> {
    let mut items = Vec::new();
    for entry in split_commas(select_list) {
        if entry.contains('(') {
            return Err(unsupported(format!("expressions are not supported: '{}'", entry)));
        }
        let words: Vec<&str> = entry.split(' ').collect();
        let (reference, label) = match words.as_slice() {
            [reference] => (*reference, None),
            [reference, kw, label] if kw.eq_ignore_ascii_case("AS") => (*reference, Some(*label)),
            [reference, label] => (*reference, Some(*label)),
            _ => return Err(unsupported(format!("cannot read select item '{}'", entry))),
        };

        let (alias, column) = match reference.split_once('.') {
            Some((alias, column)) => (alias.to_string(), column.to_string()),
            None if tables.len() == 1 => (tables[0].alias.clone(), reference.to_string()),
            None => {
                return Err(unsupported(format!(
                    "column '{}' must be qualified with a table alias",
                    reference
                )))
            }
        };
        if !tables.iter().any(|t| t.alias == alias) {
            return Err(unsupported(format!("unknown table alias '{}'", alias)));
        }
        if column != "*" && !is_identifier(&column) {
            return Err(unsupported(format!("cannot read select item '{}'", entry)));
        }
        items.push(SelectItem {
            alias,
            column,
            label: label.map(str::to_string),
        });
    }
    Ok(items)
}

fn parse_conditions(clause: &str, tables: &[TableRef]) -> Result<Vec<Condition>, DbError> {
    let is_alias = |name: &str| tables.iter().any(|t| t.alias == name);
    let mut conditions = Vec::new();

    for predicate in split_keyword(clause, "AND") {
        if DISJUNCTION.is_match(&mask_literals(predicate)) {
            return Err(unsupported("OR conditions are not supported"));
        }

        if let Some(caps) = JOIN_PREDICATE.captures(predicate) {
            if is_alias(&caps[1]) && is_alias(&caps[3]) && caps[1] != caps[3] {
                conditions.push(Condition::Join {
                    left: ColumnRef {
                        alias: caps[1].to_string(),
                        column: caps[2].to_string(),
                    },
                    right: ColumnRef {
                        alias: caps[3].to_string(),
                        column: caps[4].to_string(),
                    },
                });
                continue;
            }
        }

        let masked = mask_literals(predicate);
        let mut aliases: Vec<String> = Vec::new();
        for caps in ALIAS_PREFIX.captures_iter(&masked) {
            let start = caps.get(2).map(|m| m.start()).unwrap_or(0);
            let end = caps.get(2).map(|m| m.end()).unwrap_or(0);
            let name = &predicate[start..end];
            if is_alias(name) && !aliases.iter().any(|a| a == name) {
                aliases.push(name.to_string());
            }
        }

        let alias = match aliases.as_slice() {
            [alias] => alias.clone(),
            [] if tables.len() == 1 => tables[0].alias.clone(),
            [] => {
                return Err(unsupported(format!(
                    "condition '{}' does not name a table alias",
                    predicate
                )))
            }
            _ => {
                return Err(unsupported(format!(
                    "condition '{}' spans several tables without being a join",
                    predicate
                )))
            }
        };
        conditions.push(Condition::Filter {
            sql: strip_alias(predicate, &alias),
            alias,
        });
    }
    Ok(conditions)
}

/// Remove `alias.` prefixes outside quoted strings.
fn strip_alias(predicate: &str, alias: &str) -> String {
    let masked = mask_literals(predicate);
    let prefix = format!("{}.", alias.to_ascii_uppercase());
    let mut out = String::with_capacity(predicate.len());
    let mut idx = 0;
    while idx < predicate.len() {
        let boundary = idx == 0
            || !masked.as_bytes()[idx - 1].is_ascii_alphanumeric() && masked.as_bytes()[idx - 1] != b'_';
        if boundary && masked[idx..].starts_with(&prefix) {
            idx += prefix.len();
            continue;
        }
        let ch_len = predicate[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
        out.push_str(&predicate[idx..idx + ch_len]);
        idx += ch_len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join() {
        let query = parse(
            "SELECT u.name, p.title AS headline
             FROM users u, posts AS p
             WHERE p.user_id = u.id AND u.active = 1",
        )
        .unwrap();

        assert_eq!(
            query.tables,
            vec![
                TableRef { table: "users".into(), alias: "u".into() },
                TableRef { table: "posts".into(), alias: "p".into() },
            ]
        );
        assert_eq!(query.select[1].output_name(), "headline");
        assert_eq!(
            query.conditions[0],
            Condition::Join {
                left: ColumnRef { alias: "p".into(), column: "user_id".into() },
                right: ColumnRef { alias: "u".into(), column: "id".into() },
            }
        );
        assert_eq!(
            query.conditions[1],
            Condition::Filter { alias: "u".into(), sql: "active = 1".into() }
        );
    }

    #[test]
    fn test_literals_are_left_alone() {
        let query = parse("SELECT u.name FROM users u WHERE u.bio = 'u.name  AND  x'").unwrap();
        assert_eq!(
            query.conditions,
            vec![Condition::Filter { alias: "u".into(), sql: "bio = 'u.name  AND  x'".into() }]
        );
    }

    #[test]
    fn test_rejects_ordering_and_limits() {
        for sql in [
            "SELECT u.id FROM users u ORDER BY u.id",
            "SELECT u.id FROM users u LIMIT 5",
            "select u.id from users u where u.id > 1 limit 5 offset 10",
            "SELECT u.id FROM users u JOIN posts p ON p.user_id = u.id",
        ] {
            assert!(matches!(parse(sql), Err(DbError::UnsupportedQuery(_))), "{}", sql);
        }
    }

    #[test]
    fn test_rejects_or_and_aggregates() {
        assert!(matches!(
            parse("SELECT u.id FROM users u WHERE u.a = 1 OR u.b = 2"),
            Err(DbError::UnsupportedQuery(_))
        ));
        assert!(matches!(
            parse("SELECT COUNT(u.id) FROM users u"),
            Err(DbError::UnsupportedQuery(_))
        ));
        // "or" inside a literal is fine
        assert!(parse("SELECT u.id FROM users u WHERE u.name = 'this or that'").is_ok());
    }

    #[test]
    fn test_unknown_alias() {
        assert!(matches!(
            parse("SELECT x.id FROM users u"),
            Err(DbError::UnsupportedQuery(_))
        ));
    }

    #[test]
    fn test_single_table_without_alias() {
        let query = parse("SELECT id, name FROM users WHERE active = 1").unwrap();
        assert_eq!(query.tables[0].alias, "users");
        assert_eq!(query.select[0].alias, "users");
        assert_eq!(
            query.conditions[0],
            Condition::Filter { alias: "users".into(), sql: "active = 1".into() }
        );
    }
}
