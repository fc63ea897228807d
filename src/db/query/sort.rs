use std::cmp::Ordering;

use super::filter::{as_number, as_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub direction: Direction,
    /// Whether the caller relies on row association. Rows always move as
    /// a whole, so a sort never changes what a row contains.
    pub preserve_row: bool,
}

/// In-memory post-fetch sort.
#[derive(Debug, Clone, Default)]
pub struct Sort {
    specs: Vec<SortSpec>,
}

impl Sort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn add(&mut self, column: &str, direction: Direction, preserve_row: bool) -> &mut Self {
        self.specs.push(SortSpec {
            column: column.to_string(),
            direction,
            preserve_row,
        });
        self
    }

    /// Stable sort by every spec in turn.
    pub fn apply(&self, mut rows: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
        if self.specs.is_empty() {
            return rows;
        }
        rows.sort_by(|a, b| {
            self.specs
                .iter()
                .map(|spec| {
                    let ord = natural_cmp(field(a, &spec.column), field(b, &spec.column));
                    directed(ord, spec.direction)
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        rows
    }
}

fn directed(ord: Ordering, direction: Direction) -> Ordering {
    match direction {
        Direction::Asc => ord,
        Direction::Desc => ord.reverse(),
    }
}

fn field<'v>(row: &'v serde_json::Value, column: &str) -> &'v serde_json::Value {
    match row {
        serde_json::Value::Object(map) => map.get(column).unwrap_or(&serde_json::Value::Null),
        scalar => scalar,
    }
}

/// Natural-order comparison: numbers numerically, strings chunk by chunk
/// with digit runs compared as numbers (`item2` < `item10`). Nulls sort first.
pub fn natural_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    natural_str_cmp(&as_text(a), &as_text(b))
}

fn natural_str_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let l = take_digits(&mut left);
                let r = take_digits(&mut right);
                let l_trim = l.trim_start_matches('0');
                let r_trim = r.trim_start_matches('0');
                let ord = l_trim
                    .len()
                    .cmp(&r_trim.len())
                    .then_with(|| l_trim.cmp(r_trim));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        digits.push(c);
        chars.next();
    }
    digits
}
