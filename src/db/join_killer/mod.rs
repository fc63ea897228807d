//! Join decomposition.
//!
//! A multi-table SELECT joined through WHERE equalities is rewritten into one
//! single-table SELECT per alias. The statements run in dependency order,
//! each receiving the join values produced by the ones before it, and the
//! results are merged back together.
//!
//! This is a best-effort optimization, not a planner: no outer joins,
//! aggregates or ordering. For `fetch_all`, per-table row sets are
//! concatenated; rows from different tables are not paired.

pub mod parser;

use indexmap::IndexMap;
use std::collections::HashMap;

pub use parser::{ColumnRef, Condition, JoinQuery, SelectItem, TableRef};

use super::query::Query;
use super::router::ConnectionRouter;
use super::schema::Row;
use crate::error::DbError;
use crate::util::resolve_dependencies;

/// Render a JSON value as an SQL literal.
pub(crate) fn sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

/// Single-table statement for one alias.
#[derive(Debug, Clone)]
struct Step {
    alias: String,
    table: String,
    /// `(column, output name)` pairs; `("*", "*")` selects everything.
    columns: Vec<(String, String)>,
    /// Output names added only to feed dependent steps.
    helpers: Vec<String>,
    filters: Vec<String>,
    /// `(own column, other alias, other output name)`
    joins: Vec<(String, String, String)>,
}

impl Step {
    fn output_for<'s>(&'s self, column: &'s str) -> Option<&'s str> {
        self.columns
            .iter()
            .find(|(c, _)| c == column || c == "*")
            .map(|(c, name)| if c == "*" { column } else { name.as_str() })
    }

    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|(column, name)| {
                if column == name || column == "*" {
                    column.clone()
                } else {
                    format!("{} AS {}", column, name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Build the statement, given the values already fetched for each
    /// (alias, output name) this step joins on. `None` when a join side has
    /// no values at all.
    fn sql(&self, fetched: &HashMap<String, Vec<Row>>, single: bool) -> Option<String> {
        let mut conditions = self.filters.clone();
        for (column, other_alias, other_name) in &self.joins {
            let mut values: Vec<serde_json::Value> = Vec::new();
            for row in fetched.get(other_alias)? {
                let value = row.get(other_name).cloned().unwrap_or(serde_json::Value::Null);
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            match values.as_slice() {
                [] => return None,
                [value] => conditions.push(format!("{} = {}", column, sql_literal(value))),
                _ if single => conditions.push(format!("{} = {}", column, sql_literal(&values[0]))),
                _ => conditions.push(format!(
                    "{} IN ({})",
                    column,
                    values.iter().map(sql_literal).collect::<Vec<_>>().join(", ")
                )),
            }
        }

        let mut sql = format!("SELECT {} FROM {}", self.select_list(), self.table);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        Some(sql)
    }

    fn strip_helpers(&self, mut row: Row) -> Row {
        for helper in &self.helpers {
            row.remove(helper);
        }
        row
    }
}

/// Plans and runs a decomposed join.
pub struct JoinKiller<'a> {
    router: &'a ConnectionRouter,
    schema: String,
    steps: Vec<Step>,
    params: IndexMap<String, serde_json::Value>,
}

impl<'a> JoinKiller<'a> {
    pub fn new(router: &'a ConnectionRouter, schema: &str, sql: &str) -> Result<Self, DbError> {
        let parsed = parser::parse(sql)?;
        let steps = plan(&parsed)?;
        log::debug!(
            "Decomposed join into {} statements: {}",
            steps.len(),
            steps.iter().map(|s| s.alias.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        Ok(Self {
            router,
            schema: schema.to_string(),
            steps,
            params: IndexMap::new(),
        })
    }

    /// Aliases in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.alias.as_str()).collect()
    }

    /// Bind a placeholder used in a filter condition. It is passed to every
    /// single-table statement that mentions it.
    pub fn bind(
        &mut self,
        placeholder: &str,
        value: impl Into<serde_json::Value>,
    ) -> Result<&mut Self, DbError> {
        let key = format!(":{}", placeholder.trim_start_matches(':'));
        if self.params.contains_key(&key) {
            return Err(DbError::DuplicateBind(key));
        }
        self.params.insert(key, value.into());
        Ok(self)
    }

    fn query(&self, sql: &str) -> Result<Query<'a>, DbError> {
        let mut query = Query::new(self.router, &self.schema, sql);
        for (placeholder, value) in &self.params {
            if mentions(sql, placeholder) {
                query.bind(placeholder, value.clone())?;
            }
        }
        Ok(query)
    }

    /// One merged row. On key collisions the later statement wins.
    pub fn fetch_row(&self) -> Result<Option<Row>, DbError> {
        let mut fetched: HashMap<String, Vec<Row>> = HashMap::new();
        let mut merged = Row::new();

        for step in &self.steps {
            let Some(sql) = step.sql(&fetched, true) else {
                return Ok(None);
            };
            let Some(row) = self.query(&sql)?.fetch_row()? else {
                return Ok(None);
            };
            for (key, value) in step.strip_helpers(row.clone()) {
                merged.insert(key, value);
            }
            fetched.insert(step.alias.clone(), vec![row]);
        }
        Ok(Some(merged))
    }

    /// Every statement's rows, concatenated in execution order.
    pub fn fetch_all(&self) -> Result<Vec<Row>, DbError> {
        let mut fetched: HashMap<String, Vec<Row>> = HashMap::new();
        let mut merged = Vec::new();

        for step in &self.steps {
            let Some(sql) = step.sql(&fetched, false) else {
                return Ok(Vec::new());
            };
            let rows = self.query(&sql)?.fetch_rows()?;
            if rows.is_empty() {
                return Ok(Vec::new());
            }
            merged.extend(
                rows.iter()
                    .map(|row| step.strip_helpers(row.clone()))
                    .filter(|row| !row.is_empty()),
            );
            fetched.insert(step.alias.clone(), rows);
        }
        Ok(merged)
    }
}

fn mentions(sql: &str, placeholder: &str) -> bool {
    sql.match_indices(placeholder).any(|(at, _)| {
        sql[at + placeholder.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'))
    })
}

fn plan(query: &JoinQuery) -> Result<Vec<Step>, DbError> {
    let mut steps: IndexMap<String, Step> = query
        .tables
        .iter()
        .map(|t| {
            (
                t.alias.clone(),
                Step {
                    alias: t.alias.clone(),
                    table: t.table.clone(),
                    columns: Vec::new(),
                    helpers: Vec::new(),
                    filters: Vec::new(),
                    joins: Vec::new(),
                },
            )
        })
        .collect();

    for item in &query.select {
        if let Some(step) = steps.get_mut(&item.alias) {
            step.columns
                .push((item.column.clone(), item.output_name().to_string()));
        }
    }

    let mut graph: IndexMap<String, Vec<String>> =
        query.tables.iter().map(|t| (t.alias.clone(), Vec::new())).collect();

    for condition in &query.conditions {
        match condition {
            Condition::Filter { alias, sql } => {
                if let Some(step) = steps.get_mut(alias) {
                    step.filters.push(sql.clone());
                }
            }
            Condition::Join { left, right } => {
                let provider = steps.get_mut(&right.alias).ok_or_else(|| {
                    DbError::UnsupportedQuery(format!("unknown table alias '{}'", right.alias))
                })?;
                let name = match provider.output_for(&right.column) {
                    Some(name) => name.to_string(),
                    None => {
                        provider
                            .columns
                            .push((right.column.clone(), right.column.clone()));
                        provider.helpers.push(right.column.clone());
                        right.column.clone()
                    }
                };
                if let Some(step) = steps.get_mut(&left.alias) {
                    step.joins
                        .push((left.column.clone(), right.alias.clone(), name));
                }
                if let Some(deps) = graph.get_mut(&left.alias) {
                    if !deps.contains(&right.alias) {
                        deps.push(right.alias.clone());
                    }
                }
            }
        }
    }

    // A table contributing nothing still has to match a row.
    for step in steps.values_mut() {
        if step.columns.is_empty() {
            step.columns.push(("1".to_string(), "_matched".to_string()));
            step.helpers.push("_matched".to_string());
        }
    }

    let order = resolve_dependencies(&graph)?;
    Ok(order
        .into_iter()
        .filter_map(|alias| steps.shift_remove(&alias))
        .collect())
}
