use super::ddl::DdlStatement;
use crate::db::connectors::Role;
use crate::db::router::ConnectionRouter;
use crate::db::schema::{LiveColumn, LiveIndex, Row};
use crate::error::DbError;

/// A live database the synchronizer reconciles against.
pub trait SchemaTarget {
    /// Names of existing tables.
    fn live_tables(&mut self, schema: &str) -> Result<Vec<String>, DbError>;

    /// Columns of an existing table, in ordinal order.
    fn live_columns(&mut self, schema: &str, table: &str) -> Result<Vec<LiveColumn>, DbError>;

    /// Every non-primary index entry and foreign-key constraint.
    fn live_indexes(&mut self, schema: &str) -> Result<Vec<LiveIndex>, DbError>;

    /// Execute one DDL statement.
    fn apply(&mut self, schema: &str, statement: &DdlStatement) -> Result<(), DbError>;
}

const TABLES_SQL: &str = "SELECT TABLE_NAME AS table_name FROM information_schema.TABLES \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_TYPE = 'BASE TABLE'";

const COLUMNS_SQL: &str = "SELECT COLUMN_NAME AS column_name, DATA_TYPE AS data_type, \
     COLUMN_TYPE AS column_type, IS_NULLABLE AS is_nullable, COLUMN_DEFAULT AS column_default, \
     CHARACTER_MAXIMUM_LENGTH AS max_length \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = :table ORDER BY ORDINAL_POSITION";

const INDEXES_SQL: &str = "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, \
     INDEX_NAME AS index_name, NON_UNIQUE AS non_unique \
     FROM information_schema.STATISTICS \
     WHERE TABLE_SCHEMA = DATABASE() AND INDEX_NAME <> 'PRIMARY' \
     ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX";

const FOREIGN_KEYS_SQL: &str = "SELECT TABLE_NAME AS table_name, COLUMN_NAME AS column_name, \
     CONSTRAINT_NAME AS constraint_name \
     FROM information_schema.KEY_COLUMN_USAGE \
     WHERE TABLE_SCHEMA = DATABASE() AND REFERENCED_TABLE_NAME IS NOT NULL";

/// MySQL target reading `information_schema` through the schema's master.
pub struct MySqlTarget<'a> {
    router: &'a ConnectionRouter,
}

impl<'a> MySqlTarget<'a> {
    pub fn new(router: &'a ConnectionRouter) -> Self {
        Self { router }
    }

    fn rows(&self, schema: &str, sql: &str, params: &[(&str, &str)]) -> Result<Vec<Row>, DbError> {
        let conn = self.router.get_connection(schema, Role::Master)?;
        let mut statement = conn.prepare(sql)?;
        for (placeholder, value) in params {
            statement.bind_value(placeholder, &serde_json::Value::String(value.to_string()))?;
        }
        statement.execute()?;
        statement.fetch_all()
    }
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn optional_text(row: &Row, key: &str) -> Option<String> {
    match row.get(key) {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => Some(text(row, key)),
    }
}

impl SchemaTarget for MySqlTarget<'_> {
    fn live_tables(&mut self, schema: &str) -> Result<Vec<String>, DbError> {
        Ok(self
            .rows(schema, TABLES_SQL, &[])?
            .iter()
            .map(|row| text(row, "table_name"))
            .collect())
    }

    fn live_columns(&mut self, schema: &str, table: &str) -> Result<Vec<LiveColumn>, DbError> {
        Ok(self
            .rows(schema, COLUMNS_SQL, &[(":table", table)])?
            .iter()
            .map(|row| LiveColumn {
                name: text(row, "column_name"),
                data_type: text(row, "data_type").to_ascii_lowercase(),
                column_type: text(row, "column_type").to_ascii_lowercase(),
                is_nullable: text(row, "is_nullable").eq_ignore_ascii_case("YES"),
                default_value: optional_text(row, "column_default"),
                max_length: optional_text(row, "max_length").and_then(|v| v.parse().ok()),
            })
            .collect())
    }

    fn live_indexes(&mut self, schema: &str) -> Result<Vec<LiveIndex>, DbError> {
        let mut indexes: Vec<LiveIndex> = self
            .rows(schema, INDEXES_SQL, &[])?
            .iter()
            .map(|row| LiveIndex {
                table: text(row, "table_name"),
                column: text(row, "column_name"),
                name: text(row, "index_name"),
                is_unique: text(row, "non_unique") == "0",
                constraint: false,
            })
            .collect();

        indexes.extend(self.rows(schema, FOREIGN_KEYS_SQL, &[])?.iter().map(|row| LiveIndex {
            table: text(row, "table_name"),
            column: text(row, "column_name"),
            name: text(row, "constraint_name"),
            is_unique: false,
            constraint: true,
        }));
        Ok(indexes)
    }

    fn apply(&mut self, schema: &str, statement: &DdlStatement) -> Result<(), DbError> {
        let conn = self.router.get_connection(schema, Role::Master)?;
        conn.prepare(&statement.to_sql())?.execute()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_text_helpers() {
        let mut row = Row::new();
        row.insert("non_unique".into(), json!(0));
        row.insert("column_default".into(), json!(null));
        row.insert("max_length".into(), json!("50"));

        assert_eq!(text(&row, "non_unique"), "0");
        assert_eq!(optional_text(&row, "column_default"), None);
        assert_eq!(optional_text(&row, "max_length"), Some("50".to_string()));
        assert_eq!(text(&row, "missing"), "");
    }
}
