use crate::db::schema::{ColumnDefinition, ColumnType, ForeignKey, PRIMARY_KEY};

/// Suffix shared by every generated foreign key name.
pub const FOREIGN_KEY_SUFFIX: &str = "_fk";

pub fn index_name(table: &str, column: &str) -> String {
    format!("{}_{}_index", table, column)
}

pub fn foreign_key_name(table: &str, column: &str, fk: &ForeignKey) -> String {
    format!("{}_{}_{}_{}{}", table, column, fk.table, fk.column, FOREIGN_KEY_SUFFIX)
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Base MySQL type as reported by `information_schema.COLUMNS.DATA_TYPE`.
pub fn mysql_data_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int => "int",
        ColumnType::TinyInt => "tinyint",
        ColumnType::Varchar => "varchar",
        ColumnType::Enum => "enum",
        ColumnType::Datetime => "datetime",
        ColumnType::Text => "text",
        ColumnType::MediumText => "mediumtext",
        ColumnType::LongText => "longtext",
        ColumnType::Float => "float",
    }
}

/// Full MySQL column type, e.g. `int(10) unsigned` or `enum('a','b')`.
pub fn mysql_column_type(column: &ColumnDefinition) -> String {
    match column.column_type {
        ColumnType::Int if column.unsigned => "int(10) unsigned".to_string(),
        ColumnType::Int => "int(11)".to_string(),
        ColumnType::TinyInt if column.unsigned => "tinyint(3) unsigned".to_string(),
        ColumnType::TinyInt => "tinyint(4)".to_string(),
        // Validated definitions always carry a length.
        ColumnType::Varchar => match column.length {
            Some(length) => format!("varchar({})", length),
            None => "varchar".to_string(),
        },
        ColumnType::Enum => format!(
            "enum({})",
            column
                .options
                .iter()
                .map(|o| quote_literal(o))
                .collect::<Vec<_>>()
                .join(",")
        ),
        other => mysql_data_type(other).to_string(),
    }
}

/// Declared default in the text form introspection reports it in. The
/// save-time `NOW` default never reaches the database.
pub fn default_text(column: &ColumnDefinition) -> Option<String> {
    if column.defaults_to_now() {
        return None;
    }
    match column.default.as_ref()? {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some((if *b { "1" } else { "0" }).to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn column_sql(name: &str, column: &ColumnDefinition) -> String {
    let mut sql = format!("{} {}", quote_ident(name), mysql_column_type(column));
    sql.push_str(if column.nullable { " NULL" } else { " NOT NULL" });
    if let Some(default) = default_text(column) {
        match column.default {
            Some(serde_json::Value::Number(_)) | Some(serde_json::Value::Bool(_)) => {
                sql.push_str(&format!(" DEFAULT {}", default));
            }
            _ => sql.push_str(&format!(" DEFAULT {}", quote_literal(&default))),
        }
    }
    sql
}

/// One schema change, rendered to MySQL DDL by [`DdlStatement::to_sql`].
#[derive(Debug, Clone, PartialEq)]
pub enum DdlStatement {
    /// New table with its primary key, columns, indexes and foreign keys.
    CreateTable {
        table: String,
        columns: Vec<(String, ColumnDefinition)>,
    },
    AddColumn {
        table: String,
        column: String,
        definition: ColumnDefinition,
    },
    ModifyColumn {
        table: String,
        column: String,
        definition: ColumnDefinition,
    },
    DropColumn {
        table: String,
        column: String,
    },
    AddIndex {
        table: String,
        column: String,
        name: String,
        unique: bool,
    },
    DropIndex {
        table: String,
        name: String,
    },
    AddForeignKey {
        table: String,
        column: String,
        name: String,
        references: ForeignKey,
    },
    DropForeignKey {
        table: String,
        name: String,
    },
}

impl DdlStatement {
    pub fn table(&self) -> &str {
        match self {
            DdlStatement::CreateTable { table, .. }
            | DdlStatement::AddColumn { table, .. }
            | DdlStatement::ModifyColumn { table, .. }
            | DdlStatement::DropColumn { table, .. }
            | DdlStatement::AddIndex { table, .. }
            | DdlStatement::DropIndex { table, .. }
            | DdlStatement::AddForeignKey { table, .. }
            | DdlStatement::DropForeignKey { table, .. } => table,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            DdlStatement::CreateTable { table, columns } => {
                let mut parts = vec![format!(
                    "{} int(10) unsigned NOT NULL AUTO_INCREMENT",
                    quote_ident(PRIMARY_KEY)
                )];
                for (name, column) in columns {
                    parts.push(column_sql(name, column));
                }
                parts.push(format!("PRIMARY KEY ({})", quote_ident(PRIMARY_KEY)));
                for (name, column) in columns.iter().filter(|(_, c)| c.indexed) {
                    parts.push(format!(
                        "{}KEY {} ({})",
                        if column.unique { "UNIQUE " } else { "" },
                        quote_ident(&index_name(table, name)),
                        quote_ident(name)
                    ));
                }
                for (name, column) in columns {
                    if let Some(fk) = &column.foreign_key {
                        parts.push(format!(
                            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                            quote_ident(&foreign_key_name(table, name, fk)),
                            quote_ident(name),
                            quote_ident(&fk.table),
                            quote_ident(&fk.column)
                        ));
                    }
                }
                format!(
                    "CREATE TABLE {} ({}) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
                    quote_ident(table),
                    parts.join(", ")
                )
            }
            DdlStatement::AddColumn {
                table,
                column,
                definition,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column_sql(column, definition)
            ),
            DdlStatement::ModifyColumn {
                table,
                column,
                definition,
            } => format!(
                "ALTER TABLE {} MODIFY COLUMN {}",
                quote_ident(table),
                column_sql(column, definition)
            ),
            DdlStatement::DropColumn { table, column } => format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            DdlStatement::AddIndex {
                table,
                column,
                name,
                unique,
            } => format!(
                "ALTER TABLE {} ADD {}INDEX {} ({})",
                quote_ident(table),
                if *unique { "UNIQUE " } else { "" },
                quote_ident(name),
                quote_ident(column)
            ),
            DdlStatement::DropIndex { table, name } => format!(
                "ALTER TABLE {} DROP INDEX {}",
                quote_ident(table),
                quote_ident(name)
            ),
            DdlStatement::AddForeignKey {
                table,
                column,
                name,
                references,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(table),
                quote_ident(name),
                quote_ident(column),
                quote_ident(&references.table),
                quote_ident(&references.column)
            ),
            DdlStatement::DropForeignKey { table, name } => format!(
                "ALTER TABLE {} DROP FOREIGN KEY {}",
                quote_ident(table),
                quote_ident(name)
            ),
        }
    }
}

impl std::fmt::Display for DdlStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_sql())
    }
}
