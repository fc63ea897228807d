use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::DbError;

/// A database row: column name to JSON value, in projection order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Default value that resolves to the current timestamp when an entity is saved.
pub const DEFAULT_NOW: &str = "NOW";

/// Name of the auto-increment primary key every managed table carries.
pub const PRIMARY_KEY: &str = "id";

/// Column types a schema definition may declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    Int,
    #[serde(alias = "TINYINT")]
    TinyInt,
    Varchar,
    Enum,
    Datetime,
    Text,
    #[serde(alias = "MEDIUMTEXT")]
    MediumText,
    #[serde(alias = "LONGTEXT")]
    LongText,
    Float,
}

impl ColumnType {
    pub fn is_integer(self) -> bool {
        matches!(self, ColumnType::Int | ColumnType::TinyInt)
    }
}

/// Target of a foreign key declared as `"table"` or `"table:column"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

impl ForeignKey {
    pub fn parse(reference: &str) -> Result<Self, DbError> {
        let reference = reference.trim();
        let (table, column) = match reference.split_once(':') {
            Some((table, column)) => (table.trim(), column.trim()),
            None => (reference, PRIMARY_KEY),
        };
        if table.is_empty() || column.is_empty() {
            return Err(DbError::Configuration(format!(
                "invalid foreign key reference '{}'",
                reference
            )));
        }
        Ok(Self {
            table: table.to_string(),
            column: column.to_string(),
        })
    }
}

/// A column as written in the definitions file, before normalization.
#[derive(Debug, Clone, Deserialize)]
struct RawColumn {
    #[serde(rename = "type")]
    column_type: ColumnType,
    #[serde(default)]
    length: Option<u32>,
    #[serde(default)]
    nullable: bool,
    #[serde(default)]
    default: Option<serde_json::Value>,
    #[serde(default, alias = "index")]
    indexed: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    unsigned: Option<bool>,
    #[serde(default)]
    foreign_key: Option<String>,
    #[serde(default)]
    options: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDefinition {
    table: String,
    schema: String,
    #[serde(default)]
    columns: IndexMap<String, RawColumn>,
}

/// Normalized column metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    pub column_type: ColumnType,
    pub length: Option<u32>,
    pub nullable: bool,
    pub default: Option<serde_json::Value>,
    pub indexed: bool,
    pub unique: bool,
    pub unsigned: bool,
    pub foreign_key: Option<ForeignKey>,
    pub options: Vec<String>,
}

impl ColumnDefinition {
    /// A non-null column of the given type with every flag at its default.
    pub fn new(column_type: ColumnType) -> Self {
        Self {
            column_type,
            length: None,
            nullable: false,
            default: None,
            indexed: false,
            unique: false,
            unsigned: column_type.is_integer(),
            foreign_key: None,
            options: Vec::new(),
        }
    }

    pub fn varchar(length: u32) -> Self {
        Self {
            length: Some(length),
            ..Self::new(ColumnType::Varchar)
        }
    }

    pub fn enumeration(options: &[&str]) -> Self {
        Self {
            options: options.iter().map(|o| o.to_string()).collect(),
            ..Self::new(ColumnType::Enum)
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self.indexed = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn references(mut self, reference: &str) -> Result<Self, DbError> {
        self.foreign_key = Some(ForeignKey::parse(reference)?);
        Ok(self)
    }

    /// Whether the default is the save-time timestamp sentinel.
    pub fn defaults_to_now(&self) -> bool {
        matches!(&self.default, Some(serde_json::Value::String(s)) if s == DEFAULT_NOW)
    }

    /// Reject column shapes that cannot be rendered or kept in sync.
    pub fn validate(&self, table: &str, name: &str) -> Result<(), DbError> {
        let problem = if self.column_type == ColumnType::Varchar && self.length.is_none() {
            "is VARCHAR without a length"
        } else if self.column_type == ColumnType::Enum && self.options.is_empty() {
            "is ENUM without options"
        } else if self.unique && !self.indexed {
            "is unique but not indexed"
        } else {
            return Ok(());
        };
        Err(DbError::Configuration(format!(
            "column '{}.{}' {}",
            table, name, problem
        )))
    }

    fn normalize(table: &str, name: &str, raw: RawColumn) -> Result<Self, DbError> {
        let foreign_key = raw.foreign_key.as_deref().map(ForeignKey::parse).transpose()?;

        let column = Self {
            column_type: raw.column_type,
            length: raw.length,
            nullable: raw.nullable,
            // A JSON null default is the same as no default.
            default: raw.default.filter(|v| !v.is_null()),
            indexed: raw.indexed || raw.unique,
            unique: raw.unique,
            unsigned: raw.unsigned.unwrap_or(true) && raw.column_type.is_integer(),
            foreign_key,
            options: raw.options,
        };
        column.validate(table, name)?;
        Ok(column)
    }
}

/// Declarative description of one entity type's table.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDefinition {
    pub type_name: String,
    pub table: String,
    pub schema: String,
    pub columns: IndexMap<String, ColumnDefinition>,
}

impl SchemaDefinition {
    pub fn new(type_name: &str, schema: &str, table: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            table: table.to_string(),
            schema: schema.to_string(),
            columns: IndexMap::new(),
        }
    }

    pub fn column(mut self, name: &str, definition: ColumnDefinition) -> Self {
        self.columns.insert(name.to_string(), definition);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Declared columns other than the primary key.
    pub fn data_columns(&self) -> impl Iterator<Item = (&String, &ColumnDefinition)> {
        self.columns.iter().filter(|(name, _)| name.as_str() != PRIMARY_KEY)
    }

    /// Tables this definition references through foreign keys, excluding itself.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for (_, column) in self.data_columns() {
            if let Some(fk) = &column.foreign_key {
                if fk.table != self.table && !tables.contains(&fk.table) {
                    tables.push(fk.table.clone());
                }
            }
        }
        tables
    }
}

/// Parse a definitions document: `{ "TypeName": { table, schema, columns } }`.
pub fn parse_definitions(json: &str) -> Result<IndexMap<String, Arc<SchemaDefinition>>, DbError> {
    let raw: IndexMap<String, RawDefinition> = serde_json::from_str(json)?;
    let mut definitions = IndexMap::with_capacity(raw.len());

    for (type_name, def) in raw {
        let mut columns = IndexMap::with_capacity(def.columns.len());
        for (name, column) in def.columns {
            let normalized = ColumnDefinition::normalize(&def.table, &name, column)?;
            columns.insert(name, normalized);
        }
        definitions.insert(
            type_name.clone(),
            Arc::new(SchemaDefinition {
                type_name,
                table: def.table,
                schema: def.schema,
                columns,
            }),
        );
    }

    Ok(definitions)
}

/// Where the definition store reads its document from.
#[derive(Debug, Clone)]
pub enum DefinitionSource {
    File(PathBuf),
    Json(String),
    Loaded(Vec<SchemaDefinition>),
}

/// Lazily loaded, memoized mapping from type name to definition.
///
/// The first successful load is kept for the lifetime of the store; a failed
/// load is not memoized, so it is retried on the next call.
pub struct DefinitionStore {
    source: DefinitionSource,
    loaded: Mutex<Option<Arc<IndexMap<String, Arc<SchemaDefinition>>>>>,
}

impl DefinitionStore {
    pub fn new(source: DefinitionSource) -> Self {
        Self {
            source,
            loaded: Mutex::new(None),
        }
    }

    pub fn from_definitions(definitions: Vec<SchemaDefinition>) -> Self {
        Self::new(DefinitionSource::Loaded(definitions))
    }

    /// All definitions, in document order.
    pub fn all(&self) -> Result<Arc<IndexMap<String, Arc<SchemaDefinition>>>, DbError> {
        let mut guard = self
            .loaded
            .lock()
            .map_err(|e| DbError::Configuration(format!("definition store lock poisoned: {}", e)))?;
        if let Some(defs) = guard.as_ref() {
            return Ok(Arc::clone(defs));
        }

        let defs = Arc::new(self.load()?);
        log::debug!("Loaded {} schema definitions", defs.len());
        *guard = Some(Arc::clone(&defs));
        Ok(defs)
    }

    /// Definition for a type name.
    pub fn get(&self, type_name: &str) -> Result<Arc<SchemaDefinition>, DbError> {
        self.all()?
            .get(type_name)
            .cloned()
            .ok_or_else(|| DbError::Configuration(format!("no schema definition for '{}'", type_name)))
    }

    fn load(&self) -> Result<IndexMap<String, Arc<SchemaDefinition>>, DbError> {
        match &self.source {
            DefinitionSource::File(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    DbError::Configuration(format!("cannot read definitions {:?}: {}", path, e))
                })?;
                parse_definitions(&json)
            }
            DefinitionSource::Json(json) => parse_definitions(json),
            DefinitionSource::Loaded(defs) => {
                let mut definitions = IndexMap::with_capacity(defs.len());
                for def in defs {
                    for (name, column) in &def.columns {
                        column.validate(&def.table, name)?;
                    }
                    definitions.insert(def.type_name.clone(), Arc::new(def.clone()));
                }
                Ok(definitions)
            }
        }
    }
}

/// A column as reported by live introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveColumn {
    pub name: String,
    /// Base type, lower case (`int`, `varchar`, `enum`, ...).
    pub data_type: String,
    /// Full type text (`int(10) unsigned`, `enum('a','b')`, ...).
    pub column_type: String,
    pub is_nullable: bool,
    pub default_value: Option<String>,
    pub max_length: Option<u64>,
}

/// One (column, index name, uniqueness) entry from live introspection.
///
/// Foreign-key constraints are reported as entries with `constraint` set; the
/// index backing a constraint is reported separately without it.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveIndex {
    pub table: String,
    pub column: String,
    pub name: String,
    pub is_unique: bool,
    pub constraint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFINITIONS: &str = r#"{
        "App\\User": {
            "table": "users",
            "schema": "app",
            "columns": {
                "email": { "type": "VARCHAR", "length": 120, "unique": true },
                "age": { "type": "TINY_INT", "nullable": true },
                "role": { "type": "ENUM", "options": ["admin", "member"], "default": "member" },
                "created_at": { "type": "DATETIME", "default": "NOW" }
            }
        },
        "App\\Post": {
            "table": "posts",
            "schema": "app",
            "columns": {
                "user_id": { "type": "INT", "foreign_key": "users", "index": true },
                "title": { "type": "VARCHAR", "length": 200 },
                "score": { "type": "FLOAT", "unsigned": true }
            }
        }
    }"#;

    #[test]
    fn test_parse_and_normalize() {
        let defs = parse_definitions(DEFINITIONS).unwrap();
        assert_eq!(defs.len(), 2);

        let users = &defs["App\\User"];
        assert_eq!(users.table, "users");
        assert_eq!(users.schema, "app");

        let email = &users.columns["email"];
        assert!(email.unique);
        assert!(email.indexed, "unique implies indexed");
        assert_eq!(email.length, Some(120));

        assert!(users.columns["age"].unsigned);
        assert!(users.columns["age"].nullable);
        assert!(users.columns["created_at"].defaults_to_now());

        let posts = &defs["App\\Post"];
        let fk = posts.columns["user_id"].foreign_key.as_ref().unwrap();
        assert_eq!(fk.table, "users");
        assert_eq!(fk.column, "id");
        assert!(!posts.columns["score"].unsigned, "only integers are unsigned");
        assert_eq!(posts.referenced_tables(), vec!["users".to_string()]);
    }

    #[test]
    fn test_varchar_without_length_fails() {
        let json = r#"{ "T": { "table": "t", "schema": "s", "columns": { "name": { "type": "VARCHAR" } } } }"#;
        assert!(matches!(parse_definitions(json), Err(DbError::Configuration(_))));
    }

    #[test]
    fn test_enum_without_options_fails() {
        let json = r#"{ "T": { "table": "t", "schema": "s", "columns": { "kind": { "type": "ENUM" } } } }"#;
        assert!(matches!(parse_definitions(json), Err(DbError::Configuration(_))));
    }

    #[test]
    fn test_mysql_type_spellings_parse() {
        for spelling in ["TINYINT", "TINY_INT"] {
            let json = format!(
                r#"{{ "T": {{ "table": "t", "schema": "s", "columns": {{ "flag": {{ "type": "{}" }} }} }} }}"#,
                spelling
            );
            let defs = parse_definitions(&json).unwrap();
            assert_eq!(defs["T"].columns["flag"].column_type, ColumnType::TinyInt);
        }
        let column: ColumnType = serde_json::from_str(r#""LONGTEXT""#).unwrap();
        assert_eq!(column, ColumnType::LongText);
    }

    #[test]
    fn test_loaded_definitions_are_validated() {
        let unique_only = ColumnDefinition {
            unique: true,
            ..ColumnDefinition::varchar(40)
        };
        let broken = [
            ("name", ColumnDefinition::new(ColumnType::Varchar)),
            ("kind", ColumnDefinition::new(ColumnType::Enum)),
            ("code", unique_only),
        ];
        for (name, column) in broken {
            let store = DefinitionStore::from_definitions(vec![
                SchemaDefinition::new("T", "s", "t").column(name, column)
            ]);
            let err = store.all().unwrap_err();
            assert!(matches!(err, DbError::Configuration(ref msg) if msg.contains(&format!("t.{}", name))));
        }

        let store = DefinitionStore::from_definitions(vec![SchemaDefinition::new("T", "s", "t")
            .column("code", ColumnDefinition::varchar(40).unique())]);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_key_with_column() {
        let fk = ForeignKey::parse("accounts:uuid").unwrap();
        assert_eq!(fk.table, "accounts");
        assert_eq!(fk.column, "uuid");
        assert!(ForeignKey::parse(":id").is_err());
    }

    #[test]
    fn test_store_memoizes_and_reports_missing() {
        let store = DefinitionStore::new(DefinitionSource::Json(DEFINITIONS.to_string()));
        let first = store.all().unwrap();
        let second = store.all().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.get("App\\Post").unwrap().table, "posts");
        assert!(matches!(store.get("App\\Nope"), Err(DbError::Configuration(_))));
    }

    #[test]
    fn test_store_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("definitions.json");
        std::fs::write(&path, DEFINITIONS).unwrap();

        let store = DefinitionStore::new(DefinitionSource::File(path));
        assert_eq!(store.all().unwrap().len(), 2);
    }
}
