//! Schema synchronizer.
//!
//! Reconciles the live database with the schema definitions:
//!
//! 1. load definitions (an empty set ends the run with `NothingToSync`)
//! 2. load live indexes and foreign keys for the definitions' schema
//! 3. drop indexes that no longer match a definition
//! 4. sync each table, referenced tables first
//!
//! Every DDL statement is autocommitted on its own. A failure stops the run
//! and leaves earlier statements applied.

pub mod ddl;
pub mod target;


pub use ddl::DdlStatement;
pub use target::{MySqlTarget, SchemaTarget};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::db::schema::{
    ColumnDefinition, ColumnType, LiveColumn, LiveIndex, SchemaDefinition, PRIMARY_KEY,
};
use crate::error::DbError;
use crate::util::resolve_dependencies;
use ddl::{default_text, foreign_key_name, index_name, mysql_data_type, FOREIGN_KEY_SUFFIX};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Print statements instead of executing them.
    pub dry_run: bool,
    /// Also print informational lines.
    pub verbose: bool,
}

/// Statements a run emitted, executed or printed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub statements: Vec<DdlStatement>,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn sql(&self) -> Vec<String> {
        self.statements.iter().map(DdlStatement::to_sql).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    NothingToSync,
    Completed(SyncReport),
}

pub struct Synchronizer<T: SchemaTarget> {
    definitions: Arc<IndexMap<String, Arc<SchemaDefinition>>>,
    target: T,
    options: SyncOptions,
    out: Box<dyn Write>,
    indexes: Vec<LiveIndex>,
    tables: HashMap<String, Vec<String>>,
    report: SyncReport,
}

impl<T: SchemaTarget> Synchronizer<T> {
    pub fn new(
        definitions: Arc<IndexMap<String, Arc<SchemaDefinition>>>,
        target: T,
        options: SyncOptions,
    ) -> Self {
        Self {
            definitions,
            target,
            options,
            out: Box::new(std::io::stdout()),
            indexes: Vec::new(),
            tables: HashMap::new(),
            report: SyncReport::default(),
        }
    }

    /// Send printed lines somewhere other than stdout.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn run(&mut self) -> Result<SyncOutcome, DbError> {
        self.report = SyncReport::default();
        self.tables.clear();

        let definitions = Arc::clone(&self.definitions);
        let Some(first) = definitions.values().next() else {
            self.info("No schema definitions to sync")?;
            return Ok(SyncOutcome::NothingToSync);
        };

        self.indexes = self.target.live_indexes(&first.schema)?;
        log::debug!(
            "Loaded {} live index entries for schema '{}'",
            self.indexes.len(),
            first.schema
        );

        for definition in definitions.values() {
            self.drop_stale_indexes(definition)
                .map_err(|e| DbError::sync(definition.table.as_str(), e))?;
        }

        for definition in sync_order(&definitions)? {
            self.sync_table(&definition)
                .map_err(|e| DbError::sync(definition.table.as_str(), e))?;
        }

        Ok(SyncOutcome::Completed(std::mem::take(&mut self.report)))
    }

    fn info(&mut self, message: &str) -> Result<(), DbError> {
        log::debug!("{}", message);
        if self.options.verbose {
            writeln!(self.out, "[info] {}", message)?;
        }
        Ok(())
    }

    fn emit(&mut self, schema: &str, statement: DdlStatement) -> Result<(), DbError> {
        let sql = statement.to_sql();
        if self.options.dry_run {
            writeln!(self.out, "[dry-run] {};", sql)?;
        } else {
            if self.options.verbose {
                writeln!(self.out, "[exec] {};", sql)?;
            }
            log::info!("{}", sql);
            self.target.apply(schema, &statement)?;
        }
        self.track(schema, &statement);
        self.report.statements.push(statement);
        Ok(())
    }

    /// Keep the in-memory index list in step with emitted DDL, dry-run
    /// included, so later checks see the intended state.
    fn track(&mut self, schema: &str, statement: &DdlStatement) {
        match statement {
            DdlStatement::DropIndex { table, name } => self
                .indexes
                .retain(|i| !(i.table == *table && i.name == *name && !i.constraint)),
            DdlStatement::DropForeignKey { table, name } => self
                .indexes
                .retain(|i| !(i.table == *table && i.name == *name && i.constraint)),
            DdlStatement::AddIndex {
                table,
                column,
                name,
                unique,
            } => self.indexes.push(LiveIndex {
                table: table.clone(),
                column: column.clone(),
                name: name.clone(),
                is_unique: *unique,
                constraint: false,
            }),
            DdlStatement::AddForeignKey {
                table, column, name, ..
            } => self.indexes.push(LiveIndex {
                table: table.clone(),
                column: column.clone(),
                name: name.clone(),
                is_unique: false,
                constraint: true,
            }),
            DdlStatement::CreateTable { table, columns } => {
                for (column, definition) in columns {
                    if definition.indexed {
                        self.indexes.push(LiveIndex {
                            table: table.clone(),
                            column: column.clone(),
                            name: index_name(table, column),
                            is_unique: definition.unique,
                            constraint: false,
                        });
                    }
                    if let Some(fk) = &definition.foreign_key {
                        self.indexes.push(LiveIndex {
                            table: table.clone(),
                            column: column.clone(),
                            name: foreign_key_name(table, column, fk),
                            is_unique: false,
                            constraint: true,
                        });
                    }
                }
                if let Some(tables) = self.tables.get_mut(schema) {
                    if !tables.contains(table) {
                        tables.push(table.clone());
                    }
                }
            }
            DdlStatement::DropColumn { table, column } => self
                .indexes
                .retain(|i| !(i.table == *table && i.column == *column)),
            DdlStatement::AddColumn { .. } | DdlStatement::ModifyColumn { .. } => {}
        }
    }

    fn table_exists(&mut self, schema: &str, table: &str) -> Result<bool, DbError> {
        if !self.tables.contains_key(schema) {
            let tables = self.target.live_tables(schema)?;
            self.tables.insert(schema.to_string(), tables);
        }
        Ok(self
            .tables
            .get(schema)
            .map(|tables| tables.iter().any(|t| t == table))
            .unwrap_or(false))
    }

    fn drop_stale_indexes(&mut self, definition: &SchemaDefinition) -> Result<(), DbError> {
        let table = definition.table.as_str();
        let mut stale: Vec<String> = Vec::new();

        for entry in self.indexes.iter().filter(|i| i.table == table) {
            if is_stale(definition, entry) && !stale.contains(&entry.name) {
                stale.push(entry.name.clone());
            }
        }

        for name in stale {
            let has_constraint = self
                .indexes
                .iter()
                .any(|i| i.table == table && i.name == name && i.constraint);
            let has_index = self
                .indexes
                .iter()
                .any(|i| i.table == table && i.name == name && !i.constraint);

            if has_constraint {
                self.emit(
                    &definition.schema,
                    DdlStatement::DropForeignKey {
                        table: table.to_string(),
                        name: name.clone(),
                    },
                )?;
            }
            if has_index {
                self.emit(
                    &definition.schema,
                    DdlStatement::DropIndex {
                        table: table.to_string(),
                        name,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn sync_table(&mut self, definition: &SchemaDefinition) -> Result<(), DbError> {
        let schema = definition.schema.as_str();
        let table = definition.table.as_str();
        let emitted_before = self.report.statements.len();

        if !self.table_exists(schema, table)? {
            let columns: Vec<(String, ColumnDefinition)> = definition
                .data_columns()
                .map(|(name, column)| (name.clone(), column.clone()))
                .collect();
            return self.emit(
                schema,
                DdlStatement::CreateTable {
                    table: table.to_string(),
                    columns,
                },
            );
        }

        let live = self.target.live_columns(schema, table)?;
        for (name, column) in definition.data_columns() {
            match live.iter().find(|c| c.name == *name) {
                None => self.emit(
                    schema,
                    DdlStatement::AddColumn {
                        table: table.to_string(),
                        column: name.clone(),
                        definition: column.clone(),
                    },
                )?,
                Some(existing) if column_has_changed(column, existing) => self.emit(
                    schema,
                    DdlStatement::ModifyColumn {
                        table: table.to_string(),
                        column: name.clone(),
                        definition: column.clone(),
                    },
                )?,
                Some(_) => {}
            }
            self.ensure_indexes(schema, table, name, column)?;
        }

        for existing in &live {
            if existing.name != PRIMARY_KEY && !definition.has_column(&existing.name) {
                self.emit(
                    schema,
                    DdlStatement::DropColumn {
                        table: table.to_string(),
                        column: existing.name.clone(),
                    },
                )?;
            }
        }

        if self.report.statements.len() == emitted_before {
            self.info(&format!("Table `{}` is up to date", table))?;
        }
        Ok(())
    }

    fn ensure_indexes(
        &mut self,
        schema: &str,
        table: &str,
        column: &str,
        definition: &ColumnDefinition,
    ) -> Result<(), DbError> {
        if definition.indexed {
            let name = index_name(table, column);
            let exists = self.indexes.iter().any(|i| {
                i.table == table
                    && i.column == column
                    && i.name == name
                    && i.is_unique == definition.unique
                    && !i.constraint
            });
            if !exists {
                self.emit(
                    schema,
                    DdlStatement::AddIndex {
                        table: table.to_string(),
                        column: column.to_string(),
                        name,
                        unique: definition.unique,
                    },
                )?;
            }
        }

        if let Some(fk) = &definition.foreign_key {
            let name = foreign_key_name(table, column, fk);
            let exists = self
                .indexes
                .iter()
                .any(|i| i.table == table && i.column == column && i.name == name && i.constraint);
            if !exists {
                self.emit(
                    schema,
                    DdlStatement::AddForeignKey {
                        table: table.to_string(),
                        column: column.to_string(),
                        name,
                        references: fk.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }
}

/// Whether a live index entry no longer matches its table's definition.
fn is_stale(definition: &SchemaDefinition, entry: &LiveIndex) -> bool {
    let Some(column) = definition.columns.get(&entry.column) else {
        // Column is gone.
        return true;
    };
    let expected_fk = column
        .foreign_key
        .as_ref()
        .map(|fk| foreign_key_name(&definition.table, &entry.column, fk));

    if entry.constraint || entry.name.ends_with(FOREIGN_KEY_SUFFIX) {
        // Foreign key (or its backing index) with no declaration, or one
        // pointing somewhere else now.
        return expected_fk.as_deref() != Some(entry.name.as_str());
    }

    if !column.indexed {
        return column.foreign_key.is_none();
    }
    entry.is_unique != column.unique || entry.name != index_name(&definition.table, &entry.column)
}

/// Definitions ordered so referenced tables come before the tables that
/// reference them.
fn sync_order(
    definitions: &IndexMap<String, Arc<SchemaDefinition>>,
) -> Result<Vec<Arc<SchemaDefinition>>, DbError> {
    let by_table: IndexMap<&str, &Arc<SchemaDefinition>> = definitions
        .values()
        .map(|d| (d.table.as_str(), d))
        .collect();

    let graph: IndexMap<String, Vec<String>> = by_table
        .iter()
        .map(|(table, definition)| {
            let deps = definition
                .referenced_tables()
                .into_iter()
                .filter(|t| by_table.contains_key(t.as_str()))
                .collect();
            (table.to_string(), deps)
        })
        .collect();

    Ok(resolve_dependencies(&graph)?
        .iter()
        .filter_map(|table| by_table.get(table.as_str()).map(|d| Arc::clone(d)))
        .collect())
}

/// Parse the option list out of `enum('a','b')`.
fn enum_options(column_type: &str) -> Vec<String> {
    let inner = column_type
        .trim()
        .strip_prefix("enum(")
        .and_then(|rest| rest.strip_suffix(')'))
        .unwrap_or("");
    let mut options = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = inner.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' if in_quote && chars.peek() == Some(&'\'') => {
                current.push('\'');
                chars.next();
            }
            '\'' => {
                if in_quote {
                    options.push(std::mem::take(&mut current));
                }
                in_quote = !in_quote;
            }
            _ if in_quote => current.push(ch),
            _ => {}
        }
    }
    options
}

/// Compare a declared column with its introspected form. Index flags are
/// not part of the comparison; indexes are reconciled separately.
pub fn column_has_changed(declared: &ColumnDefinition, live: &LiveColumn) -> bool {
    if default_text(declared) != live.default_value {
        return true;
    }
    if declared.nullable != live.is_nullable {
        return true;
    }
    if mysql_data_type(declared.column_type) != live.data_type {
        return true;
    }
    if declared.column_type.is_integer() && declared.unsigned != live.column_type.contains("unsigned") {
        return true;
    }
    match declared.column_type {
        ColumnType::Enum => declared.options != enum_options(&live.column_type),
        ColumnType::Varchar => declared.length.map(u64::from) != live.max_length,
        _ => false,
    }
}
