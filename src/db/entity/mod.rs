//! Entities and the identity/cache layer that loads and saves them.

pub mod store;

pub use store::EntityStore;

use indexmap::{IndexMap, IndexSet};
use std::sync::Arc;

use super::query::as_id;
use super::schema::{Row, SchemaDefinition, PRIMARY_KEY};
use crate::error::DbError;

/// One record of a defined type.
///
/// Only declared columns can be read or written. The id is assigned once,
/// by the first save or by loading a row, and never changes afterwards.
#[derive(Debug, Clone)]
pub struct Entity {
    definition: Arc<SchemaDefinition>,
    id: Option<i64>,
    fields: IndexMap<String, serde_json::Value>,
    dirty: IndexSet<String>,
}

impl Entity {
    pub fn new(definition: Arc<SchemaDefinition>) -> Self {
        Self {
            definition,
            id: None,
            fields: IndexMap::new(),
            dirty: IndexSet::new(),
        }
    }

    /// Populate from a fetched row. Undeclared columns are ignored and
    /// nothing is marked dirty.
    pub fn from_row(definition: Arc<SchemaDefinition>, row: Row) -> Self {
        let mut entity = Self::new(definition);
        for (column, value) in row {
            if column == PRIMARY_KEY {
                entity.id = as_id(&value);
            } else if entity.definition.has_column(&column) {
                entity.fields.insert(column, value);
            }
        }
        entity
    }

    pub fn definition(&self) -> &Arc<SchemaDefinition> {
        &self.definition
    }

    pub fn table(&self) -> &str {
        &self.definition.table
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn get(&self, field: &str) -> Result<Option<serde_json::Value>, DbError> {
        if field == PRIMARY_KEY {
            return Ok(self.id.map(serde_json::Value::from));
        }
        self.check_field(field)?;
        Ok(self.fields.get(field).cloned())
    }

    /// Set a field, marking it dirty unless the value is unchanged.
    pub fn set(&mut self, field: &str, value: impl Into<serde_json::Value>) -> Result<(), DbError> {
        let value = value.into();
        if field == PRIMARY_KEY {
            return self.set_id(&value);
        }
        self.check_field(field)?;
        if self.fields.get(field) == Some(&value) {
            return Ok(());
        }
        self.fields.insert(field.to_string(), value);
        self.dirty.insert(field.to_string());
        Ok(())
    }

    fn set_id(&mut self, value: &serde_json::Value) -> Result<(), DbError> {
        let id = as_id(value).ok_or_else(|| {
            DbError::Query(format!("invalid id {} for table '{}'", value, self.table()))
        })?;
        match self.id {
            Some(current) if current == id => Ok(()),
            Some(_) => Err(DbError::ImmutableId {
                table: self.table().to_string(),
            }),
            None => {
                self.id = Some(id);
                Ok(())
            }
        }
    }

    fn check_field(&self, field: &str) -> Result<(), DbError> {
        if self.definition.has_column(field) {
            Ok(())
        } else {
            Err(DbError::UnknownField {
                table: self.table().to_string(),
                field: field.to_string(),
            })
        }
    }

    pub fn fields(&self) -> &IndexMap<String, serde_json::Value> {
        &self.fields
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Whether the record carries a soft-delete flag set to 1.
    pub fn is_soft_deleted(&self) -> bool {
        self.definition.has_column(SOFT_DELETE_COLUMN)
            && self.fields.get(SOFT_DELETE_COLUMN).and_then(as_id) == Some(1)
    }

    /// The id followed by every loaded field, the form kept in the cache.
    pub fn to_row(&self) -> Row {
        let mut row = Row::new();
        if let Some(id) = self.id {
            row.insert(PRIMARY_KEY.to_string(), serde_json::Value::from(id));
        }
        for (field, value) in &self.fields {
            row.insert(field.clone(), value.clone());
        }
        row
    }

    pub(crate) fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    /// Store a value without marking it dirty.
    pub(crate) fn fill(&mut self, field: &str, value: serde_json::Value) {
        self.fields.insert(field.to_string(), value);
    }

    pub(crate) fn has_value(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub(crate) fn mark_dirty(&mut self, field: &str) {
        self.dirty.insert(field.to_string());
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

/// Column whose value 1 marks a row as deleted without removing it.
pub const SOFT_DELETE_COLUMN: &str = "is_deleted";
