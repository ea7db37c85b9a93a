//! Versioned table schemas

pub mod registry;

pub use registry::SchemaRegistry;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{LakeError, LakeResult};
use crate::ids::{ColumnId, SchemaVersionId, SnapshotId};
use crate::manifest::StoredRow;
use crate::value::{DataType, Row, Value};

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Assigned when the column joins a schema
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Applied to inserts that omit the column
    pub default: Option<Value>,
    /// Value seen by rows written before the column existed
    pub initial_default: Option<Value>,
}

impl ColumnDef {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            id: ColumnId(0),
            name: name.to_string(),
            data_type,
            nullable: true,
            default: None,
            initial_default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Schema change requests, staged inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchemaChangeOp {
    CreateTable {
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    },
    DropTable,
    AddColumn {
        column: ColumnDef,
    },
    DropColumn {
        name: String,
    },
    RenameColumn {
        from: String,
        to: String,
    },
    /// Requires every existing value to be castable
    ChangeType {
        column: String,
        data_type: DataType,
    },
    /// Requires a scan for existing NULLs
    SetNotNull {
        column: String,
    },
    DropNotNull {
        column: String,
    },
    SetDefault {
        column: String,
        default: Option<Value>,
    },
    /// Requires a scan for existing duplicates
    AddUnique {
        columns: Vec<String>,
    },
}

impl SchemaChangeOp {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaChangeOp::CreateTable { .. } => "CREATE TABLE",
            SchemaChangeOp::DropTable => "DROP TABLE",
            SchemaChangeOp::AddColumn { .. } => "ADD COLUMN",
            SchemaChangeOp::DropColumn { .. } => "DROP COLUMN",
            SchemaChangeOp::RenameColumn { .. } => "RENAME COLUMN",
            SchemaChangeOp::ChangeType { .. } => "ALTER COLUMN TYPE",
            SchemaChangeOp::SetNotNull { .. } => "SET NOT NULL",
            SchemaChangeOp::DropNotNull { .. } => "DROP NOT NULL",
            SchemaChangeOp::SetDefault { .. } => "SET DEFAULT",
            SchemaChangeOp::AddUnique { .. } => "ADD UNIQUE",
        }
    }
}

/// One immutable version of a table's schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub table: String,
    pub version_id: SchemaVersionId,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<ColumnId>,
    pub unique: Vec<Vec<ColumnId>>,
    pub valid_from_snapshot: SnapshotId,
    pub next_column_id: u32,
}

impl SchemaVersion {
    /// Build the first schema of a table. Version and snapshot are filled in at commit.
    pub fn initial(
        table: &str,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    ) -> LakeResult<Self> {
        if columns.is_empty() {
            return Err(LakeError::InvalidInput(format!(
                "table '{}' needs at least one column",
                table
            )));
        }

        let mut schema = SchemaVersion {
            table: table.to_string(),
            version_id: SchemaVersionId(1),
            columns: Vec::with_capacity(columns.len()),
            primary_key: Vec::new(),
            unique: Vec::new(),
            valid_from_snapshot: SnapshotId(0),
            next_column_id: 1,
        };

        for column in columns {
            schema.push_column(column, false)?;
        }

        schema.primary_key = schema.resolve_key(&primary_key)?;
        for id in schema.primary_key.clone() {
            if let Some(col) = schema.columns.iter_mut().find(|c| c.id == id) {
                col.nullable = false;
            }
        }
        Ok(schema)
    }

    pub fn column(&self, name: &str) -> LakeResult<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| LakeError::ColumnNotFound(format!("{}.{}", self.table, name)))
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.id == id)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Read a stored row through this schema. Columns the row predates take
    /// their initial default; stored values are cast to the current types.
    pub fn project(&self, stored: &StoredRow) -> LakeResult<Row> {
        let mut row = Row::new(stored.row_id);
        for col in &self.columns {
            let value = match stored.values.get(&col.id) {
                Some(v) => v.cast_to(&col.data_type)?,
                None => col.initial_default.clone().unwrap_or(Value::Null),
            };
            row.insert(col.name.clone(), value);
        }
        Ok(row)
    }

    /// Primary key first, then unique constraints
    pub fn unique_keys(&self) -> Vec<Vec<ColumnId>> {
        let mut keys = Vec::new();
        if !self.primary_key.is_empty() {
            keys.push(self.primary_key.clone());
        }
        keys.extend(self.unique.iter().cloned());
        keys
    }

    pub fn key_names(&self, key: &[ColumnId]) -> String {
        key.iter()
            .filter_map(|id| self.column_by_id(*id))
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn resolve_key(&self, names: &[String]) -> LakeResult<Vec<ColumnId>> {
        let mut seen = HashSet::new();
        names
            .iter()
            .map(|name| {
                if !seen.insert(name.as_str()) {
                    return Err(LakeError::InvalidInput(format!(
                        "column '{}' listed twice in key",
                        name
                    )));
                }
                self.column(name).map(|c| c.id)
            })
            .collect()
    }

    fn push_column(&mut self, mut column: ColumnDef, added_later: bool) -> LakeResult<()> {
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(LakeError::AlreadyExists(format!(
                "column '{}' in table '{}'",
                column.name, self.table
            )));
        }
        if column.name.is_empty() {
            return Err(LakeError::InvalidInput("column name cannot be empty".into()));
        }

        column.default = column
            .default
            .map(|v| v.cast_to(&column.data_type))
            .transpose()?;
        if column.default.as_ref().is_some_and(Value::is_null) {
            column.default = None;
        }
        if !column.nullable && added_later && column.default.is_none() {
            return Err(LakeError::Validation(format!(
                "column '{}' is NOT NULL and needs a default for existing rows",
                column.name
            )));
        }

        column.id = ColumnId(self.next_column_id);
        self.next_column_id += 1;
        column.initial_default = if added_later {
            column.default.clone()
        } else {
            None
        };
        self.columns.push(column);
        Ok(())
    }

    fn column_mut(&mut self, name: &str) -> LakeResult<&mut ColumnDef> {
        let table = self.table.clone();
        self.columns
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| LakeError::ColumnNotFound(format!("{}.{}", table, name)))
    }

    /// Apply a column-level change, returning the new schema.
    ///
    /// Checks that need table data (castability, existing NULLs,
    /// duplicates) are left to the caller.
    pub fn apply(&self, op: &SchemaChangeOp) -> LakeResult<SchemaVersion> {
        let mut next = self.clone();
        match op {
            SchemaChangeOp::CreateTable { .. } | SchemaChangeOp::DropTable => {
                return Err(LakeError::InvalidInput(format!(
                    "{} is not a column change",
                    op.name()
                )));
            }
            SchemaChangeOp::AddColumn { column } => {
                next.push_column(column.clone(), true)?;
            }
            SchemaChangeOp::DropColumn { name } => {
                let id = next.column(name)?.id;
                if next.primary_key.contains(&id) {
                    return Err(LakeError::Validation(format!(
                        "cannot drop primary key column '{}'",
                        name
                    )));
                }
                if next.columns.len() == 1 {
                    return Err(LakeError::Validation(format!(
                        "cannot drop the only column of '{}'",
                        next.table
                    )));
                }
                next.columns.retain(|c| c.id != id);
                next.unique.retain(|key| !key.contains(&id));
            }
            SchemaChangeOp::RenameColumn { from, to } => {
                if from != to && next.columns.iter().any(|c| &c.name == to) {
                    return Err(LakeError::AlreadyExists(format!(
                        "column '{}' in table '{}'",
                        to, next.table
                    )));
                }
                next.column_mut(from)?.name = to.clone();
            }
            SchemaChangeOp::ChangeType { column, data_type } => {
                let col = next.column_mut(column)?;
                col.default = col.default.as_ref().map(|v| v.cast_to(data_type)).transpose()?;
                col.initial_default = col
                    .initial_default
                    .as_ref()
                    .map(|v| v.cast_to(data_type))
                    .transpose()?;
                col.data_type = data_type.clone();
            }
            SchemaChangeOp::SetNotNull { column } => {
                next.column_mut(column)?.nullable = false;
            }
            SchemaChangeOp::DropNotNull { column } => {
                let id = next.column(column)?.id;
                if next.primary_key.contains(&id) {
                    return Err(LakeError::Validation(format!(
                        "primary key column '{}' must stay NOT NULL",
                        column
                    )));
                }
                next.column_mut(column)?.nullable = true;
            }
            SchemaChangeOp::SetDefault { column, default } => {
                let col = next.column_mut(column)?;
                col.default = match default {
                    Some(v) if !v.is_null() => Some(v.cast_to(&col.data_type)?),
                    _ => None,
                };
            }
            SchemaChangeOp::AddUnique { columns } => {
                if columns.is_empty() {
                    return Err(LakeError::InvalidInput("unique constraint needs columns".into()));
                }
                let key = next.resolve_key(columns)?;
                if !next.unique_keys().contains(&key) {
                    next.unique.push(key);
                }
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> SchemaVersion {
        SchemaVersion::initial(
            "events",
            vec![
                ColumnDef::new("id", DataType::Integer),
                ColumnDef::new("event_type", DataType::Varchar),
            ],
            vec!["id".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_primary_key_columns_are_not_null() {
        let schema = events();
        assert!(!schema.column("id").unwrap().nullable);
        assert_eq!(schema.primary_key, vec![ColumnId(1)]);
    }

    #[test]
    fn test_add_column_records_initial_default() {
        let next = events()
            .apply(&SchemaChangeOp::AddColumn {
                column: ColumnDef::new("priority", DataType::Integer).with_default(5),
            })
            .unwrap();
        let col = next.column("priority").unwrap();
        assert_eq!(col.id, ColumnId(3));
        assert_eq!(col.initial_default, Some(Value::Integer(5)));
    }

    #[test]
    fn test_rename_keeps_column_id() {
        let next = events()
            .apply(&SchemaChangeOp::RenameColumn {
                from: "event_type".into(),
                to: "kind".into(),
            })
            .unwrap();
        assert_eq!(next.column("kind").unwrap().id, ColumnId(2));
        assert!(next.column("event_type").is_err());
    }

    #[test]
    fn test_drop_and_readd_gets_fresh_id() {
        let dropped = events()
            .apply(&SchemaChangeOp::DropColumn {
                name: "event_type".into(),
            })
            .unwrap();
        let readded = dropped
            .apply(&SchemaChangeOp::AddColumn {
                column: ColumnDef::new("event_type", DataType::Varchar),
            })
            .unwrap();
        assert_eq!(readded.column("event_type").unwrap().id, ColumnId(3));
    }

    #[test]
    fn test_rejected_changes() {
        let schema = events();
        assert!(matches!(
            schema.apply(&SchemaChangeOp::DropColumn { name: "id".into() }),
            Err(LakeError::Validation(_))
        ));
        assert!(matches!(
            schema.apply(&SchemaChangeOp::AddColumn {
                column: ColumnDef::new("id", DataType::BigInt)
            }),
            Err(LakeError::AlreadyExists(_))
        ));
        assert!(matches!(
            schema.apply(&SchemaChangeOp::AddColumn {
                column: ColumnDef::new("must", DataType::Integer).not_null()
            }),
            Err(LakeError::Validation(_))
        ));
    }
}
