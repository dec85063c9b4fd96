//! Table and value schema for the document store

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Scalar stored in a cell or top-level value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl CellValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn kind(&self) -> ColumnType {
        match self {
            CellValue::Bool(_) => ColumnType::Boolean,
            CellValue::Number(_) => ColumnType::Number,
            CellValue::String(_) => ColumnType::String,
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::String(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::String(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

impl From<bool> for CellValue {
    fn from(b: bool) -> Self {
        CellValue::Bool(b)
    }
}

/// A row as seen by readers: column name to scalar.
pub type Row = BTreeMap<String, CellValue>;

/// Declared type of a column or value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "string"),
            ColumnType::Number => write!(f, "number"),
            ColumnType::Boolean => write!(f, "boolean"),
        }
    }
}

/// A column definition within a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
    pub default: CellValue,
    /// Inclusive bounds for number columns; values outside are clamped
    pub range: Option<(f64, f64)>,
}

impl ColumnDef {
    fn string(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: ColumnType::String,
            default: CellValue::String(String::new()),
            range: None,
        }
    }

    fn number(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: ColumnType::Number,
            default: CellValue::Number(0.0),
            range: None,
        }
    }

    fn boolean(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: ColumnType::Boolean,
            default: CellValue::Bool(false),
            range: None,
        }
    }

    fn with_default(mut self, default: impl Into<CellValue>) -> Self {
        self.default = default.into();
        self
    }

    fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    /// Type-check a value for this column, clamping numbers into range.
    pub fn check(&self, field: &str, value: &CellValue) -> Result<CellValue, StoreError> {
        if value.kind() != self.kind {
            return Err(StoreError::TypeMismatch {
                field: field.to_string(),
                expected: self.kind.to_string(),
            });
        }
        match (value, self.range) {
            (CellValue::Number(n), _) if !n.is_finite() => Err(StoreError::TypeMismatch {
                field: field.to_string(),
                expected: "finite number".into(),
            }),
            (CellValue::Number(n), Some((min, max))) => Ok(CellValue::Number(n.clamp(min, max))),
            _ => Ok(value.clone()),
        }
    }
}

/// Schema of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// A row holding every column's default
    pub fn default_row(&self) -> Row {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.default.clone()))
            .collect()
    }

    /// Check a single cell against this table
    pub fn check_cell(&self, column: &str, value: &CellValue) -> Result<CellValue, StoreError> {
        let def = self.column(column).ok_or_else(|| StoreError::UnknownColumn {
            table: self.name.clone(),
            column: column.to_string(),
        })?;
        def.check(&format!("{}.{}", self.name, column), value)
    }
}

/// Schema of one top-level value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueDef {
    pub name: String,
    pub kind: ColumnType,
    pub default: CellValue,
    /// Device-local: never sent by a client, never accepted by a server
    pub client_only: bool,
}

/// Fixed schema shared by every replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    tables: BTreeMap<String, TableDef>,
    values: BTreeMap<String, ValueDef>,
}

/// Table names of the todo schema
pub mod tables {
    pub const LISTS: &str = "lists";
    pub const TASKS: &str = "tasks";
    pub const CEMETERY: &str = "cemetery";
}

/// Value names of the todo schema
pub mod values {
    pub const LAST_SYNC: &str = "lastSync";
    pub const DEVICE_ID: &str = "deviceId";
    pub const USER_ID: &str = "userId";
    pub const PASSPHRASE: &str = "passphrase";
}

impl Schema {
    pub fn new(tables: Vec<TableDef>, values: Vec<ValueDef>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            values: values.into_iter().map(|v| (v.name.clone(), v)).collect(),
        }
    }

    /// The lists / tasks / cemetery schema of the todo application
    pub fn todo() -> Self {
        let lists = TableDef {
            name: tables::LISTS.into(),
            columns: vec![
                ColumnDef::string("id"),
                ColumnDef::string("title"),
                ColumnDef::string("emoji").with_default("📝"),
                ColumnDef::string("color").with_default("#3b82f6"),
                ColumnDef::number("createdAt"),
            ],
        };
        let tasks = TableDef {
            name: tables::TASKS.into(),
            columns: vec![
                ColumnDef::string("id"),
                ColumnDef::string("listId"),
                ColumnDef::string("title"),
                ColumnDef::string("description"),
                ColumnDef::number("progress").with_range(0.0, 100.0),
                ColumnDef::boolean("completed"),
                ColumnDef::number("createdAt"),
                ColumnDef::number("updatedAt"),
            ],
        };
        let cemetery = TableDef {
            name: tables::CEMETERY.into(),
            columns: vec![
                ColumnDef::string("id"),
                ColumnDef::string("originalTitle"),
                ColumnDef::string("originalDescription"),
                ColumnDef::number("originalProgress").with_range(0.0, 100.0),
                ColumnDef::number("deletedAt"),
                ColumnDef::string("deletionReason"),
            ],
        };

        let value = |name: &str, kind: ColumnType, default: CellValue, client_only: bool| ValueDef {
            name: name.into(),
            kind,
            default,
            client_only,
        };

        Self::new(
            vec![lists, tasks, cemetery],
            vec![
                value(values::LAST_SYNC, ColumnType::Number, CellValue::Number(0.0), false),
                value(values::DEVICE_ID, ColumnType::String, CellValue::String(String::new()), true),
                value(values::USER_ID, ColumnType::String, CellValue::String(String::new()), false),
                value(values::PASSPHRASE, ColumnType::String, CellValue::String(String::new()), true),
            ],
        )
    }

    pub fn table(&self, name: &str) -> Result<&TableDef, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn value(&self, name: &str) -> Result<&ValueDef, StoreError> {
        self.values
            .get(name)
            .ok_or_else(|| StoreError::UnknownValue(name.to_string()))
    }

    /// Check a top-level value against its definition
    pub fn check_value(&self, name: &str, value: &CellValue) -> Result<CellValue, StoreError> {
        let def = self.value(name)?;
        if value.kind() != def.kind {
            return Err(StoreError::TypeMismatch {
                field: name.to_string(),
                expected: def.kind.to_string(),
            });
        }
        Ok(value.clone())
    }
}
