use std::{fmt::Display, str::FromStr};

use thiserror::Error;

use crate::conversions::cell::Cell;

#[derive(Debug, Error, PartialEq)]
pub enum TableError {
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("unknown column type {0:?}")]
    UnknownColumnType(String),

    #[error("key column {0:?} is not a declared column")]
    UndeclaredKeyColumn(String),

    #[error("at least one key column is required")]
    MissingKeyColumns,

    #[error("column {0:?} is declared twice")]
    DuplicateColumn(String),

    #[error("column mapping refers to undeclared column {0:?}")]
    UnmappedColumn(String),

    #[error("destination column {0:?} is written twice")]
    DuplicateDestinationColumn(String),
}

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> TableName {
        TableName {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl FromStr for TableName {
    type Err = TableError;

    /// Parses `schema.table`; a bare `table` lands in `public`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TableError::InvalidTableName(s.to_string());
        match s.split_once('.') {
            Some((schema, name)) => {
                if schema.is_empty() || name.is_empty() || name.contains('.') {
                    return Err(invalid());
                }
                Ok(TableName::new(schema, name))
            }
            None if !s.is_empty() => Ok(TableName::new("public", s)),
            None => Err(invalid()),
        }
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// The declared type of an upstream column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int,
    BigInt,
    Decimal,
    Double,
    Text,
    Date,
    DateTime,
}

impl ColumnType {
    /// Whether a MySQL `INFORMATION_SCHEMA.COLUMNS.DATA_TYPE` can be read as this type.
    pub fn accepts_mysql_type(&self, data_type: &str) -> bool {
        let data_type = data_type.to_ascii_lowercase();
        match self {
            ColumnType::Bool => matches!(data_type.as_str(), "tinyint" | "bit" | "boolean"),
            ColumnType::Int => matches!(
                data_type.as_str(),
                "tinyint" | "smallint" | "mediumint" | "int" | "integer"
            ),
            ColumnType::BigInt => matches!(
                data_type.as_str(),
                "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint"
            ),
            ColumnType::Decimal => matches!(data_type.as_str(), "decimal" | "numeric"),
            ColumnType::Double => matches!(data_type.as_str(), "float" | "double" | "real"),
            ColumnType::Text => matches!(
                data_type.as_str(),
                "char"
                    | "varchar"
                    | "tinytext"
                    | "text"
                    | "mediumtext"
                    | "longtext"
                    | "enum"
                    | "set"
            ),
            ColumnType::Date => data_type == "date",
            ColumnType::DateTime => matches!(data_type.as_str(), "datetime" | "timestamp"),
        }
    }

    /// Whether the audit trigger has to cast the column to text to keep it exact.
    pub fn needs_text_capture(&self) -> bool {
        matches!(
            self,
            ColumnType::Decimal | ColumnType::Date | ColumnType::DateTime
        )
    }
}

impl FromStr for ColumnType {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => ColumnType::Bool,
            "int" | "integer" | "smallint" | "tinyint" => ColumnType::Int,
            "bigint" => ColumnType::BigInt,
            "decimal" | "numeric" => ColumnType::Decimal,
            "double" | "float" => ColumnType::Double,
            "text" | "varchar" | "string" | "char" => ColumnType::Text,
            "date" => ColumnType::Date,
            "datetime" | "timestamp" => ColumnType::DateTime,
            other => return Err(TableError::UnknownColumnType(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            column_type,
        }
    }
}

impl FromStr for ColumnSchema {
    type Err = TableError;

    /// Parses `name:type`. The name keeps its case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, typ) = s
            .rsplit_once(':')
            .ok_or_else(|| TableError::UnknownColumnType(s.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(TableError::UnknownColumnType(s.to_string()));
        }
        Ok(ColumnSchema::new(name, typ.parse()?))
    }
}

/// The declared shape of the upstream table: ordered columns plus key columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTableSchema {
    pub table_name: TableName,
    pub column_schemas: Vec<ColumnSchema>,
    pub key_columns: Vec<String>,
}

impl SourceTableSchema {
    pub fn new(
        table_name: TableName,
        column_schemas: Vec<ColumnSchema>,
        key_columns: Vec<String>,
    ) -> Result<SourceTableSchema, TableError> {
        if key_columns.is_empty() {
            return Err(TableError::MissingKeyColumns);
        }
        for (i, column) in column_schemas.iter().enumerate() {
            if column_schemas[..i].iter().any(|c| c.name == column.name) {
                return Err(TableError::DuplicateColumn(column.name.clone()));
            }
        }
        for key in &key_columns {
            if !column_schemas.iter().any(|c| &c.name == key) {
                return Err(TableError::UndeclaredKeyColumn(key.clone()));
            }
        }
        Ok(SourceTableSchema {
            table_name,
            column_schemas,
            key_columns,
        })
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.column_schemas.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.column_schemas.iter().map(|c| c.name.as_str())
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.key_columns.iter().any(|k| k == name)
    }
}

/// Source column name to destination column name translation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMapping {
    renames: Vec<(String, String)>,
}

impl ColumnMapping {
    pub fn new(renames: Vec<(String, String)>) -> ColumnMapping {
        ColumnMapping { renames }
    }

    /// Checks every rename refers to a declared column.
    pub fn validate(&self, schema: &SourceTableSchema) -> Result<(), TableError> {
        for (source, _) in &self.renames {
            if schema.column(source).is_none() {
                return Err(TableError::UnmappedColumn(source.clone()));
            }
        }
        Ok(())
    }

    pub fn destination_name<'a>(&'a self, source: &'a str) -> &'a str {
        self.renames
            .iter()
            .find(|(s, _)| s == source)
            .map(|(_, d)| d.as_str())
            .unwrap_or(source)
    }
}

/// Constant columns written with every row, e.g. the id of the source database.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct FixedAttributes {
    values: Vec<(String, Cell)>,
}

impl FixedAttributes {
    pub fn new(values: Vec<(String, Cell)>) -> FixedAttributes {
        FixedAttributes { values }
    }

    pub fn get(&self, name: &str) -> Option<&Cell> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
