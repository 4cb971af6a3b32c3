use std::{fmt::Display, sync::Arc};

use serde::Serialize;
use thiserror::Error;

use crate::table::FixedAttributes;

use super::cell::Cell;

#[derive(Debug, Error, PartialEq)]
pub enum ChangeRecordError {
    #[error("key column {0:?} missing from row")]
    MissingKey(String),

    #[error("key column {0:?} is null")]
    NullKey(String),
}

/// The natural key of a row; one cell per declared key column, never null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RowKey(Vec<Cell>);

impl RowKey {
    pub fn new(cells: Vec<Cell>) -> RowKey {
        RowKey(cells)
    }

    pub fn cells(&self) -> &[Cell] {
        &self.0
    }
}

impl Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, cell) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{cell}")?;
        }
        Ok(())
    }
}

fn no_fixed_attributes(fixed: &Arc<FixedAttributes>) -> bool {
    fixed.is_empty()
}

/// The captured state of one upstream row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    key: RowKey,
    fields: Vec<(String, Cell)>,
    #[serde(skip_serializing_if = "no_fixed_attributes")]
    fixed_attributes: Arc<FixedAttributes>,
}

impl ChangeRecord {
    /// Builds a record from the row's columns, pulling the key out of `key_columns`.
    pub fn from_fields(
        fields: Vec<(String, Cell)>,
        key_columns: &[String],
        fixed_attributes: Arc<FixedAttributes>,
    ) -> Result<ChangeRecord, ChangeRecordError> {
        let mut key = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            let cell = fields
                .iter()
                .find(|(name, _)| name == column)
                .map(|(_, cell)| cell)
                .ok_or_else(|| ChangeRecordError::MissingKey(column.clone()))?;
            if cell.is_null() {
                return Err(ChangeRecordError::NullKey(column.clone()));
            }
            key.push(cell.clone());
        }

        Ok(ChangeRecord {
            key: RowKey(key),
            fields,
            fixed_attributes,
        })
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    pub fn fields(&self) -> &[(String, Cell)] {
        &self.fields
    }

    /// Value of a column by its case-sensitive name.
    pub fn field(&self, name: &str) -> Option<&Cell> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cell)| cell)
    }

    pub fn fixed_attributes(&self) -> &FixedAttributes {
        &self.fixed_attributes
    }
}
