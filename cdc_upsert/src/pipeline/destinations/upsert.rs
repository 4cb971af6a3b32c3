use postgres_protocol::escape::escape_identifier;

use crate::{
    conversions::{cell::Cell, change_record::ChangeRecord},
    table::{ColumnMapping, FixedAttributes, SourceTableSchema, TableError, TableName},
};

static NULL: Cell = Cell::Null;

#[derive(Debug, Clone, PartialEq)]
enum ColumnValue {
    Fixed(String),
    Field(String),
}

/// `INSERT ... ON CONFLICT (key) DO UPDATE` for one destination table.
///
/// Destination columns are the fixed attributes followed by the declared
/// source columns under their mapped names. All identifiers are quoted, so
/// mixed-case names such as `"transactionID"` survive.
#[derive(Debug, Clone)]
pub struct UpsertStatement {
    sql: String,
    columns: Vec<String>,
    values: Vec<ColumnValue>,
}

impl UpsertStatement {
    pub fn new(
        table_name: &TableName,
        schema: &SourceTableSchema,
        mapping: &ColumnMapping,
        fixed_attributes: &FixedAttributes,
    ) -> Result<UpsertStatement, TableError> {
        mapping.validate(schema)?;

        let mut columns: Vec<String> = Vec::new();
        let mut values = Vec::new();
        let mut push = |column: &str, value: ColumnValue| {
            if columns.iter().any(|c| c == column) {
                return Err(TableError::DuplicateDestinationColumn(column.to_string()));
            }
            columns.push(column.to_string());
            values.push(value);
            Ok(())
        };

        for name in fixed_attributes.names() {
            push(name, ColumnValue::Fixed(name.to_string()))?;
        }
        for name in schema.column_names() {
            push(
                mapping.destination_name(name),
                ColumnValue::Field(name.to_string()),
            )?;
        }

        let key_columns: Vec<&str> = schema
            .key_columns
            .iter()
            .map(|k| mapping.destination_name(k))
            .collect();

        let sql = Self::build_sql(table_name, &columns, &key_columns);

        Ok(UpsertStatement {
            sql,
            columns,
            values,
        })
    }

    fn build_sql(table_name: &TableName, columns: &[String], key_columns: &[&str]) -> String {
        let quoted_columns = columns
            .iter()
            .map(|c| escape_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let conflict_target = key_columns
            .iter()
            .map(|k| escape_identifier(k))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = columns
            .iter()
            .filter(|c| !key_columns.contains(&c.as_str()))
            .map(|c| {
                let quoted = escape_identifier(c);
                format!("{quoted} = EXCLUDED.{quoted}")
            })
            .collect::<Vec<_>>();

        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };

        format!(
            "INSERT INTO {}.{} ({quoted_columns}) VALUES ({placeholders}) ON CONFLICT ({conflict_target}) {action}",
            escape_identifier(&table_name.schema),
            escape_identifier(&table_name.name),
        )
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Destination column names in parameter order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The parameter values for `record`, in column order. Absent values bind as null.
    pub fn bind<'a>(&'a self, record: &'a ChangeRecord) -> Vec<&'a Cell> {
        self.values
            .iter()
            .map(|value| {
                let cell = match value {
                    ColumnValue::Fixed(name) => record.fixed_attributes().get(name),
                    ColumnValue::Field(name) => record.field(name),
                };
                cell.unwrap_or(&NULL)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use crate::table::{ColumnSchema, ColumnType};

    use super::*;

    fn demo_schema() -> SourceTableSchema {
        SourceTableSchema::new(
            TableName::new("shop", "demo"),
            vec![
                ColumnSchema::new("transactionID", ColumnType::Int),
                ColumnSchema::new("ACR", ColumnType::Text),
                ColumnSchema::new("amount", ColumnType::Decimal),
            ],
            vec!["transactionID".to_string()],
        )
        .unwrap()
    }

    fn db_id() -> FixedAttributes {
        FixedAttributes::new(vec![("dbId".to_string(), Cell::I64(3))])
    }

    #[test]
    fn builds_quoted_upsert() {
        let statement = UpsertStatement::new(
            &TableName::new("dev_practice_db", "demo"),
            &demo_schema(),
            &ColumnMapping::default(),
            &db_id(),
        )
        .unwrap();

        assert_eq!(
            statement.sql(),
            "INSERT INTO \"dev_practice_db\".\"demo\" (\"dbId\", \"transactionID\", \"ACR\", \"amount\") \
             VALUES ($1, $2, $3, $4) ON CONFLICT (\"transactionID\") \
             DO UPDATE SET \"dbId\" = EXCLUDED.\"dbId\", \"ACR\" = EXCLUDED.\"ACR\", \"amount\" = EXCLUDED.\"amount\""
        );
    }

    #[test]
    fn renames_columns_and_key() {
        let mapping = ColumnMapping::new(vec![
            ("transactionID".to_string(), "transaction_id".to_string()),
            ("ACR".to_string(), "acr".to_string()),
        ]);
        let statement = UpsertStatement::new(
            &TableName::new("public", "demo"),
            &demo_schema(),
            &mapping,
            &FixedAttributes::default(),
        )
        .unwrap();

        assert_eq!(statement.columns(), &["transaction_id", "acr", "amount"]);
        assert!(statement
            .sql()
            .contains("ON CONFLICT (\"transaction_id\")"));
        assert!(!statement
            .sql()
            .contains("\"transaction_id\" = EXCLUDED"));
    }

    #[test]
    fn escapes_embedded_quotes() {
        let schema = SourceTableSchema::new(
            TableName::new("shop", "demo"),
            vec![ColumnSchema::new("we\"ird", ColumnType::Int)],
            vec!["we\"ird".to_string()],
        )
        .unwrap();
        let statement = UpsertStatement::new(
            &TableName::new("public", "demo"),
            &schema,
            &ColumnMapping::default(),
            &FixedAttributes::default(),
        )
        .unwrap();

        assert!(statement.sql().contains("(\"we\"\"ird\")"));
        // only key columns, nothing to update
        assert!(statement.sql().ends_with("DO NOTHING"));
    }

    #[test]
    fn fixed_attribute_cannot_shadow_a_column() {
        let fixed = FixedAttributes::new(vec![("amount".to_string(), Cell::I64(0))]);
        let err = UpsertStatement::new(
            &TableName::new("public", "demo"),
            &demo_schema(),
            &ColumnMapping::default(),
            &fixed,
        )
        .unwrap_err();
        assert_eq!(
            err,
            TableError::DuplicateDestinationColumn("amount".to_string())
        );
    }

    #[test]
    fn binds_in_column_order() {
        let statement = UpsertStatement::new(
            &TableName::new("public", "demo"),
            &demo_schema(),
            &ColumnMapping::default(),
            &db_id(),
        )
        .unwrap();
        let record = ChangeRecord::from_fields(
            vec![
                ("transactionID".to_string(), Cell::I64(1)),
                ("ACR".to_string(), Cell::String("A".to_string())),
                ("amount".to_string(), Cell::Decimal(Decimal::new(1500, 2))),
            ],
            &["transactionID".to_string()],
            Arc::new(db_id()),
        )
        .unwrap();

        assert_eq!(
            statement.bind(&record),
            vec![
                &Cell::I64(3),
                &Cell::I64(1),
                &Cell::String("A".to_string()),
                &Cell::Decimal(Decimal::new(1500, 2)),
            ]
        );
    }

    #[test]
    fn absent_values_bind_as_null() {
        let statement = UpsertStatement::new(
            &TableName::new("public", "demo"),
            &demo_schema(),
            &ColumnMapping::default(),
            &db_id(),
        )
        .unwrap();
        let record = ChangeRecord::from_fields(
            vec![("transactionID".to_string(), Cell::I64(1))],
            &["transactionID".to_string()],
            Arc::default(),
        )
        .unwrap();

        assert_eq!(
            statement.bind(&record),
            vec![&Cell::Null, &Cell::I64(1), &Cell::Null, &Cell::Null]
        );
    }
}
