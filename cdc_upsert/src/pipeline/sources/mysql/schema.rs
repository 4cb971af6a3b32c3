use mysql_async::{prelude::*, Conn};
use tracing::debug;

use crate::{pipeline::sources::SourceError, table::SourceTableSchema};

/// Checks the declared columns against `INFORMATION_SCHEMA.COLUMNS` and
/// returns the declared columns stored as `TIMESTAMP` upstream.
pub async fn validate_declared_schema(
    conn: &mut Conn,
    schema: &SourceTableSchema,
) -> Result<Vec<String>, SourceError> {
    let columns_query = "
        SELECT COLUMN_NAME, DATA_TYPE
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION";

    let actual: Vec<(String, String)> = conn
        .exec(
            columns_query,
            (&schema.table_name.schema, &schema.table_name.name),
        )
        .await?;

    debug!(table = %schema.table_name, columns = actual.len(), "read upstream columns");

    check_columns(schema, &actual)
}

/// Every declared column has to exist upstream under the exact same name and
/// with a type it can be read as. Extra upstream columns are ignored.
///
/// Returns the declared columns whose upstream type is `TIMESTAMP`, in
/// declaration order.
pub fn check_columns(
    schema: &SourceTableSchema,
    actual: &[(String, String)],
) -> Result<Vec<String>, SourceError> {
    if actual.is_empty() {
        return Err(SourceError::Schema(format!(
            "table {} does not exist or has no columns",
            schema.table_name
        )));
    }

    let mut timestamp_columns = Vec::new();
    for declared in &schema.column_schemas {
        let (_, data_type) = actual
            .iter()
            .find(|(name, _)| name == &declared.name)
            .ok_or_else(|| {
                SourceError::Schema(format!(
                    "column {:?} not found in {}",
                    declared.name, schema.table_name
                ))
            })?;

        if !declared.column_type.accepts_mysql_type(data_type) {
            return Err(SourceError::Schema(format!(
                "column {:?} is {data_type} upstream, declared as {:?}",
                declared.name, declared.column_type
            )));
        }
        if data_type.eq_ignore_ascii_case("timestamp") {
            timestamp_columns.push(declared.name.clone());
        }
    }

    Ok(timestamp_columns)
}
