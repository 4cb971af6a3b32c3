//! Trigger based change capture.
//!
//! An `AFTER INSERT` and an `AFTER UPDATE` trigger on the captured table append
//! the full new row image, as a JSON object, to a shared audit table. The
//! audit table's auto-increment `sequence_id` is the feed position.

use mysql_async::{prelude::*, Conn};
use tracing::{info, warn};

use crate::{
    pipeline::sources::SourceError,
    table::{ColumnSchema, SourceTableSchema, TableName},
};

pub const CHANGES_TABLE: &str = "cdc_upsert_changes";

const ER_TRG_ALREADY_EXISTS: u16 = 1359;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    Insert,
    Update,
}

impl TriggerEvent {
    fn keyword(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "INSERT",
            TriggerEvent::Update => "UPDATE",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TriggerEvent::Insert => "ai",
            TriggerEvent::Update => "au",
        }
    }
}

/// Backtick-quotes a MySQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Single-quotes a MySQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

pub fn qualified_table(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_identifier(&table.schema),
        quote_identifier(&table.name)
    )
}

pub fn create_changes_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            sequence_id BIGINT AUTO_INCREMENT PRIMARY KEY,
            table_name VARCHAR(255) NOT NULL,
            row_data JSON NOT NULL,
            changed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            INDEX idx_table_sequence (table_name, sequence_id)
        )",
        quote_identifier(CHANGES_TABLE)
    )
}

pub fn trigger_name(table: &TableName, event: TriggerEvent) -> String {
    format!("cdc_upsert_{}_{}", table.name, event.suffix())
}

/// How the triggers render temporal columns into the row image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Declared columns stored as `TIMESTAMP` upstream.
    pub timestamp_columns: Vec<String>,
    /// Zone the feed reads temporal values in. The server's global zone when unset.
    pub time_zone: Option<String>,
}

impl CaptureOptions {
    /// `TIMESTAMP` values are converted from the writer's session zone, which
    /// triggers run in, to the zone the feed reads in.
    fn column_value(&self, column: &ColumnSchema) -> String {
        let value = format!("NEW.{}", quote_identifier(&column.name));
        if self.timestamp_columns.contains(&column.name) {
            let target = self
                .time_zone
                .as_deref()
                .map_or_else(|| "@@global.time_zone".to_string(), quote_literal);
            format!("CAST(CONVERT_TZ({value}, @@session.time_zone, {target}) AS CHAR)")
        } else if column.column_type.needs_text_capture() {
            format!("CAST({value} AS CHAR)")
        } else {
            value
        }
    }
}

/// The statement a trigger runs for every changed row.
pub fn trigger_body(schema: &SourceTableSchema, capture: &CaptureOptions) -> String {
    let row_image = schema
        .column_schemas
        .iter()
        .map(|c| format!("{}, {}", quote_literal(&c.name), capture.column_value(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {changes} (table_name, row_data)
         VALUES ({table_key}, JSON_OBJECT({row_image}))",
        changes = quote_identifier(CHANGES_TABLE),
        table_key = quote_literal(&schema.table_name.to_string()),
    )
}

/// Builds the trigger that records the new row image for `event`.
pub fn trigger_sql(
    schema: &SourceTableSchema,
    event: TriggerEvent,
    capture: &CaptureOptions,
) -> String {
    format!(
        "CREATE TRIGGER {trigger}
         AFTER {keyword} ON {table}
         FOR EACH ROW
         {body}",
        trigger = quote_identifier(&trigger_name(&schema.table_name, event)),
        keyword = event.keyword(),
        table = qualified_table(&schema.table_name),
        body = trigger_body(schema, capture),
    )
}

/// Whether two trigger statements are the same apart from whitespace.
pub fn same_statement(a: &str, b: &str) -> bool {
    a.split_whitespace().eq(b.split_whitespace())
}

async fn existing_trigger_body(
    conn: &mut Conn,
    table: &TableName,
    trigger: &str,
) -> Result<Option<String>, SourceError> {
    let query = "
        SELECT ACTION_STATEMENT
        FROM INFORMATION_SCHEMA.TRIGGERS
        WHERE TRIGGER_SCHEMA = ? AND TRIGGER_NAME = ?";
    Ok(conn.exec_first(query, (&table.schema, trigger)).await?)
}

/// Creates the audit table and the triggers. A trigger that already exists
/// but records a different row image is replaced.
pub async fn install(
    conn: &mut Conn,
    schema: &SourceTableSchema,
    capture: &CaptureOptions,
) -> Result<(), SourceError> {
    let create_table = create_changes_table_sql();
    conn.query_drop(&create_table).await?;

    for event in [TriggerEvent::Insert, TriggerEvent::Update] {
        let name = trigger_name(&schema.table_name, event);
        let create = trigger_sql(schema, event, capture);
        match conn.query_drop(&create).await {
            Ok(()) => info!(table = %schema.table_name, trigger = %name, "created trigger"),
            Err(mysql_async::Error::Server(e)) if e.code == ER_TRG_ALREADY_EXISTS => {
                let wanted = trigger_body(schema, capture);
                let existing = existing_trigger_body(conn, &schema.table_name, &name).await?;
                if existing.is_some_and(|body| same_statement(&body, &wanted)) {
                    info!(table = %schema.table_name, trigger = %name, "trigger already exists");
                    continue;
                }

                warn!(
                    table = %schema.table_name,
                    trigger = %name,
                    "trigger records a different row image, replacing it"
                );
                let drop = format!(
                    "DROP TRIGGER IF EXISTS {}.{}",
                    quote_identifier(&schema.table_name.schema),
                    quote_identifier(&name)
                );
                conn.query_drop(&drop).await?;
                conn.query_drop(&create).await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// The newest audit sequence id recorded for `table`, or 0.
pub async fn latest_sequence_id(conn: &mut Conn, table: &TableName) -> Result<i64, SourceError> {
    let query = format!(
        "SELECT COALESCE(MAX(sequence_id), 0) FROM {} WHERE table_name = ?",
        quote_identifier(CHANGES_TABLE)
    );
    let latest: Option<i64> = conn.exec_first(query, (table.to_string(),)).await?;
    Ok(latest.unwrap_or(0))
}

/// Reads up to `limit` row images recorded after `after`, oldest first.
pub async fn fetch_changes(
    conn: &mut Conn,
    table: &TableName,
    after: i64,
    limit: usize,
) -> Result<Vec<(i64, String)>, SourceError> {
    let query = format!(
        "SELECT sequence_id, row_data
         FROM {}
         WHERE table_name = ? AND sequence_id > ?
         ORDER BY sequence_id
         LIMIT ?",
        quote_identifier(CHANGES_TABLE)
    );
    let rows: Vec<(i64, String)> = conn
        .exec(query, (table.to_string(), after, limit as u64))
        .await?;
    Ok(rows)
}
