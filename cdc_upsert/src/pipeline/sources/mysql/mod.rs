//! MySQL change feed built on audit-table triggers, with an optional initial
//! snapshot of the table.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use mysql_async::{prelude::*, Conn, Opts, OptsBuilder, Pool, Row, Value};
use tracing::{debug, info, warn};

use crate::{
    conversions::{
        cell::{Cell, JsonValue},
        change_record::{ChangeRecord, RowKey},
    },
    table::{FixedAttributes, SourceTableSchema},
};

use super::{Source, SourceError};

pub mod change_tracking;
pub mod schema;

use change_tracking::{qualified_table, quote_identifier, quote_literal, CaptureOptions};

/// Where the feed starts when it is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StartupMode {
    /// Copy the current table contents, then follow changes.
    Snapshot,
    /// Only follow changes made after the feed was opened.
    LatestOffset,
}

#[derive(Debug, Clone)]
pub struct MysqlSourceConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub server_time_zone: Option<String>,
    pub startup_mode: StartupMode,
    pub poll_interval: Duration,
    pub fetch_size: usize,
}

pub struct MysqlSource {
    config: MysqlSourceConfig,
    schema: SourceTableSchema,
    fixed_attributes: Arc<FixedAttributes>,
    pool: Option<Pool>,
    // (audit sequence id, record); snapshot rows carry no sequence id
    buffer: VecDeque<(Option<i64>, ChangeRecord)>,
    // keyset cursor of a running snapshot; `Some(None)` before the first page
    snapshot: Option<Option<RowKey>>,
    snapshot_rows: u64,
    position: i64,
}

impl MysqlSource {
    /// `schema.table_name.schema` is the upstream database.
    pub fn new(
        config: MysqlSourceConfig,
        schema: SourceTableSchema,
        fixed_attributes: Arc<FixedAttributes>,
    ) -> MysqlSource {
        MysqlSource {
            config,
            schema,
            fixed_attributes,
            pool: None,
            buffer: VecDeque::new(),
            snapshot: None,
            snapshot_rows: 0,
            position: 0,
        }
    }

    /// The audit sequence id of the last change handed out by [`Source::next`].
    pub fn position(&self) -> i64 {
        self.position
    }

    fn opts(&self) -> Opts {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()))
            .pass(self.config.password.clone())
            .db_name(Some(self.schema.table_name.schema.clone()));
        if let Some(time_zone) = &self.config.server_time_zone {
            builder = builder.init(vec![format!(
                "SET time_zone = {}",
                quote_literal(time_zone)
            )]);
        }
        Opts::from(builder)
    }

    async fn prepare(&mut self, conn: &mut Conn) -> Result<(), SourceError> {
        let timestamp_columns = schema::validate_declared_schema(conn, &self.schema).await?;
        let capture = CaptureOptions {
            timestamp_columns,
            time_zone: self.config.server_time_zone.clone(),
        };
        change_tracking::install(conn, &self.schema, &capture).await?;

        // Taken before any snapshot read so changes made while the snapshot
        // runs are replayed afterwards.
        self.position = change_tracking::latest_sequence_id(conn, &self.schema.table_name).await?;
        self.snapshot = match self.config.startup_mode {
            StartupMode::Snapshot => Some(None),
            StartupMode::LatestOffset => None,
        };
        self.snapshot_rows = 0;
        Ok(())
    }

    /// Next snapshot page in key order, continuing after the last key read
    /// when `after_key` is set.
    fn snapshot_query(&self, after_key: bool) -> String {
        let columns = self
            .schema
            .column_names()
            .map(quote_identifier)
            .collect::<Vec<_>>()
            .join(", ");
        let keys = self
            .schema
            .key_columns
            .iter()
            .map(|k| quote_identifier(k))
            .collect::<Vec<_>>()
            .join(", ");
        let filter = if after_key {
            let placeholders = vec!["?"; self.schema.key_columns.len()].join(", ");
            format!(" WHERE ({keys}) > ({placeholders})")
        } else {
            String::new()
        };
        format!(
            "SELECT {columns} FROM {}{filter} ORDER BY {keys} LIMIT ?",
            qualified_table(&self.schema.table_name)
        )
    }

    async fn read_snapshot_page(
        &mut self,
        conn: &mut Conn,
        after: Option<RowKey>,
    ) -> Result<(), SourceError> {
        let limit = self.config.fetch_size as u64;
        let query = self.snapshot_query(after.is_some());
        let mut params: Vec<Value> = after
            .iter()
            .flat_map(|key| key.cells().iter().map(Cell::to_mysql))
            .collect();
        params.push(Value::from(limit));

        let rows: Vec<Row> = conn.exec(query, params).await?;
        let fetched = rows.len() as u64;

        let mut last_key = None;
        for row in rows {
            let record = self.record_from_row(row)?;
            last_key = Some(record.key().clone());
            self.buffer.push_back((None, record));
        }
        self.snapshot_rows += fetched;

        match last_key {
            Some(key) if fetched == limit => self.snapshot = Some(Some(key)),
            _ => {
                info!(
                    table = %self.schema.table_name,
                    rows = self.snapshot_rows,
                    "snapshot complete, following changes"
                );
                self.snapshot = None;
            }
        }
        Ok(())
    }

    async fn read_changes(&mut self, conn: &mut Conn) -> Result<bool, SourceError> {
        let changes = change_tracking::fetch_changes(
            conn,
            &self.schema.table_name,
            self.position,
            self.config.fetch_size,
        )
        .await?;

        if changes.is_empty() {
            return Ok(false);
        }

        debug!(changes = changes.len(), "read changes from audit table");
        for (sequence_id, row_image) in changes {
            let record = record_from_row_image(&row_image, &self.schema, &self.fixed_attributes)?;
            self.buffer.push_back((Some(sequence_id), record));
        }
        Ok(true)
    }

    fn record_from_row(&self, mut row: Row) -> Result<ChangeRecord, SourceError> {
        let mut fields = Vec::with_capacity(self.schema.column_schemas.len());
        for (i, column) in self.schema.column_schemas.iter().enumerate() {
            let value: Value = row.take(i).ok_or_else(|| {
                SourceError::RowImage(format!("snapshot row is missing column {:?}", column.name))
            })?;
            fields.push((column.name.clone(), Cell::from_mysql(value, column.column_type)?));
        }
        Ok(ChangeRecord::from_fields(
            fields,
            &self.schema.key_columns,
            self.fixed_attributes.clone(),
        )?)
    }
}

/// Turns the JSON row image written by the audit trigger into a record.
pub fn record_from_row_image(
    row_image: &str,
    schema: &SourceTableSchema,
    fixed_attributes: &Arc<FixedAttributes>,
) -> Result<ChangeRecord, SourceError> {
    let mut object: serde_json::Map<String, JsonValue> = serde_json::from_str(row_image)
        .map_err(|e| SourceError::RowImage(e.to_string()))?;

    let mut fields = Vec::with_capacity(schema.column_schemas.len());
    for column in &schema.column_schemas {
        let value = object.remove(&column.name).ok_or_else(|| {
            SourceError::RowImage(format!("row image is missing column {:?}", column.name))
        })?;
        fields.push((column.name.clone(), Cell::from_json(value, column.column_type)?));
    }

    Ok(ChangeRecord::from_fields(
        fields,
        &schema.key_columns,
        fixed_attributes.clone(),
    )?)
}

#[async_trait]
impl Source for MysqlSource {
    async fn open(&mut self) -> Result<(), SourceError> {
        let pool = Pool::new(self.opts());

        let prepared = match pool.get_conn().await {
            Ok(mut conn) => self.prepare(&mut conn).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = prepared {
            if let Err(disconnect) = pool.disconnect().await {
                warn!("failed to disconnect from upstream: {disconnect}");
            }
            return Err(e);
        }

        info!(
            table = %self.schema.table_name,
            position = self.position,
            mode = ?self.config.startup_mode,
            "opened mysql change feed"
        );
        self.pool = Some(pool);
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<ChangeRecord>, SourceError> {
        loop {
            if let Some((sequence_id, record)) = self.buffer.pop_front() {
                if let Some(sequence_id) = sequence_id {
                    self.position = sequence_id;
                }
                return Ok(Some(record));
            }

            let Some(pool) = self.pool.as_ref() else {
                return Ok(None);
            };
            // Polls only run on an empty buffer, so `position` is the last
            // sequence id handed out. One pooled connection per poll; a
            // cancelled poll just drops it.
            let mut conn = pool.get_conn().await?;

            if let Some(after) = self.snapshot.clone() {
                self.read_snapshot_page(&mut conn, after).await?;
                continue;
            }

            if !self.read_changes(&mut conn).await? {
                drop(conn);
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }

    async fn close(&mut self) {
        self.buffer.clear();
        if let Some(pool) = self.pool.take() {
            if let Err(e) = pool.disconnect().await {
                warn!("failed to disconnect from upstream: {e}");
            }
            info!(position = self.position, "closed mysql change feed");
        }
    }
}
