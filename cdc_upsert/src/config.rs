use std::{sync::Arc, time::Duration};

use clap::{Args, Parser, ValueEnum};
use thiserror::Error;

use crate::{
    conversions::cell::Cell,
    pipeline::{
        batching::BatchConfig,
        data_pipeline::{PipelineConfig, RetryConfig},
        destinations::postgres::PostgresDestinationConfig,
        sources::mysql::{MysqlSourceConfig, StartupMode},
    },
    table::{ColumnMapping, ColumnSchema, FixedAttributes, SourceTableSchema, TableError, TableName},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("table error: {0}")]
    TableError(#[from] TableError),

    #[error("expected name=value, got {0:?}")]
    InvalidPair(String),

    #[error("{0} is required for the postgres sink")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Upsert into a Postgres table
    Postgres,
    /// Log every row instead of writing it
    Stdout,
}

#[derive(Debug, Parser)]
#[command(name = "cdc_upsert", version, about)]
pub struct Config {
    #[clap(flatten)]
    pub mysql: MysqlArgs,

    #[clap(flatten)]
    pub table: TableArgs,

    #[clap(flatten)]
    pub postgres: PostgresArgs,

    #[clap(flatten)]
    pub pipeline: PipelineArgs,
}

#[derive(Debug, Args)]
pub struct MysqlArgs {
    /// Host on which MySQL is running
    #[arg(long, env = "MYSQL_HOST", default_value = "localhost")]
    pub mysql_host: String,

    /// Port on which MySQL is running
    #[arg(long, env = "MYSQL_PORT", default_value_t = 3306)]
    pub mysql_port: u16,

    /// MySQL user name
    #[arg(long, env = "MYSQL_USER")]
    pub mysql_user: String,

    /// MySQL user password
    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    pub mysql_password: Option<String>,

    /// Database holding the captured table
    #[arg(long, env = "MYSQL_DATABASE")]
    pub mysql_database: String,

    /// Captured table
    #[arg(long, env = "MYSQL_TABLE")]
    pub mysql_table: String,

    /// Session time zone used to read temporal values, e.g. Asia/Karachi
    #[arg(long, env = "MYSQL_SERVER_TIME_ZONE")]
    pub mysql_server_time_zone: Option<String>,

    /// Where the change feed starts
    #[arg(long, env = "STARTUP_MODE", value_enum, default_value_t = StartupMode::LatestOffset)]
    pub startup_mode: StartupMode,

    /// Idle wait between change polls, in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Rows read per snapshot page or change poll
    #[arg(long, env = "FETCH_SIZE", default_value_t = 1000)]
    pub fetch_size: usize,
}

#[derive(Debug, Args)]
pub struct TableArgs {
    /// Captured columns as name:type, e.g. transactionID:int,amount:decimal
    #[arg(long, env = "SOURCE_COLUMNS", value_delimiter = ',', required = true)]
    pub columns: Vec<ColumnSchema>,

    /// Columns identifying a row
    #[arg(long, env = "KEY_COLUMNS", value_delimiter = ',', required = true)]
    pub key_columns: Vec<String>,

    /// Destination names for source columns as source=destination
    #[arg(long, env = "COLUMN_MAP", value_delimiter = ',', value_parser = parse_pair)]
    pub column_map: Vec<(String, String)>,

    /// Constant columns written with every row as name=value
    #[arg(long, env = "FIXED_ATTRIBUTES", value_delimiter = ',', value_parser = parse_pair)]
    pub fixed_attributes: Vec<(String, String)>,
}

#[derive(Debug, Args)]
pub struct PostgresArgs {
    /// Where rows are written
    #[arg(long, env = "SINK", value_enum, default_value_t = SinkKind::Postgres)]
    pub sink: SinkKind,

    /// Host on which Postgres is running
    #[arg(long, env = "PG_HOST")]
    pub pg_host: Option<String>,

    /// Port on which Postgres is running
    #[arg(long, env = "PG_PORT", default_value_t = 5432)]
    pub pg_port: u16,

    /// Postgres user name
    #[arg(long, env = "PG_USER")]
    pub pg_user: Option<String>,

    /// Postgres user password
    #[arg(long, env = "PG_PASSWORD", hide_env_values = true)]
    pub pg_password: Option<String>,

    /// Postgres database name
    #[arg(long, env = "PG_DATABASE")]
    pub pg_database: Option<String>,

    /// Destination table as schema.table
    #[arg(long, env = "PG_TABLE")]
    pub pg_table: Option<TableName>,
}

#[derive(Debug, Args)]
pub struct PipelineArgs {
    /// Records per destination write
    #[arg(long, env = "BATCH_SIZE", default_value_t = 3)]
    pub batch_size: usize,

    /// Retries of a failed write or lost upstream connection
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    pub max_retries: usize,

    #[arg(long, env = "RETRY_MIN_DELAY_MS", default_value_t = 100)]
    pub retry_min_delay_ms: u64,

    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value_t = 10_000)]
    pub retry_max_delay_ms: u64,
}

fn parse_pair(s: &str) -> Result<(String, String), ConfigError> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidPair(s.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(ConfigError::InvalidPair(s.to_string()));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

impl Config {
    pub fn source_schema(&self) -> Result<SourceTableSchema, ConfigError> {
        Ok(SourceTableSchema::new(
            TableName::new(&self.mysql.mysql_database, &self.mysql.mysql_table),
            self.table.columns.clone(),
            self.table.key_columns.clone(),
        )?)
    }

    pub fn column_mapping(&self) -> ColumnMapping {
        ColumnMapping::new(self.table.column_map.clone())
    }

    pub fn fixed_attributes(&self) -> Arc<FixedAttributes> {
        let values = self
            .table
            .fixed_attributes
            .iter()
            .map(|(name, value)| (name.clone(), Cell::parse_literal(value)))
            .collect();
        Arc::new(FixedAttributes::new(values))
    }

    pub fn mysql_config(&self) -> MysqlSourceConfig {
        let mysql = &self.mysql;
        MysqlSourceConfig {
            host: mysql.mysql_host.clone(),
            port: mysql.mysql_port,
            username: mysql.mysql_user.clone(),
            password: mysql.mysql_password.clone(),
            server_time_zone: mysql.mysql_server_time_zone.clone(),
            startup_mode: mysql.startup_mode,
            poll_interval: Duration::from_millis(mysql.poll_interval_ms),
            fetch_size: mysql.fetch_size.max(1),
        }
    }

    pub fn destination_table(&self) -> Result<TableName, ConfigError> {
        self.postgres
            .pg_table
            .clone()
            .ok_or(ConfigError::Missing("PG_TABLE"))
    }

    pub fn postgres_config(&self) -> Result<PostgresDestinationConfig, ConfigError> {
        let pg = &self.postgres;
        Ok(PostgresDestinationConfig {
            host: pg.pg_host.clone().ok_or(ConfigError::Missing("PG_HOST"))?,
            port: pg.pg_port,
            username: pg.pg_user.clone().ok_or(ConfigError::Missing("PG_USER"))?,
            password: pg.pg_password.clone(),
            database: pg
                .pg_database
                .clone()
                .ok_or(ConfigError::Missing("PG_DATABASE"))?,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let args = &self.pipeline;
        PipelineConfig {
            batch: BatchConfig::new(args.batch_size),
            retry: RetryConfig {
                max_retries: args.max_retries,
                min_delay: Duration::from_millis(args.retry_min_delay_ms),
                max_delay: Duration::from_millis(args.retry_max_delay_ms),
            },
        }
    }
}
