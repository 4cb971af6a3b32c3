use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::task::JoinHandle;
use tokio_postgres::{types::ToSql, Client, NoTls};
use tracing::{debug, error, warn};

use crate::{
    conversions::change_record::ChangeRecord,
    pipeline::batching::Batch,
    table::TableName,
};

use super::{upsert::UpsertStatement, Destination, DestinationError};

#[derive(Debug, Clone)]
pub struct PostgresDestinationConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub database: String,
}

impl PostgresDestinationConfig {
    fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.username)
            .dbname(&self.database)
            .application_name("cdc_upsert");
        if let Some(password) = &self.password {
            config.password(password);
        }
        config
    }
}

/// Upserts batches into a Postgres table, one transaction per batch.
///
/// A connection is opened for each write and closed when the write returns,
/// so no transaction is ever left idle between flushes.
pub struct PostgresDestination {
    pg_config: tokio_postgres::Config,
    table_name: TableName,
    upsert: UpsertStatement,
}

impl PostgresDestination {
    pub fn new(
        config: &PostgresDestinationConfig,
        table_name: TableName,
        upsert: UpsertStatement,
    ) -> PostgresDestination {
        PostgresDestination::with_pg_config(config.to_pg_config(), table_name, upsert)
    }

    /// Connects with prebuilt settings, e.g. parsed from a connection string.
    pub fn with_pg_config(
        pg_config: tokio_postgres::Config,
        table_name: TableName,
        upsert: UpsertStatement,
    ) -> PostgresDestination {
        PostgresDestination {
            pg_config,
            table_name,
            upsert,
        }
    }

    async fn connect(&self) -> Result<(Client, JoinHandle<()>), DestinationError> {
        let (client, connection) = self
            .pg_config
            .connect(NoTls)
            .await
            .map_err(DestinationError::Connection)?;

        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });

        Ok((client, connection))
    }

    async fn apply(
        &self,
        client: &mut Client,
        rows: &[&ChangeRecord],
    ) -> Result<usize, DestinationError> {
        let transaction = client.transaction().await?;

        let statement = match transaction.prepare(self.upsert.sql()).await {
            Ok(statement) => statement,
            Err(e) => {
                Self::rollback(transaction).await;
                return Err(e.into());
            }
        };

        let params: Vec<Vec<&(dyn ToSql + Sync)>> = rows
            .iter()
            .map(|row| {
                self.upsert
                    .bind(row)
                    .into_iter()
                    .map(|cell| cell as &(dyn ToSql + Sync))
                    .collect()
            })
            .collect();

        // Issued together so the client pipelines them in one round trip.
        let executed = try_join_all(
            params
                .iter()
                .map(|row_params| transaction.execute(&statement, row_params.as_slice())),
        )
        .await;

        if let Err(e) = executed {
            Self::rollback(transaction).await;
            return Err(e.into());
        }

        transaction.commit().await?;
        Ok(rows.len())
    }

    async fn rollback(transaction: tokio_postgres::Transaction<'_>) {
        if let Err(e) = transaction.rollback().await {
            warn!("rollback failed: {e}");
        }
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    async fn write_batch(&self, batch: &Batch) -> Result<usize, DestinationError> {
        let rows = batch.deduplicated();
        if rows.is_empty() {
            return Ok(0);
        }

        let (mut client, connection) = self.connect().await?;
        let applied = self.apply(&mut client, &rows).await;

        drop(client);
        if let Err(e) = connection.await {
            warn!("postgres connection task failed: {e}");
        }

        debug!(
            table = %self.table_name,
            batch = batch.len(),
            ok = applied.is_ok(),
            "finished postgres write"
        );
        applied
    }

    fn name(&self) -> &str {
        "postgres"
    }
}
