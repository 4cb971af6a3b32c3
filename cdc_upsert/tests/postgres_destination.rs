//! Writes against a live Postgres. Runs when `PG_TEST_URL` is set, e.g.
//! `PG_TEST_URL="host=localhost user=postgres password=postgres dbname=postgres"`.

use std::sync::Arc;

use cdc_upsert::{
    conversions::{cell::Cell, change_record::ChangeRecord},
    pipeline::{
        batching::Batch,
        destinations::{
            postgres::PostgresDestination, upsert::UpsertStatement, Destination, DestinationError,
        },
    },
    table::{
        ColumnMapping, ColumnSchema, ColumnType, FixedAttributes, SourceTableSchema, TableName,
    },
};
use rust_decimal::Decimal;
use tokio_postgres::{Client, NoTls};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn pg_test_config() -> Option<tokio_postgres::Config> {
    let url = std::env::var("PG_TEST_URL").ok()?;
    match url.parse() {
        Ok(config) => Some(config),
        Err(e) => panic!("PG_TEST_URL is not a connection string: {e}"),
    }
}

async fn connect(config: &tokio_postgres::Config) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

fn fixed() -> Arc<FixedAttributes> {
    Arc::new(FixedAttributes::new(vec![("dbId".to_string(), Cell::I64(3))]))
}

fn schema() -> SourceTableSchema {
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

fn demo(id: i64, acr: &str, cents: Option<i64>) -> ChangeRecord {
    ChangeRecord::from_fields(
        vec![
            ("transactionID".to_string(), Cell::I64(id)),
            ("ACR".to_string(), Cell::String(acr.to_string())),
            (
                "amount".to_string(),
                cents.map_or(Cell::Null, |c| Cell::Decimal(Decimal::new(c, 2))),
            ),
        ],
        &["transactionID".to_string()],
        fixed(),
    )
    .unwrap()
}

/// Recreates `public.<table>` and returns a destination writing to it.
async fn prepare_table(
    config: &tokio_postgres::Config,
    client: &Client,
    table: &str,
    amount_constraint: &str,
) -> Result<PostgresDestination, Box<dyn std::error::Error>> {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS public.{table};
             CREATE TABLE public.{table} (
                 \"dbId\" INT NOT NULL,
                 \"transactionID\" INT PRIMARY KEY,
                 \"ACR\" TEXT,
                 amount NUMERIC(12, 2) {amount_constraint}
             );"
        ))
        .await?;

    let table_name = TableName::new("public", table);
    let upsert = UpsertStatement::new(
        &table_name,
        &schema(),
        &ColumnMapping::default(),
        &fixed(),
    )?;
    Ok(PostgresDestination::with_pg_config(
        config.clone(),
        table_name,
        upsert,
    ))
}

async fn table_rows(
    client: &Client,
    table: &str,
) -> Result<Vec<(i32, i32, Option<String>, Option<String>)>, tokio_postgres::Error> {
    let rows = client
        .query(
            &format!(
                "SELECT \"dbId\", \"transactionID\", \"ACR\", amount::text
                 FROM public.{table} ORDER BY \"transactionID\""
            ),
            &[],
        )
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get(0), row.get(1), row.get(2), row.get(3)))
        .collect())
}

#[tokio::test]
async fn writing_a_batch_twice_leaves_the_same_table() -> TestResult {
    let Some(config) = pg_test_config() else {
        eprintln!("PG_TEST_URL not set, skipping");
        return Ok(());
    };
    let client = connect(&config).await?;
    let destination = prepare_table(&config, &client, "cdc_upsert_idempotent", "").await?;

    let batch = Batch::new(vec![
        demo(1, "A", Some(1000)),
        demo(2, "B", Some(2000)),
        demo(1, "A", Some(1500)),
    ]);

    assert_eq!(destination.write_batch(&batch).await?, 2);
    let first = table_rows(&client, "cdc_upsert_idempotent").await?;
    assert_eq!(
        first,
        vec![
            (3, 1, Some("A".to_string()), Some("15.00".to_string())),
            (3, 2, Some("B".to_string()), Some("20.00".to_string())),
        ]
    );

    assert_eq!(destination.write_batch(&batch).await?, 2);
    assert_eq!(table_rows(&client, "cdc_upsert_idempotent").await?, first);
    Ok(())
}

#[tokio::test]
async fn rejected_row_rolls_back_the_whole_batch() -> TestResult {
    let Some(config) = pg_test_config() else {
        eprintln!("PG_TEST_URL not set, skipping");
        return Ok(());
    };
    let client = connect(&config).await?;
    let destination = prepare_table(&config, &client, "cdc_upsert_atomic", "NOT NULL").await?;

    destination
        .write_batch(&Batch::new(vec![demo(1, "A", Some(500))]))
        .await?;

    let batch = Batch::new(vec![
        demo(1, "A", Some(900)),
        demo(2, "B", None),
        demo(3, "C", Some(300)),
    ]);
    let err = destination.write_batch(&batch).await.unwrap_err();
    assert!(matches!(err, DestinationError::Write(_)), "got {err:?}");

    assert_eq!(
        table_rows(&client, "cdc_upsert_atomic").await?,
        vec![(3, 1, Some("A".to_string()), Some("5.00".to_string()))]
    );
    Ok(())
}
