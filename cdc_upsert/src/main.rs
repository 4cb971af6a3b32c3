use std::{error::Error, process::ExitCode};

use cdc_upsert::{
    config::{Config, SinkKind},
    pipeline::{
        data_pipeline::{DataPipeline, PipelineConfig},
        destinations::{
            postgres::PostgresDestination, stdout::StdoutDestination, upsert::UpsertStatement,
            Destination,
        },
        sources::mysql::MysqlSource,
        PipelineError,
    },
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let config = Config::parse();

    match main_impl(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cdc_upsert=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn main_impl(config: Config) -> Result<(), Box<dyn Error>> {
    let schema = config.source_schema()?;
    let mapping = config.column_mapping();
    let fixed_attributes = config.fixed_attributes();
    let pipeline_config = config.pipeline_config();

    let source = MysqlSource::new(config.mysql_config(), schema.clone(), fixed_attributes.clone());

    match config.postgres.sink {
        SinkKind::Postgres => {
            let table_name = config.destination_table()?;
            let upsert = UpsertStatement::new(&table_name, &schema, &mapping, &fixed_attributes)?;
            info!(table = %table_name, "upserting with: {}", upsert.sql());
            let destination =
                PostgresDestination::new(&config.postgres_config()?, table_name, upsert);
            run(source, destination, pipeline_config).await?;
        }
        SinkKind::Stdout => {
            mapping.validate(&schema)?;
            run(source, StdoutDestination, pipeline_config).await?;
        }
    }

    Ok(())
}

async fn run<Dest: Destination>(
    source: MysqlSource,
    destination: Dest,
    config: PipelineConfig,
) -> Result<(), PipelineError> {
    let mut pipeline = DataPipeline::new(source, destination, config);

    let shutdown = pipeline.shutdown_token();
    let signals = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => shutdown.cancel(),
            Err(e) => error!("could not listen for shutdown signals: {e}"),
        }
    });

    let result = pipeline.run().await;
    signals.abort();

    let stats = result?;
    info!(
        batches = stats.batches,
        rows = stats.rows_applied,
        position = pipeline.source().position(),
        "shut down cleanly"
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "signal received");
    Ok(())
}
