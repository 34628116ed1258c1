use kafmirror::{
    config::{AppConfig, load_properties},
    connector::KafkaMirrorConnector,
    datastream::Datastream,
    diagnostics,
    supervisor::TaskSupervisor,
    trace,
};

use anyhow::Context;
use clap::Parser;
use config::{ConfigError, Map, Source, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::net::TcpListener;

/// A datastream runtime that continuously mirrors records from streaming sources to
/// destinations.
#[derive(Clone, Debug, Default, Parser)]
#[command()]
struct Cli {
    /// Path to a config file with task and supervisor settings.
    #[arg(short, long)]
    config: Option<String>,
    /// Path to the JSON file containing the datastream definitions to run.
    #[arg(short, long)]
    datastreams: Option<String>,
    /// Name of the connector the tasks are registered under.
    #[arg(long)]
    connector: Option<String>,
    /// Address the read-only diagnostics endpoints listen on.
    #[arg(long)]
    diagnostics_addr: Option<String>,
    /// Path to a properties file containing additional configuration for the source consumers.
    /// Typically configuration for authentication, etc.
    #[arg(long)]
    consumer_properties: Option<String>,
    /// Path to a properties file containing additional configuration for the destination
    /// producers.
    #[arg(long)]
    producer_properties: Option<String>,
}

impl Source for Cli {
    /// Clones the [`Source`] and lifts it into a [`Box`].
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }
    /// Collect all configuration properties available from this source into a [`Map`].
    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        if let Some(datastreams) = self.datastreams.as_ref() {
            cfg.insert(String::from("datastreams"), Value::from(datastreams.clone()));
        }

        if let Some(connector) = self.connector.as_ref() {
            cfg.insert(String::from("connector"), Value::from(connector.clone()));
        }

        if let Some(diagnostics_addr) = self.diagnostics_addr.as_ref() {
            cfg.insert(
                String::from("diagnosticsAddr"),
                Value::from(diagnostics_addr.clone()),
            );
        }

        if let Some(consumer_properties) = self.consumer_properties.as_ref() {
            cfg.insert(
                String::from("consumerProperties"),
                Value::from(consumer_properties.clone()),
            );
        }

        if let Some(producer_properties) = self.producer_properties.as_ref() {
            cfg.insert(
                String::from("producerProperties"),
                Value::from(producer_properties.clone()),
            );
        }

        Ok(cfg)
    }
}

/// Main entry point for the application.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = trace::init_env();

    let args = Cli::parse();
    let config_file = args.config.clone();

    let config =
        AppConfig::new(config_file.as_deref(), args).context("create application config")?;

    run_app(config).await
}

/// Runs the application: starts a task for every configured datastream, serves the diagnostics
/// endpoints, and winds everything down on ctrl-c.
async fn run_app(config: AppConfig) -> anyhow::Result<()> {
    let datastreams = load_datastreams(&config.datastreams)?;

    let consumer_properties = match config.consumer_properties.as_ref() {
        Some(path) => load_properties(path)?,
        None => HashMap::new(),
    };

    let producer_properties = match config.producer_properties.as_ref() {
        Some(path) => load_properties(path)?,
        None => HashMap::new(),
    };

    let connector = Arc::new(KafkaMirrorConnector::new(
        config.connector.clone(),
        consumer_properties,
        producer_properties,
        config.task.max_poll_records,
    ));

    let supervisor = Arc::new(TaskSupervisor::new(
        connector,
        config.task.clone(),
        config.supervisor.clone(),
    ));

    supervisor.on_assignment_change(datastreams);
    supervisor.start_daemon();

    let router = diagnostics::router(Arc::clone(&supervisor));

    let listener = TcpListener::bind(&config.diagnostics_addr)
        .await
        .with_context(|| format!("bind diagnostics address {}", config.diagnostics_addr))?;

    tracing::info!("diagnostics listening on {}", config.diagnostics_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve diagnostics endpoints")?;

    tracing::info!("shutdown requested, stopping tasks");

    supervisor.stop_all();

    Ok(())
}

/// Resolves once the process receives ctrl-c.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
}

/// Loads the datastream definitions from the given JSON file.
fn load_datastreams(path: &str) -> anyhow::Result<Vec<Datastream>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read datastreams file {}", path))?;

    serde_json::from_str(&raw).with_context(|| format!("deserialize datastreams file {}", path))
}
