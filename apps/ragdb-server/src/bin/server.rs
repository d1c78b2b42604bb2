use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ragdb_core::config::{resolve_with_base, Config, Settings};
use ragdb_core::types::QueryRequest;
use ragdb_pipeline::Pipeline;
use ragdb_server::create_router;
use ragdb_telemetry::{ShipperHandle, Telemetry};

#[derive(Parser)]
#[command(name = "ragdb-server")]
#[command(about = "Continuously indexed retrieval service with Prometheus metrics and event shipping")]
#[command(version)]
struct Cli {
    /// Base configuration file; `config.<env>.toml` next to it and `APP_*` variables are merged on top
    #[arg(short, long, env = "RAGDB_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Address to bind, overrides `server.bind`
        #[arg(long)]
        bind: Option<String>,

        /// Directory of .txt files ingested at startup, overrides `ingest.docs_dir`
        #[arg(long)]
        docs: Option<PathBuf>,
    },
    /// Ingest a directory and run a single query against it
    Query {
        text: String,

        #[arg(short, long)]
        k: Option<usize>,

        #[arg(long)]
        docs: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Config::load_from(&cli.config)
        .and_then(|c| c.settings())
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Serve { bind: None, docs: None }) {
        Commands::Serve { bind, docs } => {
            let dir = docs_dir(&cli.config, &settings, docs);
            serve(settings, bind, dir).await
        }
        Commands::Query { text, k, docs } => {
            let dir = docs_dir(&cli.config, &settings, docs);
            query_once(settings, text, k, dir).await
        }
    }
}

fn build(settings: &Settings) -> anyhow::Result<(Arc<Pipeline>, ShipperHandle)> {
    let (telemetry, shipper) = Telemetry::from_settings(&settings.telemetry)?;
    let pipeline = Pipeline::from_settings(settings, telemetry)?;
    Ok((Arc::new(pipeline), shipper))
}

/// The `--docs` flag wins; a configured `docs_dir` is relative to the config file.
fn docs_dir(config: &Path, settings: &Settings, flag: Option<PathBuf>) -> Option<PathBuf> {
    let base = config.parent().unwrap_or_else(|| Path::new(""));
    flag.or_else(|| settings.ingest.docs_dir.as_deref().map(|d| resolve_with_base(base, d)))
}

async fn bootstrap(pipeline: &Pipeline, dir: Option<&Path>) -> anyhow::Result<()> {
    if let Some(dir) = dir {
        tracing::info!(dir = %dir.display(), "bootstrapping index");
        let receipts = pipeline.ingest.ingest_directory(dir, None).await?;
        let chunks: usize = receipts.iter().map(|r| r.indexed_count).sum();
        tracing::info!(documents = receipts.len(), chunks, version = pipeline.index().current_version(), "bootstrap complete");
    }
    pipeline.health().set_ready(true);
    Ok(())
}

async fn serve(settings: Settings, bind: Option<String>, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let (pipeline, shipper) = build(&settings)?;
    let addr = bind.unwrap_or_else(|| settings.server.bind.clone());

    let bootstrapper = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if let Err(e) = bootstrap(&bootstrapper, dir.as_deref()).await {
            tracing::error!(error = %e, "bootstrap failed; service stays unready");
        }
    });

    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "serving");
    axum::serve(listener, create_router(pipeline))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    if tokio::time::timeout(Duration::from_secs(5), shipper.closed()).await.is_err() {
        tracing::warn!("event shipper did not drain before exit");
    }
    Ok(())
}

async fn query_once(settings: Settings, text: String, k: Option<usize>, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let (pipeline, shipper) = build(&settings)?;
    bootstrap(&pipeline, dir.as_deref()).await?;

    let k = k.unwrap_or(settings.query.default_k);
    let response = pipeline.query.query(QueryRequest::new(text, k)).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    drop(pipeline);
    shipper.closed().await;
    Ok(())
}
