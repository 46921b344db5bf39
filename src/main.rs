// src/main.rs
// CLI entry point: ingest, query, status, healthcheck.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mnemo::config::Config;
use mnemo::db::{DatabasePool, StateStore};
use mnemo::embeddings::{Embedder, EmbeddingClient};
use mnemo::error::{MnemoError, Result};
use mnemo::llm::generator_from_config;
use mnemo::orchestrator::QueryOrchestrator;
use mnemo::pipeline::{FileIngestDriver, IngestionPipeline};
use mnemo::preprocess::{
    GithubPreprocessor, Preprocessor, TelegramPreprocessor, WhatsappPreprocessor,
};
use mnemo::prompt::PromptBuilder;
use mnemo::sources::{GithubAdapter, SourceAdapter, TelegramAdapter, WhatsappAdapter};
use mnemo::store::VectorStore;

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Conversational memory engine")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, env = "MNEMO_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run ingestion for one ingestor, or all registered ones
    Ingest {
        /// Ingestor id (e.g. telegram_ingestor); omit to run all
        #[arg(long)]
        ingestor: Option<String>,
    },
    /// Watch a directory of exported batch files and ingest them on a tick
    WatchFiles,
    /// Ask a question over the ingested history
    Query {
        /// Source tag for validation
        #[arg(long, default_value = "cli")]
        source: String,
        /// User id for per-user validation rules
        #[arg(long, default_value = "default")]
        user: String,
        /// The question
        question: Vec<String>,
    },
    /// Show per-ingestor state
    Status,
    /// Check component health
    Healthcheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    tokio::select! {
        result = run(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            ExitCode::from(130)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    // State and vectors live in separate database files: per-ingestor
    // progress at state_manager.db_path, the dense store under the vector
    // store's persist directory (beside the keyword snapshots).
    let state_pool = Arc::new(
        DatabasePool::open(
            &config.state_manager.db_path,
            config.vector_store.embedding_dim,
        )
        .await
        .map_err(MnemoError::Anyhow)?,
    );
    let vector_pool = Arc::new(
        DatabasePool::open(
            &config.vector_store.persist_directory.join("vectors.db"),
            config.vector_store.embedding_dim,
        )
        .await
        .map_err(MnemoError::Anyhow)?,
    );
    let state = StateStore::new(state_pool);
    let store = Arc::new(
        VectorStore::new(vector_pool, config.vector_store.clone())
            .await
            .map_err(MnemoError::Anyhow)?,
    );
    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::from_config(&config.embedder)?);

    match cli.command {
        Command::Ingest { ingestor } => {
            let pipeline = build_pipeline(&config, embedder, store, state).await?;
            let summaries = match ingestor {
                Some(id) => vec![(id.clone(), pipeline.run_ingestion(&id).await?)],
                None => {
                    if pipeline.registered_ids().is_empty() {
                        return Err(MnemoError::Config(
                            "no ingestors configured under `ingestors`".into(),
                        ));
                    }
                    pipeline.start().await
                }
            };
            for (id, summary) in summaries {
                println!(
                    "{id}: success={} documents={} errors={} duration={:.1}s",
                    summary.success,
                    summary.documents_processed,
                    summary.errors.len(),
                    summary.duration.as_secs_f64()
                );
                for error in &summary.errors {
                    println!("  error: {error}");
                }
            }
            Ok(())
        }
        Command::WatchFiles => {
            // Exported batch files carry gateway-shaped message records
            let driver = FileIngestDriver::new(
                &config.pipelines.file,
                Arc::new(TelegramPreprocessor::new()),
                embedder,
                store,
            );
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown_tx.send(true);
            });
            driver.run(shutdown_rx).await;
            Ok(())
        }
        Command::Query {
            source,
            user,
            question,
        } => {
            let question = question.join(" ");
            if question.trim().is_empty() {
                return Err(MnemoError::InvalidInput("empty question".into()));
            }

            let generator = match &config.generator {
                Some(generator_config) => Some(generator_from_config(generator_config)?),
                None => None,
            };
            let orchestrator = QueryOrchestrator::new(
                embedder,
                store,
                PromptBuilder::from_config(&config.prompt_builder),
                generator,
                config.orchestrator.clone(),
            );
            let answer = orchestrator.process_query(&source, &user, &question).await?;
            println!("{answer}");
            Ok(())
        }
        Command::Status => {
            let ingestors = state.list_ingestors().await.map_err(MnemoError::Anyhow)?;
            if ingestors.is_empty() {
                println!("no ingestors registered");
            }
            for id in ingestors {
                let ingestor_state = state.get(&id).await.map_err(MnemoError::Anyhow)?;
                println!(
                    "{id}: last_timestamp={} metadata={}",
                    ingestor_state.last_timestamp,
                    serde_json::to_string(&ingestor_state.metadata)?
                );
            }
            Ok(())
        }
        Command::Healthcheck => {
            let health = store.healthcheck().await;
            println!(
                "store: {} ({})",
                if health.healthy { "ok" } else { "unhealthy" },
                health.details
            );

            for (name, adapter) in configured_adapters(&config)? {
                let adapter_health = adapter.healthcheck().await;
                println!(
                    "{name}: {} ({})",
                    if adapter_health.healthy { "ok" } else { "unhealthy" },
                    adapter_health.details
                );
            }

            if health.healthy {
                Ok(())
            } else {
                Err(MnemoError::Store("store unhealthy".into()))
            }
        }
    }
}

/// Wire configured sources into a pipeline.
async fn build_pipeline(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    store: Arc<VectorStore>,
    state: StateStore,
) -> Result<IngestionPipeline> {
    let auth_timeout = config
        .ingestors
        .whatsapp
        .as_ref()
        .map(|w| Duration::from_secs(w.auth_timeout_secs))
        .unwrap_or(Duration::from_secs(300));

    let mut pipeline = IngestionPipeline::new(
        embedder,
        store,
        state,
        config.pipelines.default.batch_size,
        auth_timeout,
    );

    for (id, adapter, preprocessor) in configured_ingestors(config)? {
        pipeline
            .register_ingestor(&id, adapter, preprocessor)
            .await?;
    }
    Ok(pipeline)
}

type ConfiguredIngestor = (String, Arc<dyn SourceAdapter>, Arc<dyn Preprocessor>);

fn configured_ingestors(config: &Config) -> Result<Vec<ConfiguredIngestor>> {
    let mut ingestors: Vec<ConfiguredIngestor> = Vec::new();
    if let Some(telegram) = &config.ingestors.telegram {
        ingestors.push((
            "telegram_ingestor".to_string(),
            Arc::new(TelegramAdapter::new(telegram)?),
            Arc::new(TelegramPreprocessor::new()),
        ));
    }
    if let Some(whatsapp) = &config.ingestors.whatsapp {
        ingestors.push((
            "whatsapp_ingestor".to_string(),
            Arc::new(WhatsappAdapter::new(whatsapp)?),
            Arc::new(WhatsappPreprocessor::new()),
        ));
    }
    if let Some(github) = &config.ingestors.github {
        ingestors.push((
            "github_ingestor".to_string(),
            Arc::new(GithubAdapter::new(github)?),
            Arc::new(GithubPreprocessor::new()),
        ));
    }
    Ok(ingestors)
}

fn configured_adapters(config: &Config) -> Result<Vec<(String, Arc<dyn SourceAdapter>)>> {
    Ok(configured_ingestors(config)?
        .into_iter()
        .map(|(id, adapter, _)| (id, adapter))
        .collect())
}
