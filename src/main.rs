use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nutrikal_common::RetrievalResult;
use nutrikal_knowledge::{
    create_embedder, sample_knowledge_base, DocumentLoader, Embedder, IndexBuilder, IndexHandle,
    KnowledgeConfig, Retriever, VectorIndex,
};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PROBE_QUERIES: [&str; 5] = [
    "aliments pour améliorer la mémoire",
    "sources d'oméga-3",
    "réduire le stress avec l'alimentation",
    "antioxydants pour le cerveau",
    "petit-déjeuner pour la concentration",
];
const PROBE_K: usize = 2;
const PREVIEW_CHARS: usize = 160;

#[derive(Debug, Parser)]
#[command(
    name = "nutrikal-rag",
    version,
    about = "Semantic retrieval over the NutriKal nutrition knowledge base"
)]
struct Cli {
    /// TOML configuration file, layered under NUTRIKAL__* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the sample knowledge base to the configured source path
    Seed {
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Load, chunk and embed the knowledge base, then save the index
    Build,
    /// Retrieve the chunks closest to a query
    Query {
        text: String,
        #[arg(short, long)]
        k: Option<usize>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the built-in probe queries
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nutrikal=info,nutrikal_knowledge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config =
        KnowledgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Seed { output, force } => {
            let path = output.unwrap_or_else(|| config.loader.source_path.clone());
            seed(&path, force).await
        }
        Command::Build => build(&config).await,
        Command::Query { text, k, json } => {
            let retriever = open_retriever(&config).await?;
            let results = retriever.retrieve(&text, k.unwrap_or(retriever.default_k())).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&config, &results);
            }
            retriever.shutdown().await;
            Ok(())
        }
        Command::Probe => {
            let retriever = open_retriever(&config).await?;
            for query in PROBE_QUERIES {
                println!("\n=== {} ===", query);
                let results = retriever.retrieve(query, PROBE_K).await?;
                print_results(&config, &results);
            }
            retriever.shutdown().await;
            Ok(())
        }
    }
}

async fn seed(path: &Path, force: bool) -> Result<()> {
    if !force && tokio::fs::try_exists(path).await.unwrap_or(false) {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, sample_knowledge_base())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote sample knowledge base to {}", path.display());
    Ok(())
}

async fn build(config: &KnowledgeConfig) -> Result<()> {
    let documents =
        DocumentLoader::new(config.loader.schema.clone())?.load(&config.loader.source_path)?;
    let embedder = create_embedder(&config.embedding)?;
    let builder = IndexBuilder::from_config(embedder, config)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling build");
                cancel.cancel();
            }
        })
    };
    let outcome = builder.build(&documents, &cancel).await;
    interrupt.abort();

    let index = outcome?;
    index.save(&config.index.path).await?;
    info!(
        "Index of {} documents ({} chunks) ready at {}",
        documents.len(),
        index.len(),
        config.index.path.display()
    );
    Ok(())
}

async fn open_retriever(config: &KnowledgeConfig) -> Result<Retriever> {
    let embedder = create_embedder(&config.embedding)?;
    let index = VectorIndex::load(&config.index.path, Some(embedder.dimensions()))
        .await
        .context("No usable index; run `nutrikal-rag build` first")?;
    Ok(Retriever::new(
        embedder,
        IndexHandle::with_index(index),
        config.retrieval.clone(),
    ))
}

fn print_results(config: &KnowledgeConfig, results: &[RetrievalResult]) {
    if results.is_empty() {
        println!("(no results)");
        return;
    }

    let label_field = config.loader.schema.required_fields.first().map(|spec| spec.name.as_str());
    for (rank, result) in results.iter().enumerate() {
        let label = label_field
            .and_then(|name| result.structured_fields.get(name))
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("document {}", result.source_document_id));
        println!("{}. {} [score {:.4}, chunk {}]", rank + 1, label, result.score, result.chunk_id);

        let preview: String = result
            .chunk_text
            .chars()
            .take(PREVIEW_CHARS)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        println!("   {}", preview);
    }
}
