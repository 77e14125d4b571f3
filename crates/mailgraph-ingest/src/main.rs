use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use mailgraph_core::graph::{DocumentStore, GraphStore};
use mailgraph_core::{AppConfig, BatchStats, CancellationSignal, GraphBackend, NewDocument, Result};
use mailgraph_extraction::{
    parse_raw_email, AnthropicClient, ContentExtractor, EntityResolver, ExtractionPipeline,
    RelationshipSynthesizer, TypeRegistry,
};
use mailgraph_graph::{InMemoryGraphStore, Neo4jGraphStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "mailgraph=info"
                    .parse()
                    .unwrap_or_else(|_| LevelFilter::INFO.into()),
            ),
        )
        .init();

    let Some(root) = std::env::args().nth(1).map(PathBuf::from) else {
        eprintln!("usage: mailgraph-ingest <maildir>");
        std::process::exit(2);
    };

    match run(root).await {
        Ok(stats) => {
            let summary = serde_json::to_string(&stats).unwrap_or_default();
            tracing::info!(stats = %summary, "Ingest complete");
        }
        Err(e) => {
            if let Some(stats) = e.batch_stats() {
                tracing::error!(
                    processed = stats.processed,
                    failures = stats.failures,
                    skipped = stats.skipped,
                    "Ingest aborted"
                );
            }
            tracing::error!(error = %e, "Ingest failed");
            std::process::exit(1);
        }
    }
}

async fn run(root: PathBuf) -> Result<BatchStats> {
    let config = AppConfig::from_env();
    config.validate()?;

    let (graph, documents): (Arc<dyn GraphStore>, Arc<dyn DocumentStore>) = match config.graph_backend {
        GraphBackend::Neo4j => {
            let store = Arc::new(Neo4jGraphStore::new(&config).await);
            store.ensure_schema().await?;
            (store.clone() as Arc<dyn GraphStore>, store as Arc<dyn DocumentStore>)
        }
        GraphBackend::Memory => {
            tracing::warn!("Using in-memory graph store, results are discarded on exit");
            let store = Arc::new(InMemoryGraphStore::new());
            (store.clone() as Arc<dyn GraphStore>, store as Arc<dyn DocumentStore>)
        }
    };

    let llm = Arc::new(AnthropicClient::new(&config)?);
    let resolver = Arc::new(EntityResolver::new(
        graph.clone(),
        llm.clone(),
        TypeRegistry::with_defaults(),
        config.resolver.clone(),
    ));
    let pipeline = Arc::new(ExtractionPipeline::new(
        documents,
        ContentExtractor::new(llm),
        resolver,
        RelationshipSynthesizer::new(graph.clone()),
        config.pipeline.clone(),
    ));

    let cancel = CancellationSignal::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling ingest");
            on_signal.cancel();
        }
    });

    let (tx, rx) = mpsc::channel(config.pipeline.channel_capacity);
    let producer_cancel = cancel.clone();
    let producer = tokio::task::spawn_blocking(move || load_documents(&root, tx, &producer_cancel));

    let outcome = pipeline.process_batch(rx, cancel).await;

    match producer.await {
        Ok(loaded) => tracing::info!(files = loaded.files, unparseable = loaded.unparseable, "Loader finished"),
        Err(e) => tracing::error!(error = %e, "Loader task failed"),
    }

    let stats = outcome?;
    match (graph.node_count().await, graph.edge_count().await) {
        (Ok(nodes), Ok(edges)) => tracing::info!(nodes, edges, "Graph size"),
        (Err(e), _) | (_, Err(e)) => tracing::warn!(error = %e, "Could not read graph size"),
    }
    Ok(stats)
}

#[derive(Debug, Default)]
struct LoadSummary {
    files: u64,
    unparseable: u64,
}

/// Streams every parseable message under `root` into `tx`. Stops early when
/// the pipeline hangs up or the run is cancelled.
fn load_documents(root: &Path, tx: mpsc::Sender<NewDocument>, cancel: &CancellationSignal) -> LoadSummary {
    let mut summary = LoadSummary::default();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        if cancel.is_cancelled() {
            break;
        }
        let path = entry.path();
        summary.files += 1;

        let raw = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read file");
                summary.unparseable += 1;
                continue;
            }
        };

        let document = match parse_raw_email(&raw) {
            Ok(document) => document,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping unparseable message");
                summary.unparseable += 1;
                continue;
            }
        };

        if tx.blocking_send(document).is_err() {
            tracing::debug!("Pipeline closed, stopping loader");
            break;
        }
    }

    summary
}
