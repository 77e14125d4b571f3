use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use mailgraph_core::cancel::CancellationSignal;
use mailgraph_core::config::PipelineConfig;
use mailgraph_core::entity::{EmailDocument, NewDocument, Node};
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::graph::DocumentStore;
use mailgraph_core::stats::BatchStats;

use crate::content::{ContentExtraction, ContentExtractor};
use crate::email::parse_mailbox;
use crate::relationships::RelationshipSynthesizer;
use crate::resolver::{EntityCandidate, EntityResolver};

/// Extracted entities below this confidence are discarded; the bound itself passes.
pub fn passes_confidence(confidence: f64, min_confidence: f64) -> bool {
    confidence >= min_confidence
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentOutcome {
    Processed,
    Skipped,
    Failed,
}

/// Lock-free batch counters shared by every worker.
#[derive(Default)]
struct BatchCounters {
    completed: AtomicU64,
    processed: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    entities_created: AtomicU64,
    relationships_created: AtomicU64,
}

impl BatchCounters {
    /// Returns this document's completion ordinal, unique across workers.
    fn record(&self, outcome: DocumentOutcome) -> u64 {
        match outcome {
            DocumentOutcome::Processed => self.processed.fetch_add(1, Ordering::Relaxed),
            DocumentOutcome::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
            DocumentOutcome::Failed => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn snapshot(&self) -> BatchStats {
        BatchStats {
            processed: self.processed.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            entities_created: self.entities_created.load(Ordering::Relaxed),
            relationships_created: self.relationships_created.load(Ordering::Relaxed),
        }
    }
}

/// Per-document extraction → resolution → synthesis across a bounded worker pool.
pub struct ExtractionPipeline {
    documents: Arc<dyn DocumentStore>,
    extractor: ContentExtractor,
    resolver: Arc<EntityResolver>,
    synthesizer: RelationshipSynthesizer,
    config: PipelineConfig,
}

impl ExtractionPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        extractor: ContentExtractor,
        resolver: Arc<EntityResolver>,
        synthesizer: RelationshipSynthesizer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            documents,
            extractor,
            resolver,
            synthesizer,
            config,
        }
    }

    /// Drains `documents` with at most `config.workers` documents in flight.
    ///
    /// Per-document failures are counted, never fatal. Once everything
    /// dispatched has finished, returns `Cancelled` if `cancel` fired, or
    /// `QualityGate` if the failure rate exceeds `config.failure_threshold`.
    /// Work committed before either error is kept.
    pub async fn process_batch(
        self: Arc<Self>,
        mut documents: mpsc::Receiver<NewDocument>,
        cancel: CancellationSignal,
    ) -> Result<BatchStats> {
        let workers = self.config.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let counters = Arc::new(BatchCounters::default());
        let mut join_set = JoinSet::new();
        let started = Instant::now();
        let mut cancelled = false;

        info!(workers, "Starting batch extraction");

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                doc = documents.recv() => doc,
            };
            let Some(document) = next else {
                break;
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| MailgraphError::Internal(format!("worker semaphore closed: {e}")))?,
            };

            let pipeline = self.clone();
            let worker_counters = counters.clone();
            join_set.spawn(async move {
                let _permit = permit;
                let message_id = document.message_id.clone();
                let outcome = pipeline.process_document(document, &worker_counters).await;
                let done = worker_counters.record(outcome);
                debug!(message_id = %message_id, outcome = ?outcome, "Document finished");
                pipeline.report_progress(done, started, &worker_counters);
            });

            while let Some(joined) = join_set.try_join_next() {
                Self::absorb_join(joined, &counters);
            }
        }

        if cancelled {
            warn!(in_flight = join_set.len(), "Batch cancelled, draining in-flight documents");
        }
        while let Some(joined) = join_set.join_next().await {
            Self::absorb_join(joined, &counters);
        }

        let stats = counters.snapshot();
        let elapsed = started.elapsed().as_secs_f64();
        info!(
            processed = stats.processed,
            failures = stats.failures,
            skipped = stats.skipped,
            entities_created = stats.entities_created,
            relationships_created = stats.relationships_created,
            elapsed_secs = elapsed,
            "Batch extraction finished"
        );

        if cancelled {
            return Err(MailgraphError::Cancelled { stats });
        }
        if stats.exceeds_failure_threshold(self.config.failure_threshold) {
            error!(
                failure_rate = stats.failure_rate(),
                threshold = self.config.failure_threshold,
                "Batch failure rate exceeds threshold"
            );
            return Err(MailgraphError::QualityGate { stats });
        }
        Ok(stats)
    }

    fn absorb_join(joined: std::result::Result<(), tokio::task::JoinError>, counters: &BatchCounters) {
        if let Err(join_err) = joined {
            error!(error = %join_err, "Extraction task panicked");
            counters.record(DocumentOutcome::Failed);
        }
    }

    fn report_progress(&self, done: u64, started: Instant, counters: &BatchCounters) {
        let interval = self.config.progress_interval;
        if interval == 0 || done % interval != 0 {
            return;
        }
        let stats = counters.snapshot();
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        info!(
            completed = done,
            processed = stats.processed,
            failures = stats.failures,
            skipped = stats.skipped,
            docs_per_sec = %format!("{rate:.1}"),
            "Extraction progress"
        );
    }

    async fn process_document(&self, input: NewDocument, counters: &BatchCounters) -> DocumentOutcome {
        let message_id = input.message_id.clone();

        let document = match self.store_document(input).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!(message_id = %message_id, "Document already ingested, skipping");
                return DocumentOutcome::Skipped;
            }
            Err(e) => {
                error!(message_id = %message_id, error = %e, "Failed to store document");
                return DocumentOutcome::Failed;
            }
        };

        let mut resolved: HashMap<String, Node> = HashMap::new();
        self.extract_headers(&document, &mut resolved, counters).await;

        let (content_ok, extracted_edges) = match self.extractor.extract(&document).await {
            Ok(extraction) => {
                let edges = self
                    .resolve_content(&document, extraction, &mut resolved, counters)
                    .await;
                (true, edges)
            }
            Err(e) => {
                error!(
                    message_id = %document.message_id,
                    error = %e,
                    "Content extraction failed, keeping header-derived graph only"
                );
                (false, Vec::new())
            }
        };

        let mut edges = RelationshipSynthesizer::derive_edges(&document, &resolved);
        edges.extend(extracted_edges);
        let created = self.synthesizer.persist(edges).await;
        counters
            .relationships_created
            .fetch_add(created, Ordering::Relaxed);

        if content_ok {
            DocumentOutcome::Processed
        } else {
            DocumentOutcome::Failed
        }
    }

    /// `Ok(None)` when the message id has been seen before.
    async fn store_document(&self, input: NewDocument) -> Result<Option<EmailDocument>> {
        if self
            .documents
            .find_document_by_key(&input.message_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        match self.documents.create_document(&input).await {
            Ok(document) => Ok(Some(document)),
            Err(e) if e.is_duplicate_key() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn extract_headers(
        &self,
        document: &EmailDocument,
        resolved: &mut HashMap<String, Node>,
        counters: &BatchCounters,
    ) {
        let addresses = std::iter::once(document.from.as_str()).chain(document.recipients());
        for raw in addresses {
            let Some(candidate) = parse_mailbox(raw)
                .as_ref()
                .and_then(EntityCandidate::from_mailbox)
            else {
                continue;
            };
            if resolved.contains_key(&candidate.canonical_key()) {
                continue;
            }
            self.resolve_into(candidate, resolved, counters).await;
        }
    }

    /// Resolves confident entities and returns the edges for extracted
    /// relationships between them.
    async fn resolve_content(
        &self,
        document: &EmailDocument,
        extraction: ContentExtraction,
        resolved: &mut HashMap<String, Node>,
        counters: &BatchCounters,
    ) -> Vec<mailgraph_core::entity::NewEdge> {
        let min_confidence = self.config.min_confidence;
        let mut by_name: HashMap<String, Node> = HashMap::new();

        for entity in extraction.entities {
            if !passes_confidence(entity.confidence, min_confidence) {
                debug!(
                    name = %entity.name,
                    confidence = entity.confidence,
                    "Dropping low-confidence entity"
                );
                continue;
            }
            let lookup_name = entity.name.to_lowercase();
            let candidate = EntityCandidate::new(entity.type_category, entity.name)
                .with_properties(entity.properties)
                .with_confidence(entity.confidence);

            let key = candidate.canonical_key();
            let node = match resolved.get(&key) {
                Some(node) => Some(node.clone()),
                None => self.resolve_into(candidate, resolved, counters).await,
            };
            if let Some(node) = node {
                by_name.insert(lookup_name, node);
            }
        }

        RelationshipSynthesizer::derive_extracted_edges(
            document,
            &extraction.relationships,
            &by_name,
            min_confidence,
        )
    }

    async fn resolve_into(
        &self,
        candidate: EntityCandidate,
        resolved: &mut HashMap<String, Node>,
        counters: &BatchCounters,
    ) -> Option<Node> {
        let name = candidate.name.clone();
        match self.resolver.resolve(candidate).await {
            Ok(resolution) => {
                if resolution.created {
                    counters.entities_created.fetch_add(1, Ordering::Relaxed);
                }
                resolved.insert(resolution.node.unique_key.clone(), resolution.node.clone());
                Some(resolution.node)
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Entity resolution failed, skipping entity");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_boundary() {
        assert!(passes_confidence(0.7, 0.7));
        assert!(passes_confidence(0.95, 0.7));
        assert!(!passes_confidence(0.69, 0.7));
        assert!(!passes_confidence(0.0, 0.7));
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = BatchCounters::default();
        assert_eq!(counters.record(DocumentOutcome::Processed), 1);
        assert_eq!(counters.record(DocumentOutcome::Failed), 2);
        assert_eq!(counters.record(DocumentOutcome::Skipped), 3);
        let stats = counters.snapshot();
        assert_eq!((stats.processed, stats.failures, stats.skipped), (1, 1, 1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_get_distinct_ordinals() {
        let counters = Arc::new(BatchCounters::default());
        let mut join_set = JoinSet::new();
        for i in 0..64 {
            let counters = counters.clone();
            join_set.spawn(async move {
                let outcome = if i % 3 == 0 {
                    DocumentOutcome::Failed
                } else {
                    DocumentOutcome::Processed
                };
                counters.record(outcome)
            });
        }

        let mut ordinals = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            ordinals.push(joined.unwrap());
        }
        ordinals.sort_unstable();
        assert_eq!(ordinals, (1..=64).collect::<Vec<u64>>());
        assert_eq!(counters.snapshot().total(), 64);
    }
}
