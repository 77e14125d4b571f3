//! Shared fixtures for the cross-crate integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use mailgraph_core::config::{PipelineConfig, ResolverConfig};
use mailgraph_core::entity::NewDocument;
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::llm::LanguageModelClient;
use mailgraph_core::CancellationSignal;
use mailgraph_extraction::{
    ContentExtractor, EntityResolver, ExtractionPipeline, RelationshipSynthesizer, TypeRegistry,
};
use mailgraph_graph::InMemoryGraphStore;

pub const EMPTY_EXTRACTION: &str = r#"{"entities": [], "relationships": []}"#;

#[derive(Debug, Clone)]
enum Script {
    Reply(String),
    Fail,
}

/// Language model double. Completions are looked up by the email's subject
/// line; unknown subjects get an empty extraction. Embeddings are only
/// available for texts registered with [`with_embedding`](Self::with_embedding).
pub struct ScriptedLanguageModel {
    scripts: Mutex<HashMap<String, Script>>,
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    dimension: usize,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    cancel_at: Mutex<Option<(usize, CancellationSignal)>>,
}

impl Default for ScriptedLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLanguageModel {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            embeddings: Mutex::new(HashMap::new()),
            dimension: 3,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            cancel_at: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reply(self, subject: &str, json: &str) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject.to_string(), Script::Reply(json.to_string()));
        self
    }

    pub fn fail(self, subject: &str) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(subject.to_string(), Script::Fail);
        self
    }

    pub fn with_embedding(self, text: &str, vector: Vec<f32>) -> Self {
        self.embeddings
            .lock()
            .unwrap()
            .insert(text.to_string(), vector);
        self
    }

    /// Fires `signal` when the `call`-th completion starts.
    pub fn cancel_on_call(self, call: usize, signal: CancellationSignal) -> Self {
        *self.cancel_at.lock().unwrap() = Some((call, signal));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn script_for(&self, prompt: &str) -> Option<Script> {
        let subject = prompt
            .lines()
            .find_map(|line| line.strip_prefix("Subject: "))?;
        self.scripts.lock().unwrap().get(subject).cloned()
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedLanguageModel {
    async fn complete(&self, _system: &str, prompt: &str) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let trigger = self
            .cancel_at
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(at, _)| *at == call)
            .map(|(_, signal)| signal.clone());
        if let Some(signal) = trigger {
            signal.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.script_for(prompt) {
            Some(Script::Reply(json)) => Ok(json),
            Some(Script::Fail) => Err(MailgraphError::LanguageModel("scripted failure".into())),
            None => Ok(EMPTY_EXTRACTION.to_string()),
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embeddings
            .lock()
            .unwrap()
            .get(text)
            .cloned()
            .ok_or_else(|| MailgraphError::LanguageModel(format!("no embedding for {text:?}")))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }
}

/// In-memory store, scripted model and a pipeline wired over both.
pub struct Harness {
    pub store: Arc<InMemoryGraphStore>,
    pub llm: Arc<ScriptedLanguageModel>,
    pub pipeline: Arc<ExtractionPipeline>,
}

impl Harness {
    pub fn new(llm: ScriptedLanguageModel, config: PipelineConfig) -> Self {
        let store = Arc::new(InMemoryGraphStore::new());
        let llm = Arc::new(llm);
        let resolver = Arc::new(EntityResolver::new(
            store.clone(),
            llm.clone(),
            TypeRegistry::with_defaults(),
            ResolverConfig::default(),
        ));
        let pipeline = Arc::new(ExtractionPipeline::new(
            store.clone(),
            ContentExtractor::new(llm.clone()),
            resolver,
            RelationshipSynthesizer::new(store.clone()),
            config,
        ));
        Self {
            store,
            llm,
            pipeline,
        }
    }

    /// Feeds `documents` through one batch and waits for the result.
    pub async fn run(&self, documents: Vec<NewDocument>) -> Result<mailgraph_core::BatchStats> {
        self.run_with_cancel(documents, CancellationSignal::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        documents: Vec<NewDocument>,
        cancel: CancellationSignal,
    ) -> Result<mailgraph_core::BatchStats> {
        let (tx, rx) = tokio::sync::mpsc::channel(documents.len().max(1));
        for document in documents {
            tx.send(document).await.unwrap();
        }
        drop(tx);
        self.pipeline.clone().process_batch(rx, cancel).await
    }
}

pub fn pipeline_config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        workers,
        progress_interval: 0,
        ..PipelineConfig::default()
    }
}

/// An email with a fixed timestamp; the subject doubles as the script key.
pub fn email(message_id: &str, from: &str, to: &[&str], subject: &str) -> NewDocument {
    NewDocument {
        message_id: message_id.to_string(),
        from: from.to_string(),
        to: to.iter().map(|s| s.to_string()).collect(),
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: subject.to_string(),
        body: format!("Body of {subject}"),
        timestamp: Utc.with_ymd_and_hms(2001, 5, 14, 16, 39, 0).unwrap(),
    }
}
