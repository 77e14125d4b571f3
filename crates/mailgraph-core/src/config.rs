use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MailgraphError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraphBackend {
    Neo4j,
    Memory,
}

impl FromStr for GraphBackend {
    type Err = MailgraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(GraphBackend::Neo4j),
            "memory" | "in_memory" => Ok(GraphBackend::Memory),
            other => Err(MailgraphError::Config(format!("unknown graph backend: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub graph_backend: GraphBackend,
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub anthropic_api_key: String,
    pub extraction_model: String,
    pub embedding_api_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub pipeline: PipelineConfig,
    pub resolver: ResolverConfig,
}

/// Knobs for the extraction worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    pub failure_threshold: f64,
    pub progress_interval: u64,
    pub min_confidence: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            channel_capacity: 256,
            failure_threshold: 0.02,
            progress_interval: 50,
            min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Minimum cosine similarity for a fuzzy match.
    pub similarity_threshold: f64,
    /// Type categories resolved by embedding similarity when no exact key exists.
    pub fuzzy_types: Vec<String>,
    /// Candidates fetched from the vector search per fuzzy lookup.
    pub fuzzy_candidates: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            fuzzy_types: vec!["concept".to_string()],
            fuzzy_candidates: 5,
        }
    }
}

impl ResolverConfig {
    pub fn is_fuzzy(&self, type_category: &str) -> bool {
        self.fuzzy_types.iter().any(|t| t == type_category)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let pipeline_defaults = PipelineConfig::default();
        let resolver_defaults = ResolverConfig::default();

        let fuzzy_types = std::env::var("FUZZY_TYPES")
            .map(|v| {
                v.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or(resolver_defaults.fuzzy_types);

        Self {
            graph_backend: env_or("GRAPH_BACKEND", GraphBackend::Neo4j),
            neo4j_uri: std::env::var("NEO4J_URI").unwrap_or_else(|_| "bolt://localhost:7687".into()),
            neo4j_user: std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".into()),
            neo4j_password: std::env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "mailgraph".into()),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            extraction_model: std::env::var("EXTRACTION_MODEL")
                .unwrap_or_else(|_| "claude-haiku-4-5-20251001".into()),
            embedding_api_url: std::env::var("EMBEDDING_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/embeddings".into()),
            embedding_api_key: std::env::var("EMBEDDING_API_KEY").unwrap_or_default(),
            embedding_model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".into()),
            embedding_dimension: env_or("EMBEDDING_DIMENSION", 1536),
            pipeline: PipelineConfig {
                workers: env_or("EXTRACTION_WORKERS", pipeline_defaults.workers),
                channel_capacity: env_or("INGEST_CHANNEL_CAPACITY", pipeline_defaults.channel_capacity),
                failure_threshold: env_or("FAILURE_THRESHOLD", pipeline_defaults.failure_threshold),
                progress_interval: env_or("PROGRESS_INTERVAL", pipeline_defaults.progress_interval),
                min_confidence: env_or("MIN_CONFIDENCE", pipeline_defaults.min_confidence),
            },
            resolver: ResolverConfig {
                similarity_threshold: env_or(
                    "SIMILARITY_THRESHOLD",
                    resolver_defaults.similarity_threshold,
                ),
                fuzzy_types,
                fuzzy_candidates: env_or("FUZZY_CANDIDATES", resolver_defaults.fuzzy_candidates),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(MailgraphError::Config("EXTRACTION_WORKERS must be at least 1".into()));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(MailgraphError::Config(
                "INGEST_CHANNEL_CAPACITY must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pipeline.failure_threshold) {
            return Err(MailgraphError::Config("FAILURE_THRESHOLD must be within [0, 1]".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(MailgraphError::Config("EMBEDDING_DIMENSION must be positive".into()));
        }
        Ok(())
    }
}
