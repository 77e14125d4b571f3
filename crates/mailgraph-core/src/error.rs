use thiserror::Error;

use crate::stats::BatchStats;

#[derive(Error, Debug)]
pub enum MailgraphError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Graph database error: {0}")]
    Graph(String),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint rejected the write. Callers that race on the
    /// same key re-fetch instead of failing.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Batch cancelled after {} documents", .stats.total())]
    Cancelled { stats: BatchStats },

    #[error(
        "Batch failure rate {:.2}% exceeds threshold ({} of {} documents failed)",
        .stats.failure_rate() * 100.0,
        .stats.failures,
        .stats.total()
    )]
    QualityGate { stats: BatchStats },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MailgraphError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, MailgraphError::DuplicateKey(_))
    }

    /// Stats carried by batch-level errors, if any.
    pub fn batch_stats(&self) -> Option<&BatchStats> {
        match self {
            MailgraphError::Cancelled { stats } | MailgraphError::QualityGate { stats } => {
                Some(stats)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MailgraphError>;
