pub mod cancel;
pub mod config;
pub mod entity;
pub mod error;
pub mod graph;
pub mod llm;
pub mod stats;

pub use cancel::CancellationSignal;
pub use config::{AppConfig, GraphBackend, PipelineConfig, ResolverConfig};
pub use entity::{
    edge_types, Edge, EmailDocument, GraphRef, NewDocument, NewEdge, NewNode, Node, Properties,
    RefKind, VectorMatch,
};
pub use error::{MailgraphError, Result};
pub use graph::{DocumentStore, GraphStore};
pub use llm::LanguageModelClient;
pub use stats::BatchStats;
