use async_trait::async_trait;
use uuid::Uuid;

use crate::entity::{Edge, EmailDocument, GraphRef, NewDocument, NewEdge, NewNode, Node, VectorMatch};
use crate::error::Result;

/// Node and edge persistence the engine depends on. Implementations must
/// enforce one node per `unique_key` and report violations as
/// `MailgraphError::DuplicateKey`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn create_node(&self, input: &NewNode) -> Result<Node>;
    async fn find_node_by_key(&self, key: &str) -> Result<Option<Node>>;
    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>>;
    /// Case-insensitive exact name match within one type category.
    async fn find_nodes_by_name(&self, type_category: &str, name: &str) -> Result<Vec<Node>>;
    async fn create_edge(&self, input: &NewEdge) -> Result<Edge>;
    /// Every edge with `node` at either end, optionally restricted to `edge_types`.
    async fn find_edges_touching(
        &self,
        node: GraphRef,
        edge_types: Option<&[String]>,
    ) -> Result<Vec<Edge>>;
    /// Nodes carrying embeddings, nearest first. With `type_category` set,
    /// other types are excluded before the `top_k` cut.
    async fn vector_search(
        &self,
        vector: &[f32],
        type_category: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>>;
    async fn node_count(&self) -> Result<u64>;
    async fn edge_count(&self) -> Result<u64>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, input: &NewDocument) -> Result<EmailDocument>;
    async fn find_document_by_key(&self, message_id: &str) -> Result<Option<EmailDocument>>;
}
