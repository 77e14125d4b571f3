use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use mailgraph_core::entity::{
    Edge, EmailDocument, GraphRef, NewDocument, NewEdge, NewNode, Node, RefKind, VectorMatch,
};
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::graph::{DocumentStore, GraphStore};

use crate::similarity::cosine_distance;

#[derive(Default)]
struct MemoryState {
    nodes: HashMap<Uuid, Node>,
    node_keys: HashMap<String, Uuid>,
    edges: Vec<Edge>,
    adjacency: HashMap<GraphRef, Vec<usize>>,
    documents: HashMap<Uuid, EmailDocument>,
    document_keys: HashMap<String, Uuid>,
}

/// Process-local graph and document store with the same uniqueness semantics
/// as the Neo4j backend. Vector search is a brute-force cosine scan.
#[derive(Default)]
pub struct InMemoryGraphStore {
    state: RwLock<MemoryState>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn edges(&self) -> Vec<Edge> {
        self.state.read().await.edges.clone()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn document_count(&self) -> usize {
        self.state.read().await.documents.len()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_node(&self, input: &NewNode) -> Result<Node> {
        input.validate()?;

        let mut state = self.state.write().await;
        if state.node_keys.contains_key(&input.unique_key) {
            return Err(MailgraphError::DuplicateKey(input.unique_key.clone()));
        }

        let node = input.clone().into_node(Uuid::new_v4(), Utc::now());
        state.node_keys.insert(node.unique_key.clone(), node.id);
        state.nodes.insert(node.id, node.clone());

        tracing::debug!(node_id = %node.id, key = %node.unique_key, "Stored node");
        Ok(node)
    }

    async fn find_node_by_key(&self, key: &str) -> Result<Option<Node>> {
        let state = self.state.read().await;
        Ok(state
            .node_keys
            .get(key)
            .and_then(|id| state.nodes.get(id))
            .cloned())
    }

    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>> {
        Ok(self.state.read().await.nodes.get(&id).cloned())
    }

    async fn find_nodes_by_name(&self, type_category: &str, name: &str) -> Result<Vec<Node>> {
        let wanted = name.trim().to_lowercase();
        let state = self.state.read().await;
        Ok(state
            .nodes
            .values()
            .filter(|n| n.type_category == type_category && n.name.trim().to_lowercase() == wanted)
            .cloned()
            .collect())
    }

    async fn create_edge(&self, input: &NewEdge) -> Result<Edge> {
        input.validate()?;

        let mut state = self.state.write().await;
        for endpoint in [input.from, input.to] {
            let exists = match endpoint.kind {
                RefKind::Entity => state.nodes.contains_key(&endpoint.id),
                RefKind::Document => state.documents.contains_key(&endpoint.id),
            };
            if !exists {
                return Err(MailgraphError::NotFound(format!("edge endpoint {endpoint}")));
            }
        }

        let edge = input.clone().into_edge(Uuid::new_v4());
        let index = state.edges.len();
        state.edges.push(edge.clone());
        state.adjacency.entry(edge.from).or_default().push(index);
        if edge.to != edge.from {
            state.adjacency.entry(edge.to).or_default().push(index);
        }
        Ok(edge)
    }

    async fn find_edges_touching(
        &self,
        node: GraphRef,
        edge_types: Option<&[String]>,
    ) -> Result<Vec<Edge>> {
        let state = self.state.read().await;
        let Some(indices) = state.adjacency.get(&node) else {
            return Ok(Vec::new());
        };

        Ok(indices
            .iter()
            .map(|&i| &state.edges[i])
            .filter(|e| edge_types.map_or(true, |types| types.iter().any(|t| *t == e.edge_type)))
            .cloned()
            .collect())
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        type_category: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let state = self.state.read().await;
        let mut matches: Vec<VectorMatch> = state
            .nodes
            .values()
            .filter(|node| type_category.map_or(true, |t| node.type_category == t))
            .filter_map(|node| {
                let embedding = node.embedding.as_ref()?;
                Some(VectorMatch {
                    node: node.clone(),
                    distance: cosine_distance(vector, embedding),
                })
            })
            .collect();

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn node_count(&self) -> Result<u64> {
        Ok(self.state.read().await.nodes.len() as u64)
    }

    async fn edge_count(&self) -> Result<u64> {
        Ok(self.state.read().await.edges.len() as u64)
    }
}

#[async_trait]
impl DocumentStore for InMemoryGraphStore {
    async fn create_document(&self, input: &NewDocument) -> Result<EmailDocument> {
        input.validate()?;

        let mut state = self.state.write().await;
        if state.document_keys.contains_key(&input.message_id) {
            return Err(MailgraphError::DuplicateKey(input.message_id.clone()));
        }

        let document = input.clone().into_document(Uuid::new_v4());
        state.document_keys.insert(document.message_id.clone(), document.id);
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn find_document_by_key(&self, message_id: &str) -> Result<Option<EmailDocument>> {
        let state = self.state.read().await;
        Ok(state
            .document_keys
            .get(message_id)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailgraph_core::entity::{edge_types, Properties};

    fn new_node(key: &str, embedding: Option<Vec<f32>>) -> NewNode {
        NewNode {
            unique_key: key.to_string(),
            type_category: "concept".to_string(),
            name: key.trim_start_matches("concept:").to_string(),
            properties: Properties::new(),
            embedding,
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn test_unique_key_constraint() {
        let store = InMemoryGraphStore::new();
        store.create_node(&new_node("concept:gas", None)).await.unwrap();
        let err = store.create_node(&new_node("concept:gas", None)).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(store.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_edges_touching_with_filter() {
        let store = InMemoryGraphStore::new();
        let a = store.create_node(&new_node("concept:a", None)).await.unwrap();
        let b = store.create_node(&new_node("concept:b", None)).await.unwrap();
        store
            .create_edge(&NewEdge::new("RELATED_TO", a.graph_ref(), b.graph_ref()))
            .await
            .unwrap();
        store
            .create_edge(&NewEdge::new(edge_types::COMMUNICATES_WITH, b.graph_ref(), a.graph_ref()))
            .await
            .unwrap();

        assert_eq!(store.find_edges_touching(a.graph_ref(), None).await.unwrap().len(), 2);
        let filter = vec!["RELATED_TO".to_string()];
        let filtered = store
            .find_edges_touching(b.graph_ref(), Some(filter.as_slice()))
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].edge_type, "RELATED_TO");
    }

    #[tokio::test]
    async fn test_edge_requires_existing_endpoints() {
        let store = InMemoryGraphStore::new();
        let a = store.create_node(&new_node("concept:a", None)).await.unwrap();
        let dangling = GraphRef::document(Uuid::new_v4());
        let result = store
            .create_edge(&NewEdge::new(edge_types::MENTIONS, dangling, a.graph_ref()))
            .await;
        assert!(matches!(result, Err(MailgraphError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_vector_search_orders_by_distance() {
        let store = InMemoryGraphStore::new();
        store
            .create_node(&new_node("concept:near", Some(vec![1.0, 0.1])))
            .await
            .unwrap();
        store
            .create_node(&new_node("concept:far", Some(vec![0.0, 1.0])))
            .await
            .unwrap();
        store.create_node(&new_node("concept:none", None)).await.unwrap();

        let hits = store.vector_search(&[1.0, 0.0], None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.unique_key, "concept:near");
        assert!(hits[0].distance < hits[1].distance);
    }

    #[tokio::test]
    async fn test_vector_search_filters_type_before_limit() {
        let store = InMemoryGraphStore::new();
        store
            .create_node(&new_node("concept:far", Some(vec![0.7, 0.7])))
            .await
            .unwrap();
        for i in 0..3 {
            let mut org = new_node(&format!("organization:{i}"), Some(vec![1.0, 0.0]));
            org.type_category = "organization".into();
            store.create_node(&org).await.unwrap();
        }

        let unfiltered = store.vector_search(&[1.0, 0.0], None, 1).await.unwrap();
        assert_eq!(unfiltered[0].node.type_category, "organization");

        let hits = store.vector_search(&[1.0, 0.0], Some("concept"), 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].node.unique_key, "concept:far");
    }

    #[tokio::test]
    async fn test_document_dedup() {
        let store = InMemoryGraphStore::new();
        let doc = NewDocument {
            message_id: "<m1>".into(),
            from: "a@x.com".into(),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: String::new(),
            body: String::new(),
            timestamp: Utc::now(),
        };
        let created = store.create_document(&doc).await.unwrap();
        assert!(store.create_document(&doc).await.unwrap_err().is_duplicate_key());
        let found = store.find_document_by_key("<m1>").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
    }
}
