use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use mailgraph_core::entity::{edge_types, EmailDocument, NewEdge, Node};
use mailgraph_core::graph::GraphStore;

use crate::content::ExtractedRelation;
use crate::email::parse_mailbox;
use crate::resolver::EntityCandidate;

/// Fixed confidence for edges inferred from a sender/recipient pair.
pub const COMMUNICATION_CONFIDENCE: f64 = 0.9;

fn address_key(raw: &str) -> Option<String> {
    parse_mailbox(raw)
        .as_ref()
        .and_then(EntityCandidate::from_mailbox)
        .map(|c| c.canonical_key())
}

/// Derives structural edges for one email and writes them to the graph.
pub struct RelationshipSynthesizer {
    graph: Arc<dyn GraphStore>,
}

impl RelationshipSynthesizer {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }

    /// `SENT`, `RECEIVED`, `MENTIONS` and `COMMUNICATES_WITH` edges implied by
    /// the headers of `document` and the nodes resolved for it, keyed by
    /// canonical key.
    pub fn derive_edges(document: &EmailDocument, resolved: &HashMap<String, Node>) -> Vec<NewEdge> {
        let doc_ref = document.graph_ref();
        let mut edges = Vec::new();

        let sender = address_key(&document.from).and_then(|key| resolved.get(&key));
        if let Some(sender) = sender {
            edges.push(
                NewEdge::new(edge_types::SENT, sender.graph_ref(), doc_ref)
                    .with_timestamp(document.timestamp),
            );
        }

        let mut seen = HashSet::new();
        let recipients: Vec<&Node> = document
            .recipients()
            .filter_map(address_key)
            .filter(|key| seen.insert(key.clone()))
            .filter_map(|key| resolved.get(&key))
            .collect();

        for recipient in &recipients {
            edges.push(
                NewEdge::new(edge_types::RECEIVED, doc_ref, recipient.graph_ref())
                    .with_timestamp(document.timestamp),
            );
        }

        let mut mentioned: Vec<&Node> = resolved.values().filter(|n| !n.is_person()).collect();
        mentioned.sort_by(|a, b| a.unique_key.cmp(&b.unique_key));
        for node in mentioned {
            edges.push(
                NewEdge::new(edge_types::MENTIONS, doc_ref, node.graph_ref())
                    .with_confidence(node.confidence)
                    .with_timestamp(document.timestamp),
            );
        }

        if let Some(sender) = sender {
            for recipient in recipients.iter().filter(|r| r.id != sender.id) {
                edges.push(
                    NewEdge::new(edge_types::COMMUNICATES_WITH, sender.graph_ref(), recipient.graph_ref())
                        .with_confidence(COMMUNICATION_CONFIDENCE)
                        .with_timestamp(document.timestamp)
                        .with_property("message_id", document.message_id.clone()),
                );
            }
        }

        edges
    }

    /// Entity-to-entity edges for relationships the language model reported.
    /// `by_name` maps lowercased extracted names to their resolved nodes;
    /// relations below `min_confidence` or with an unresolved end are dropped.
    pub fn derive_extracted_edges(
        document: &EmailDocument,
        relations: &[ExtractedRelation],
        by_name: &HashMap<String, Node>,
        min_confidence: f64,
    ) -> Vec<NewEdge> {
        relations
            .iter()
            .filter(|r| r.confidence >= min_confidence)
            .filter_map(|r| {
                let source = by_name.get(&r.source.to_lowercase());
                let target = by_name.get(&r.target.to_lowercase());
                match (source, target) {
                    (Some(source), Some(target)) => {
                        let mut edge = NewEdge::new(
                            r.relation_type.clone(),
                            source.graph_ref(),
                            target.graph_ref(),
                        )
                        .with_confidence(r.confidence)
                        .with_timestamp(document.timestamp)
                        .with_property("message_id", document.message_id.clone());
                        edge.properties.extend(r.properties.clone());
                        Some(edge)
                    }
                    _ => {
                        warn!(
                            source_name = %r.source,
                            target_name = %r.target,
                            source_found = source.is_some(),
                            target_found = target.is_some(),
                            "Skipping relationship: referenced entity not resolved"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Writes each edge independently; failures are logged and skipped.
    /// Returns how many were stored.
    pub async fn persist(&self, edges: Vec<NewEdge>) -> u64 {
        let mut created = 0;
        for edge in edges {
            match self.graph.create_edge(&edge).await {
                Ok(_) => created += 1,
                Err(e) => {
                    warn!(
                        edge_type = %edge.edge_type,
                        from = %edge.from,
                        to = %edge.to,
                        error = %e,
                        "Failed to create edge, skipping"
                    );
                }
            }
        }
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailgraph_core::entity::{NewDocument, NewNode, Properties};
    use uuid::Uuid;

    fn document(from: &str, to: &[&str], cc: &[&str]) -> EmailDocument {
        NewDocument {
            message_id: "<42@enron.com>".into(),
            from: from.into(),
            to: to.iter().map(|s| s.to_string()).collect(),
            cc: cc.iter().map(|s| s.to_string()).collect(),
            bcc: vec![],
            subject: "Deal".into(),
            body: String::new(),
            timestamp: Utc::now(),
        }
        .into_document(Uuid::new_v4())
    }

    fn node(key: &str, type_category: &str, confidence: f64) -> Node {
        NewNode {
            unique_key: key.into(),
            type_category: type_category.into(),
            name: key.into(),
            properties: Properties::new(),
            embedding: None,
            confidence,
        }
        .into_node(Uuid::new_v4(), Utc::now())
    }

    fn resolved(nodes: &[Node]) -> HashMap<String, Node> {
        nodes.iter().map(|n| (n.unique_key.clone(), n.clone())).collect()
    }

    fn count(edges: &[NewEdge], edge_type: &str) -> usize {
        edges.iter().filter(|e| e.edge_type == edge_type).count()
    }

    #[test]
    fn test_sender_to_two_recipients() {
        let a = node("a@enron.com", "person", 1.0);
        let b = node("b@enron.com", "person", 1.0);
        let c = node("c@enron.com", "person", 1.0);
        let doc = document("A <a@enron.com>", &["b@enron.com", "C <C@Enron.com>"], &[]);

        let edges = RelationshipSynthesizer::derive_edges(&doc, &resolved(&[a.clone(), b.clone(), c.clone()]));

        assert_eq!(count(&edges, edge_types::SENT), 1);
        assert_eq!(count(&edges, edge_types::RECEIVED), 2);
        assert_eq!(count(&edges, edge_types::COMMUNICATES_WITH), 2);
        assert_eq!(count(&edges, edge_types::MENTIONS), 0);
        assert_eq!(edges.len(), 5);

        let sent = edges.iter().find(|e| e.edge_type == edge_types::SENT).unwrap();
        assert_eq!(sent.from, a.graph_ref());
        assert_eq!(sent.to, doc.graph_ref());

        let comm: Vec<&NewEdge> = edges
            .iter()
            .filter(|e| e.edge_type == edge_types::COMMUNICATES_WITH)
            .collect();
        assert!(comm.iter().all(|e| e.from == a.graph_ref() && e.confidence == 0.9));
        assert!(comm.iter().any(|e| e.to == b.graph_ref()));
        assert!(comm.iter().any(|e| e.to == c.graph_ref()));
        assert_eq!(
            comm[0].properties.get("message_id").and_then(|v| v.as_str()),
            Some("<42@enron.com>")
        );
    }

    #[test]
    fn test_self_addressed_and_duplicate_recipients() {
        let a = node("a@enron.com", "person", 1.0);
        let b = node("b@enron.com", "person", 1.0);
        let doc = document("a@enron.com", &["a@enron.com", "b@enron.com"], &["B@enron.com"]);

        let edges = RelationshipSynthesizer::derive_edges(&doc, &resolved(&[a, b]));
        assert_eq!(count(&edges, edge_types::RECEIVED), 2);
        assert_eq!(count(&edges, edge_types::COMMUNICATES_WITH), 1);
    }

    #[test]
    fn test_mentions_copy_node_confidence() {
        let a = node("a@enron.com", "person", 1.0);
        let project = node("project:raptor", "project", 0.75);
        let doc = document("a@enron.com", &[], &[]);

        let edges = RelationshipSynthesizer::derive_edges(&doc, &resolved(&[a, project.clone()]));
        let mentions: Vec<&NewEdge> = edges
            .iter()
            .filter(|e| e.edge_type == edge_types::MENTIONS)
            .collect();
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].from, doc.graph_ref());
        assert_eq!(mentions[0].to, project.graph_ref());
        assert_eq!(mentions[0].confidence, 0.75);
    }

    #[test]
    fn test_unresolved_sender_emits_no_sender_edges() {
        let b = node("b@enron.com", "person", 1.0);
        let doc = document("ghost@enron.com", &["b@enron.com"], &[]);

        let edges = RelationshipSynthesizer::derive_edges(&doc, &resolved(&[b]));
        assert_eq!(count(&edges, edge_types::SENT), 0);
        assert_eq!(count(&edges, edge_types::RECEIVED), 1);
        assert_eq!(count(&edges, edge_types::COMMUNICATES_WITH), 0);
    }

    #[test]
    fn test_extracted_edges_filter_confidence_and_unresolved() {
        let enron = node("organization:enron", "organization", 0.9);
        let ken = node("person:ken lay", "person", 0.9);
        let by_name: HashMap<String, Node> = [
            ("enron".to_string(), enron.clone()),
            ("ken lay".to_string(), ken.clone()),
        ]
        .into_iter()
        .collect();
        let doc = document("a@enron.com", &[], &[]);

        let relation = |source: &str, target: &str, confidence: f64| ExtractedRelation {
            source: source.into(),
            target: target.into(),
            relation_type: "WORKS_FOR".into(),
            properties: Properties::new(),
            confidence,
        };
        let relations = vec![
            relation("Ken Lay", "Enron", 0.7),
            relation("Ken Lay", "Enron", 0.69),
            relation("Ken Lay", "Dynegy", 0.9),
        ];

        let edges = RelationshipSynthesizer::derive_extracted_edges(&doc, &relations, &by_name, 0.7);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from, ken.graph_ref());
        assert_eq!(edges[0].to, enron.graph_ref());
        assert_eq!(edges[0].edge_type, "WORKS_FOR");
    }
}
