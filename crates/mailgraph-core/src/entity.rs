use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MailgraphError, Result};

/// Open-schema property bag stored on nodes and edges.
pub type Properties = serde_json::Map<String, serde_json::Value>;

pub const PERSON_TYPE: &str = "person";

/// A resolved, deduplicated graph vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub unique_key: String,
    pub type_category: String,
    pub name: String,
    pub properties: Properties,
    pub embedding: Option<Vec<f32>>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Node {
    pub fn graph_ref(&self) -> GraphRef {
        GraphRef::entity(self.id)
    }

    pub fn is_person(&self) -> bool {
        self.type_category == PERSON_TYPE
    }
}

/// Caller-supplied fields for a node; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    pub unique_key: String,
    pub type_category: String,
    pub name: String,
    pub properties: Properties,
    pub embedding: Option<Vec<f32>>,
    pub confidence: f64,
}

impl NewNode {
    pub fn validate(&self) -> Result<()> {
        if self.unique_key.trim().is_empty() {
            return Err(MailgraphError::Validation("node unique_key is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(MailgraphError::Validation(format!(
                "node {} has an empty name",
                self.unique_key
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(MailgraphError::Validation(format!(
                "node {} confidence {} outside [0, 1]",
                self.unique_key, self.confidence
            )));
        }
        Ok(())
    }

    pub fn into_node(self, id: Uuid, created_at: DateTime<Utc>) -> Node {
        Node {
            id,
            unique_key: self.unique_key,
            type_category: self.type_category,
            name: self.name,
            properties: self.properties,
            embedding: self.embedding,
            confidence: self.confidence,
            created_at,
        }
    }
}

/// An ingested email. Created once per `message_id` and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailDocument {
    pub id: Uuid,
    pub message_id: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl EmailDocument {
    pub fn graph_ref(&self) -> GraphRef {
        GraphRef::document(self.id)
    }

    /// To, Cc and Bcc in that order, blanks dropped.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub message_id: String,
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl NewDocument {
    pub fn validate(&self) -> Result<()> {
        if self.message_id.trim().is_empty() {
            return Err(MailgraphError::Validation("document message_id is empty".into()));
        }
        Ok(())
    }

    pub fn into_document(self, id: Uuid) -> EmailDocument {
        EmailDocument {
            id,
            message_id: self.message_id,
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            body: self.body,
            timestamp: self.timestamp,
        }
    }
}

/// Which table an edge endpoint lives in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Entity,
    Document,
}

impl RefKind {
    pub fn label(&self) -> &'static str {
        match self {
            RefKind::Entity => "Entity",
            RefKind::Document => "Email",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Entity" => Some(RefKind::Entity),
            "Email" => Some(RefKind::Document),
            _ => None,
        }
    }
}

/// Tagged reference to either endpoint kind of an edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GraphRef {
    pub kind: RefKind,
    pub id: Uuid,
}

impl GraphRef {
    pub fn entity(id: Uuid) -> Self {
        Self {
            kind: RefKind::Entity,
            id,
        }
    }

    pub fn document(id: Uuid) -> Self {
        Self {
            kind: RefKind::Document,
            id,
        }
    }
}

impl fmt::Display for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.label(), self.id)
    }
}

pub mod edge_types {
    pub const SENT: &str = "SENT";
    pub const RECEIVED: &str = "RECEIVED";
    pub const MENTIONS: &str = "MENTIONS";
    pub const COMMUNICATES_WITH: &str = "COMMUNICATES_WITH";
}

/// A directed, typed, confidence-scored connection. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub edge_type: String,
    pub from: GraphRef,
    pub to: GraphRef,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub properties: Properties,
}

impl Edge {
    /// The endpoint opposite `node`, or `None` if the edge doesn't touch it.
    pub fn other_end(&self, node: &GraphRef) -> Option<GraphRef> {
        if self.from == *node {
            Some(self.to)
        } else if self.to == *node {
            Some(self.from)
        } else {
            None
        }
    }

    pub fn touches(&self, node: &GraphRef) -> bool {
        self.from == *node || self.to == *node
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEdge {
    pub edge_type: String,
    pub from: GraphRef,
    pub to: GraphRef,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub properties: Properties,
}

impl NewEdge {
    pub fn new(edge_type: impl Into<String>, from: GraphRef, to: GraphRef) -> Self {
        Self {
            edge_type: edge_type.into(),
            from,
            to,
            confidence: 1.0,
            timestamp: Utc::now(),
            properties: Properties::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.edge_type.trim().is_empty() {
            return Err(MailgraphError::Validation("edge type is empty".into()));
        }
        Ok(())
    }

    pub fn into_edge(self, id: Uuid) -> Edge {
        Edge {
            id,
            edge_type: self.edge_type,
            from: self.from,
            to: self.to,
            confidence: self.confidence,
            timestamp: self.timestamp,
            properties: self.properties,
        }
    }
}

/// Result row of a store-side vector query. `distance` is `1 - cosine`.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub node: Node,
    pub distance: f64,
}

impl VectorMatch {
    pub fn similarity(&self) -> f64 {
        1.0 - self.distance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document() -> EmailDocument {
        NewDocument {
            message_id: "<1@enron.com>".into(),
            from: "alice@enron.com".into(),
            to: vec!["bob@enron.com".into(), "  ".into()],
            cc: vec!["carol@enron.com".into()],
            bcc: vec![],
            subject: "Q3".into(),
            body: String::new(),
            timestamp: Utc::now(),
        }
        .into_document(Uuid::new_v4())
    }

    #[test]
    fn test_recipients_skip_blanks_and_keep_order() {
        let doc = document();
        let recipients: Vec<&str> = doc.recipients().collect();
        assert_eq!(recipients, vec!["bob@enron.com", "carol@enron.com"]);
    }

    #[test]
    fn test_other_end() {
        let a = GraphRef::entity(Uuid::new_v4());
        let d = GraphRef::document(Uuid::new_v4());
        let edge = NewEdge::new(edge_types::SENT, a, d).into_edge(Uuid::new_v4());
        assert_eq!(edge.other_end(&a), Some(d));
        assert_eq!(edge.other_end(&d), Some(a));
        assert_eq!(edge.other_end(&GraphRef::entity(Uuid::new_v4())), None);
    }

    #[test]
    fn test_node_validation() {
        let mut node = NewNode {
            unique_key: "concept:energy".into(),
            type_category: "concept".into(),
            name: "Energy".into(),
            properties: Properties::new(),
            embedding: None,
            confidence: 0.8,
        };
        assert!(node.validate().is_ok());
        node.confidence = 1.5;
        assert!(matches!(node.validate(), Err(MailgraphError::Validation(_))));
        node.confidence = 0.8;
        node.name = "  ".into();
        assert!(node.validate().is_err());
    }

    #[test]
    fn test_document_requires_message_id() {
        let mut doc = NewDocument {
            message_id: " ".into(),
            from: "a@b.c".into(),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: String::new(),
            body: String::new(),
            timestamp: Utc::now(),
        };
        assert!(doc.validate().is_err());
        doc.message_id = "<x>".into();
        assert!(doc.validate().is_ok());
    }
}
