use async_trait::async_trait;
use chrono::{DateTime, Utc};
use neo4rs::{query, Graph, Node as BoltNode, Query, Relation};
use std::future::Future;
use uuid::Uuid;

use mailgraph_core::config::AppConfig;
use mailgraph_core::entity::{
    Edge, EmailDocument, GraphRef, NewDocument, NewEdge, NewNode, Node, Properties, RefKind,
    VectorMatch,
};
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::graph::{DocumentStore, GraphStore};

/// Timeout for all Neo4j operations (seconds).
const NEO4J_TIMEOUT_SECS: u64 = 5;

const VECTOR_INDEX: &str = "entity_embedding";

/// Index candidates fetched per requested hit when a search is restricted to one type.
const TYPED_SEARCH_OVERSAMPLE: usize = 20;

pub struct Neo4jGraphStore {
    graph: Option<Graph>,
    embedding_dimension: usize,
}

impl Neo4jGraphStore {
    pub async fn new(config: &AppConfig) -> Self {
        let graph = match Graph::new(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
            .await
        {
            Ok(graph) => {
                tracing::info!(uri = %config.neo4j_uri, "Connected to Neo4j");
                Some(graph)
            }
            Err(e) => {
                tracing::warn!(uri = %config.neo4j_uri, error = %e, "Failed to connect to Neo4j, running in degraded mode");
                None
            }
        };

        Self {
            graph,
            embedding_dimension: config.embedding_dimension,
        }
    }

    fn graph(&self) -> Result<&Graph> {
        self.graph.as_ref().ok_or_else(|| MailgraphError::Graph("Neo4j not connected".into()))
    }

    pub fn is_connected(&self) -> bool {
        self.graph.is_some()
    }

    /// Uniqueness constraints on entity keys and message ids, plus the cosine
    /// vector index used by `vector_search`.
    pub async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT entity_unique_key IF NOT EXISTS \
             FOR (n:Entity) REQUIRE n.unique_key IS UNIQUE"
                .to_string(),
            "CREATE CONSTRAINT email_message_id IF NOT EXISTS \
             FOR (d:Email) REQUIRE d.message_id IS UNIQUE"
                .to_string(),
            format!(
                "CREATE VECTOR INDEX {VECTOR_INDEX} IF NOT EXISTS \
                 FOR (n:Entity) ON (n.embedding) \
                 OPTIONS {{indexConfig: {{`vector.dimensions`: {}, `vector.similarity_function`: 'cosine'}}}}",
                self.embedding_dimension
            ),
        ];

        for statement in statements {
            timed(self.graph()?.run(query(&statement)))
                .await?
                .map_err(|e| MailgraphError::Graph(format!("Failed to apply schema: {}", e)))?;
        }

        tracing::info!(dimension = self.embedding_dimension, "Neo4j schema ensured");
        Ok(())
    }

    async fn fetch_nodes(&self, q: Query, column: &str) -> Result<Vec<Node>> {
        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Failed to query nodes: {}", e)))?;

        let mut nodes = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            let bolt: BoltNode = row
                .get(column)
                .map_err(|e| MailgraphError::Graph(format!("Failed to deserialize node: {}", e)))?;
            match bolt_to_node(&bolt) {
                Ok(node) => nodes.push(node),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed entity node"),
            }
        }
        Ok(nodes)
    }

    async fn count(&self, cypher: &str) -> Result<u64> {
        let mut stream = timed(self.graph()?.execute(query(cypher)))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Failed to count: {}", e)))?;

        match stream.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get("cnt")
                    .map_err(|e| MailgraphError::Graph(format!("Failed to get count: {}", e)))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(MailgraphError::Graph(format!("Error counting: {}", e))),
        }
    }
}

/// Wrap any async operation with a timeout, converting timeout to MailgraphError::Graph.
async fn timed<T, F: Future<Output = T>>(op: F) -> std::result::Result<T, MailgraphError> {
    tokio::time::timeout(std::time::Duration::from_secs(NEO4J_TIMEOUT_SECS), op)
        .await
        .map_err(|_| {
            tracing::warn!("Neo4j operation timed out after {}s", NEO4J_TIMEOUT_SECS);
            MailgraphError::Graph(format!("Neo4j operation timed out after {}s", NEO4J_TIMEOUT_SECS))
        })
}

fn is_constraint_violation(e: &neo4rs::Error) -> bool {
    let message = e.to_string();
    message.contains("ConstraintValidationFailed") || message.contains("already exists with label")
}

/// Relationship types are interpolated into Cypher, so only `[A-Z0-9_]` is accepted.
fn is_valid_rel_type(edge_type: &str) -> bool {
    !edge_type.is_empty()
        && edge_type
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn parse_timestamp(raw: Option<String>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn parse_properties(raw: Option<String>) -> Properties {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| MailgraphError::Graph(format!("Invalid {what} UUID: {}", e)))
}

fn bolt_to_node(bolt: &BoltNode) -> Result<Node> {
    let id_str: String = bolt
        .get("id")
        .map_err(|e| MailgraphError::Graph(format!("Missing id on node: {}", e)))?;
    let unique_key: String = bolt
        .get("unique_key")
        .map_err(|e| MailgraphError::Graph(format!("Missing unique_key on node: {}", e)))?;
    let name: String = bolt
        .get("name")
        .map_err(|e| MailgraphError::Graph(format!("Missing name on node: {}", e)))?;

    let embedding = bolt
        .get::<Vec<f64>>("embedding")
        .ok()
        .map(|v| v.into_iter().map(|x| x as f32).collect());

    Ok(Node {
        id: parse_uuid(&id_str, "node")?,
        unique_key,
        type_category: bolt.get("type_category").unwrap_or_default(),
        name,
        properties: parse_properties(bolt.get("properties").ok()),
        embedding,
        confidence: bolt.get("confidence").unwrap_or(1.0),
        created_at: parse_timestamp(bolt.get("created_at").ok()),
    })
}

fn bolt_to_document(bolt: &BoltNode) -> Result<EmailDocument> {
    let id_str: String = bolt
        .get("id")
        .map_err(|e| MailgraphError::Graph(format!("Missing id on email: {}", e)))?;
    let message_id: String = bolt
        .get("message_id")
        .map_err(|e| MailgraphError::Graph(format!("Missing message_id on email: {}", e)))?;

    Ok(EmailDocument {
        id: parse_uuid(&id_str, "email")?,
        message_id,
        from: bolt.get("from").unwrap_or_default(),
        to: bolt.get("to").unwrap_or_default(),
        cc: bolt.get("cc").unwrap_or_default(),
        bcc: bolt.get("bcc").unwrap_or_default(),
        subject: bolt.get("subject").unwrap_or_default(),
        body: bolt.get("body").unwrap_or_default(),
        timestamp: parse_timestamp(bolt.get("timestamp").ok()),
    })
}

fn endpoint(id: &str, labels: &[String]) -> Result<GraphRef> {
    let kind = labels
        .iter()
        .find_map(|l| RefKind::from_label(l))
        .ok_or_else(|| MailgraphError::Graph(format!("Edge endpoint {id} has no known label")))?;
    Ok(GraphRef {
        kind,
        id: parse_uuid(id, "endpoint")?,
    })
}

#[async_trait]
impl GraphStore for Neo4jGraphStore {
    async fn create_node(&self, input: &NewNode) -> Result<Node> {
        input.validate()?;

        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let properties_json = serde_json::to_string(&input.properties)?;
        let embedding: Vec<f64> = input
            .embedding
            .as_ref()
            .map(|v| v.iter().map(|x| *x as f64).collect())
            .unwrap_or_default();

        let q = query(
            "CREATE (n:Entity {id: $id, unique_key: $unique_key, type_category: $type_category, \
               name: $name, properties: $properties, confidence: $confidence, created_at: $created_at}) \
             SET n.embedding = CASE WHEN size($embedding) = 0 THEN null ELSE $embedding END",
        )
        .param("id", id.to_string())
        .param("unique_key", input.unique_key.clone())
        .param("type_category", input.type_category.clone())
        .param("name", input.name.clone())
        .param("properties", properties_json)
        .param("confidence", input.confidence)
        .param("created_at", created_at.to_rfc3339())
        .param("embedding", embedding);

        match timed(self.graph()?.run(q)).await? {
            Ok(()) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(MailgraphError::DuplicateKey(input.unique_key.clone()));
            }
            Err(e) => {
                return Err(MailgraphError::Graph(format!(
                    "Failed to store node {}: {}",
                    input.unique_key, e
                )));
            }
        }

        tracing::debug!(
            node_id = %id,
            key = %input.unique_key,
            type_category = %input.type_category,
            "Stored node"
        );

        Ok(input.clone().into_node(id, created_at))
    }

    async fn find_node_by_key(&self, key: &str) -> Result<Option<Node>> {
        let q = query("MATCH (n:Entity {unique_key: $key}) RETURN n").param("key", key.to_string());
        Ok(self.fetch_nodes(q, "n").await?.into_iter().next())
    }

    async fn find_node_by_id(&self, id: Uuid) -> Result<Option<Node>> {
        let q = query("MATCH (n:Entity {id: $id}) RETURN n").param("id", id.to_string());
        Ok(self.fetch_nodes(q, "n").await?.into_iter().next())
    }

    async fn find_nodes_by_name(&self, type_category: &str, name: &str) -> Result<Vec<Node>> {
        let q = query(
            "MATCH (n:Entity {type_category: $type_category}) \
             WHERE toLower(trim(n.name)) = $name RETURN n",
        )
        .param("type_category", type_category.to_string())
        .param("name", name.trim().to_lowercase());
        self.fetch_nodes(q, "n").await
    }

    async fn create_edge(&self, input: &NewEdge) -> Result<Edge> {
        input.validate()?;
        if !is_valid_rel_type(&input.edge_type) {
            return Err(MailgraphError::Validation(format!(
                "edge type {:?} is not a valid relationship type",
                input.edge_type
            )));
        }

        let id = Uuid::new_v4();
        let properties_json = serde_json::to_string(&input.properties)?;
        let cypher = format!(
            "MATCH (a:{from_label} {{id: $from_id}}) \
             MATCH (b:{to_label} {{id: $to_id}}) \
             CREATE (a)-[r:{rel} {{id: $id, confidence: $confidence, timestamp: $timestamp, \
               properties: $properties}}]->(b) \
             RETURN r.id AS id",
            from_label = input.from.kind.label(),
            to_label = input.to.kind.label(),
            rel = input.edge_type,
        );

        let q = query(&cypher)
            .param("from_id", input.from.id.to_string())
            .param("to_id", input.to.id.to_string())
            .param("id", id.to_string())
            .param("confidence", input.confidence)
            .param("timestamp", input.timestamp.to_rfc3339())
            .param("properties", properties_json);

        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Failed to store edge: {}", e)))?;

        match stream.next().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(MailgraphError::NotFound(format!(
                    "edge endpoints {} -> {}",
                    input.from, input.to
                )));
            }
            Err(e) => return Err(MailgraphError::Graph(format!("Failed to store edge: {}", e))),
        }

        tracing::debug!(
            edge_id = %id,
            from = %input.from,
            to = %input.to,
            edge_type = %input.edge_type,
            "Stored edge"
        );

        Ok(input.clone().into_edge(id))
    }

    async fn find_edges_touching(
        &self,
        node: GraphRef,
        edge_types: Option<&[String]>,
    ) -> Result<Vec<Edge>> {
        let cypher = format!(
            "MATCH (n:{label} {{id: $id}})-[r]-(m) \
             WHERE size($types) = 0 OR type(r) IN $types \
             RETURN DISTINCT r, type(r) AS rel_type, \
                    startNode(r).id AS from_id, labels(startNode(r)) AS from_labels, \
                    endNode(r).id AS to_id, labels(endNode(r)) AS to_labels",
            label = node.kind.label()
        );
        let q = query(&cypher)
            .param("id", node.id.to_string())
            .param("types", edge_types.map(|t| t.to_vec()).unwrap_or_default());

        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Failed to fetch edges: {}", e)))?;

        let mut edges = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            let parsed = (|| -> Result<Edge> {
                let rel: Relation = row
                    .get("r")
                    .map_err(|e| MailgraphError::Graph(format!("Failed to parse relation: {}", e)))?;
                let edge_type: String = row
                    .get("rel_type")
                    .map_err(|e| MailgraphError::Graph(format!("Missing relation type: {}", e)))?;
                let from_id: String = row.get("from_id").unwrap_or_default();
                let to_id: String = row.get("to_id").unwrap_or_default();
                let from_labels: Vec<String> = row.get("from_labels").unwrap_or_default();
                let to_labels: Vec<String> = row.get("to_labels").unwrap_or_default();
                let id: String = rel
                    .get("id")
                    .map_err(|e| MailgraphError::Graph(format!("Missing id on relation: {}", e)))?;

                Ok(Edge {
                    id: parse_uuid(&id, "edge")?,
                    edge_type,
                    from: endpoint(&from_id, &from_labels)?,
                    to: endpoint(&to_id, &to_labels)?,
                    confidence: rel.get("confidence").unwrap_or(1.0),
                    timestamp: parse_timestamp(rel.get("timestamp").ok()),
                    properties: parse_properties(rel.get("properties").ok()),
                })
            })();

            match parsed {
                Ok(edge) => edges.push(edge),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed relationship"),
            }
        }

        tracing::debug!(node = %node, edges = edges.len(), "Fetched touching edges");
        Ok(edges)
    }

    async fn vector_search(
        &self,
        vector: &[f32],
        type_category: Option<&str>,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        // queryNodes cannot pre-filter, so a typed search oversamples the
        // index and applies the type predicate before the limit.
        let (k, q) = match type_category {
            Some(type_category) => (
                top_k.saturating_mul(TYPED_SEARCH_OVERSAMPLE),
                query(&format!(
                    "CALL db.index.vector.queryNodes('{VECTOR_INDEX}', $k, $vector) \
                     YIELD node, score WHERE node.type_category = $type_category \
                     RETURN node, score ORDER BY score DESC LIMIT $limit"
                ))
                .param("type_category", type_category.to_string())
                .param("limit", top_k as i64),
            ),
            None => (
                top_k,
                query(&format!(
                    "CALL db.index.vector.queryNodes('{VECTOR_INDEX}', $k, $vector) \
                     YIELD node, score RETURN node, score ORDER BY score DESC"
                )),
            ),
        };
        let q = q
            .param("k", k as i64)
            .param("vector", vector.iter().map(|x| *x as f64).collect::<Vec<f64>>());

        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Vector search failed: {}", e)))?;

        let mut matches = Vec::new();
        while let Ok(Some(row)) = stream.next().await {
            let bolt: BoltNode = match row.get("node") {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse vector search node");
                    continue;
                }
            };
            // Neo4j reports cosine as (1 + cos) / 2.
            let score: f64 = row.get("score").unwrap_or(0.0);
            let cosine = 2.0 * score - 1.0;
            match bolt_to_node(&bolt) {
                Ok(node) => matches.push(VectorMatch {
                    node,
                    distance: 1.0 - cosine,
                }),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed vector search node"),
            }
        }

        Ok(matches)
    }

    async fn node_count(&self) -> Result<u64> {
        self.count("MATCH (n:Entity) RETURN count(n) AS cnt").await
    }

    async fn edge_count(&self) -> Result<u64> {
        self.count("MATCH ()-[r]->() RETURN count(r) AS cnt").await
    }
}

#[async_trait]
impl DocumentStore for Neo4jGraphStore {
    async fn create_document(&self, input: &NewDocument) -> Result<EmailDocument> {
        input.validate()?;

        let id = Uuid::new_v4();
        let q = query(
            "CREATE (d:Email {id: $id, message_id: $message_id, from: $from, to: $to, cc: $cc, \
               bcc: $bcc, subject: $subject, body: $body, timestamp: $timestamp})",
        )
        .param("id", id.to_string())
        .param("message_id", input.message_id.clone())
        .param("from", input.from.clone())
        .param("to", input.to.clone())
        .param("cc", input.cc.clone())
        .param("bcc", input.bcc.clone())
        .param("subject", input.subject.clone())
        .param("body", input.body.clone())
        .param("timestamp", input.timestamp.to_rfc3339());

        match timed(self.graph()?.run(q)).await? {
            Ok(()) => {}
            Err(e) if is_constraint_violation(&e) => {
                return Err(MailgraphError::DuplicateKey(input.message_id.clone()));
            }
            Err(e) => {
                return Err(MailgraphError::Graph(format!(
                    "Failed to store email {}: {}",
                    input.message_id, e
                )));
            }
        }

        Ok(input.clone().into_document(id))
    }

    async fn find_document_by_key(&self, message_id: &str) -> Result<Option<EmailDocument>> {
        let q = query("MATCH (d:Email {message_id: $message_id}) RETURN d")
            .param("message_id", message_id.to_string());

        let mut stream = timed(self.graph()?.execute(q))
            .await?
            .map_err(|e| MailgraphError::Graph(format!("Failed to query email: {}", e)))?;

        match stream.next().await {
            Ok(Some(row)) => {
                let bolt: BoltNode = row
                    .get("d")
                    .map_err(|e| MailgraphError::Graph(format!("Failed to deserialize email: {}", e)))?;
                Ok(Some(bolt_to_document(&bolt)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(MailgraphError::Graph(format!("Error fetching email: {}", e))),
        }
    }
}
