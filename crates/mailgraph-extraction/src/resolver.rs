use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use mailgraph_core::config::ResolverConfig;
use mailgraph_core::entity::{NewNode, Node, Properties, PERSON_TYPE};
use mailgraph_core::error::{MailgraphError, Result};
use mailgraph_core::graph::GraphStore;
use mailgraph_core::llm::LanguageModelClient;
use mailgraph_graph::GraphTraversal;

use crate::email::Mailbox;

const EMAIL_PROPERTY: &str = "email";

/// Legal-entity suffixes stripped by [`normalize_org_name`], checked in order.
const ORG_SUFFIXES: &[&str] = &[
    "inc",
    "inc.",
    "corp",
    "corp.",
    "corporation",
    "llc",
    "l.l.c.",
    "ltd",
    "ltd.",
];

/// Identity key for a mention. People are keyed by email address when one is
/// known; everything else by type and name.
pub fn canonical_key(type_category: &str, name: &str, properties: &Properties) -> String {
    if type_category == PERSON_TYPE {
        let email = properties
            .get(EMAIL_PROPERTY)
            .and_then(|v| v.as_str())
            .map(|e| e.trim())
            .filter(|e| !e.is_empty());
        if let Some(email) = email {
            return email.to_lowercase();
        }
        return format!("{PERSON_TYPE}:{}", name.trim().to_lowercase());
    }
    format!("{type_category}:{}", name.trim().to_lowercase())
}

/// Lowercased, whitespace-collapsed organization name with at most one
/// trailing legal suffix removed.
pub fn normalize_org_name(name: &str) -> String {
    let collapsed = name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    for suffix in ORG_SUFFIXES {
        if collapsed == *suffix {
            continue;
        }
        if let Some(stripped) = collapsed.strip_suffix(suffix) {
            if stripped.ends_with(' ') || stripped.ends_with(',') {
                return stripped.trim_end_matches([' ', ',']).to_string();
            }
        }
    }
    collapsed
}

/// A raw mention awaiting resolution.
#[derive(Debug, Clone)]
pub struct EntityCandidate {
    pub type_category: String,
    pub name: String,
    pub properties: Properties,
    pub confidence: f64,
}

impl EntityCandidate {
    pub fn new(type_category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            type_category: type_category.into(),
            name: name.into(),
            properties: Properties::new(),
            confidence: 1.0,
        }
    }

    /// A person node taken from an address header.
    pub fn from_mailbox(mailbox: &Mailbox) -> Option<Self> {
        let name = mailbox.display_name()?;
        let mut candidate = Self::new(PERSON_TYPE, name);
        if let Some(address) = &mailbox.address {
            candidate
                .properties
                .insert(EMAIL_PROPERTY.to_string(), address.trim().to_lowercase().into());
        }
        Some(candidate)
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn canonical_key(&self) -> String {
        canonical_key(&self.type_category, &self.name, &self.properties)
    }
}

/// Per-type hook applied to a node just before it is created.
pub trait EntityConstructor: Send + Sync {
    fn prepare(&self, node: &mut NewNode);
}

/// Records the suffix-stripped name so organizations can be compared for display.
pub struct OrganizationConstructor;

impl EntityConstructor for OrganizationConstructor {
    fn prepare(&self, node: &mut NewNode) {
        node.properties.insert(
            "normalized_name".to_string(),
            normalize_org_name(&node.name).into(),
        );
    }
}

/// Type category → constructor, assembled at startup and handed to the resolver.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    constructors: HashMap<String, Arc<dyn EntityConstructor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("organization", Arc::new(OrganizationConstructor));
        registry
    }

    pub fn register(&mut self, type_category: &str, constructor: Arc<dyn EntityConstructor>) {
        self.constructors.insert(type_category.to_string(), constructor);
    }

    pub fn get(&self, type_category: &str) -> Option<&Arc<dyn EntityConstructor>> {
        self.constructors.get(type_category)
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub node: Node,
    /// True only when this call created the node.
    pub created: bool,
}

/// Turns candidates into graph nodes, reusing existing nodes by canonical key
/// (or by embedding similarity for fuzzy types).
pub struct EntityResolver {
    graph: Arc<dyn GraphStore>,
    llm: Arc<dyn LanguageModelClient>,
    traversal: GraphTraversal,
    registry: TypeRegistry,
    config: ResolverConfig,
}

impl EntityResolver {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        llm: Arc<dyn LanguageModelClient>,
        registry: TypeRegistry,
        config: ResolverConfig,
    ) -> Self {
        Self {
            traversal: GraphTraversal::new(graph.clone()),
            graph,
            llm,
            registry,
            config,
        }
    }

    pub async fn resolve(&self, candidate: EntityCandidate) -> Result<Resolution> {
        let key = candidate.canonical_key();

        if let Some(node) = self.graph.find_node_by_key(&key).await? {
            // Existing nodes are never updated in place.
            if candidate.confidence > node.confidence {
                debug!(
                    key = %key,
                    existing = node.confidence,
                    incoming = candidate.confidence,
                    "Ignoring higher-confidence update for existing node"
                );
            }
            return Ok(Resolution {
                node,
                created: false,
            });
        }

        let mut embedding = None;
        if self.config.is_fuzzy(&candidate.type_category) {
            let (vector, embedded) = self.embed_or_zero(&candidate.name).await;
            if let Some(node) = self.fuzzy_match(&candidate, &vector, embedded).await? {
                return Ok(Resolution {
                    node,
                    created: false,
                });
            }
            embedding = Some(vector);
        }

        let embedding = match embedding {
            Some(v) => v,
            None => self.embed_or_zero(&candidate.name).await.0,
        };

        let mut input = NewNode {
            unique_key: key.clone(),
            type_category: candidate.type_category,
            name: candidate.name.trim().to_string(),
            properties: candidate.properties,
            embedding: Some(embedding),
            confidence: candidate.confidence,
        };
        if let Some(constructor) = self.registry.get(&input.type_category) {
            constructor.prepare(&mut input);
        }

        match self.graph.create_node(&input).await {
            Ok(node) => Ok(Resolution {
                node,
                created: true,
            }),
            Err(e) if e.is_duplicate_key() => {
                debug!(key = %key, "Lost creation race, re-fetching existing node");
                let node = self.graph.find_node_by_key(&key).await?.ok_or_else(|| {
                    MailgraphError::Graph(format!("node {key} reported duplicate but not found"))
                })?;
                Ok(Resolution {
                    node,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Embedding for `text`, or a zero vector when the model call fails. The
    /// flag is false for the zero-vector substitute.
    async fn embed_or_zero(&self, text: &str) -> (Vec<f32>, bool) {
        match self.llm.embed(text).await {
            Ok(vector) => (vector, true),
            Err(e) => {
                warn!(text = %text, error = %e, "Embedding failed, substituting zero vector");
                (vec![0.0; self.llm.embedding_dimension()], false)
            }
        }
    }

    async fn fuzzy_match(
        &self,
        candidate: &EntityCandidate,
        vector: &[f32],
        embedded: bool,
    ) -> Result<Option<Node>> {
        if embedded {
            match self
                .traversal
                .scored_similarity_search(
                    vector,
                    Some(&candidate.type_category),
                    self.config.fuzzy_candidates,
                    Some(self.config.similarity_threshold),
                )
                .await
            {
                Ok(hits) => {
                    let hit = hits
                        .into_iter()
                        .find(|(_, similarity)| *similarity >= self.config.similarity_threshold);
                    if let Some((node, similarity)) = &hit {
                        debug!(
                            name = %candidate.name,
                            matched = %node.unique_key,
                            similarity = similarity,
                            "Fuzzy-matched existing node"
                        );
                    }
                    return Ok(hit.map(|(node, _)| node));
                }
                Err(e) => {
                    warn!(error = %e, "Similarity search unavailable, falling back to exact name match");
                }
            }
        }

        let matches = self
            .graph
            .find_nodes_by_name(&candidate.type_category, &candidate.name)
            .await?;
        Ok(matches.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mailgraph_graph::InMemoryGraphStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        calls: AtomicUsize,
    }

    impl FixedEmbedder {
        fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModelClient for FixedEmbedder {
        async fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Err(MailgraphError::LanguageModel("not scripted".into()))
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.vectors
                .get(text)
                .cloned()
                .ok_or_else(|| MailgraphError::LanguageModel(format!("no vector for {text}")))
        }

        fn embedding_dimension(&self) -> usize {
            2
        }
    }

    fn resolver(store: Arc<InMemoryGraphStore>, embedder: Arc<FixedEmbedder>) -> EntityResolver {
        EntityResolver::new(store, embedder, TypeRegistry::with_defaults(), ResolverConfig::default())
    }

    fn person(name: &str, email: &str) -> EntityCandidate {
        let mut props = Properties::new();
        props.insert("email".into(), email.into());
        EntityCandidate::new("person", name).with_properties(props)
    }

    #[test]
    fn test_canonical_key_person_by_email() {
        let keys: Vec<String> = ["Alice@Enron.com", "alice@enron.com", " alice@enron.com "]
            .iter()
            .map(|e| person("Alice", e).canonical_key())
            .collect();
        assert!(keys.iter().all(|k| k == "alice@enron.com"));
    }

    #[test]
    fn test_canonical_key_fallbacks() {
        assert_eq!(EntityCandidate::new("person", " Jeff Skilling ").canonical_key(), "person:jeff skilling");
        assert_eq!(person("Jeff", "  ").canonical_key(), "person:jeff");
        assert_eq!(EntityCandidate::new("project", "Raptor").canonical_key(), "project:raptor");
    }

    #[test]
    fn test_normalize_org_name() {
        assert_eq!(normalize_org_name("Enron Inc."), "enron");
        assert_eq!(normalize_org_name("Enron Inc"), "enron");
        assert_eq!(normalize_org_name("Enron"), "enron");
        assert_eq!(normalize_org_name("Big   Corp"), "big");
        assert_eq!(normalize_org_name("Acme, L.L.C."), "acme");
        assert_eq!(normalize_org_name("Dynegy Corporation"), "dynegy");
        // Only one suffix is removed.
        assert_eq!(normalize_org_name("Foo Corp Inc"), "foo corp");
        // A bare suffix is left alone.
        assert_eq!(normalize_org_name("LLC"), "llc");
        assert_eq!(normalize_org_name("Zinc"), "zinc");
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(FixedEmbedder::new(&[]));
        let resolver = resolver(store.clone(), embedder);

        let first = resolver.resolve(person("Alice", "Alice@Enron.com")).await.unwrap();
        let second = resolver.resolve(person("A. Smith", " alice@enron.com ")).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.node.id, second.node.id);
        assert_eq!(store.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_uses_zero_vector() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(FixedEmbedder::new(&[]));
        let resolver = resolver(store, embedder);

        let resolved = resolver.resolve(EntityCandidate::new("project", "Raptor")).await.unwrap();
        assert_eq!(resolved.node.embedding, Some(vec![0.0, 0.0]));
    }

    #[tokio::test]
    async fn test_organization_constructor_applied() {
        let store = Arc::new(InMemoryGraphStore::new());
        let resolver = resolver(store, Arc::new(FixedEmbedder::new(&[])));

        let resolved = resolver
            .resolve(EntityCandidate::new("organization", "Enron Corp."))
            .await
            .unwrap();
        assert_eq!(
            resolved.node.properties.get("normalized_name").and_then(|v| v.as_str()),
            Some("enron")
        );
    }

    #[tokio::test]
    async fn test_fuzzy_match_for_concepts() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(FixedEmbedder::new(&[
            ("energy trading", vec![1.0, 0.0]),
            ("power trading", vec![0.95, 0.05]),
            ("litigation", vec![0.0, 1.0]),
        ]));
        let resolver = resolver(store.clone(), embedder);

        let original = resolver
            .resolve(EntityCandidate::new("concept", "energy trading"))
            .await
            .unwrap();
        let similar = resolver
            .resolve(EntityCandidate::new("concept", "power trading"))
            .await
            .unwrap();
        let different = resolver
            .resolve(EntityCandidate::new("concept", "litigation"))
            .await
            .unwrap();

        assert!(original.created);
        assert!(!similar.created);
        assert_eq!(similar.node.id, original.node.id);
        assert!(different.created);
        assert_eq!(store.node_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fuzzy_ignores_other_types() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embedder = Arc::new(FixedEmbedder::new(&[("enron", vec![1.0, 0.0])]));
        let resolver = resolver(store.clone(), embedder);

        resolver.resolve(EntityCandidate::new("organization", "enron")).await.unwrap();
        let concept = resolver.resolve(EntityCandidate::new("concept", "enron")).await.unwrap();
        assert!(concept.created);
    }

    #[tokio::test]
    async fn test_fuzzy_match_not_crowded_out_by_other_types() {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut pairs: Vec<(&str, Vec<f32>)> = vec![
            ("energy trading", vec![1.0, 0.0]),
            ("power trading", vec![0.95, 0.05]),
        ];
        let orgs = ["Org A", "Org B", "Org C", "Org D", "Org E", "Org F"];
        pairs.extend(orgs.iter().map(|name| (*name, vec![0.95, 0.05])));
        let resolver = resolver(store.clone(), Arc::new(FixedEmbedder::new(&pairs)));

        let original = resolver
            .resolve(EntityCandidate::new("concept", "energy trading"))
            .await
            .unwrap();
        for name in orgs {
            resolver.resolve(EntityCandidate::new("organization", name)).await.unwrap();
        }
        let similar = resolver
            .resolve(EntityCandidate::new("concept", "power trading"))
            .await
            .unwrap();

        assert!(!similar.created);
        assert_eq!(similar.node.id, original.node.id);
        assert_eq!(store.node_count().await.unwrap(), 7);
    }

    /// Store whose vector index is down; everything else delegates.
    struct NoVectorIndex(InMemoryGraphStore);

    #[async_trait]
    impl GraphStore for NoVectorIndex {
        async fn create_node(&self, input: &NewNode) -> Result<Node> {
            self.0.create_node(input).await
        }
        async fn find_node_by_key(&self, key: &str) -> Result<Option<Node>> {
            self.0.find_node_by_key(key).await
        }
        async fn find_node_by_id(&self, id: uuid::Uuid) -> Result<Option<Node>> {
            self.0.find_node_by_id(id).await
        }
        async fn find_nodes_by_name(&self, type_category: &str, name: &str) -> Result<Vec<Node>> {
            self.0.find_nodes_by_name(type_category, name).await
        }
        async fn create_edge(
            &self,
            input: &mailgraph_core::entity::NewEdge,
        ) -> Result<mailgraph_core::entity::Edge> {
            self.0.create_edge(input).await
        }
        async fn find_edges_touching(
            &self,
            node: mailgraph_core::entity::GraphRef,
            edge_types: Option<&[String]>,
        ) -> Result<Vec<mailgraph_core::entity::Edge>> {
            self.0.find_edges_touching(node, edge_types).await
        }
        async fn vector_search(
            &self,
            _vector: &[f32],
            _type_category: Option<&str>,
            _top_k: usize,
        ) -> Result<Vec<mailgraph_core::entity::VectorMatch>> {
            Err(MailgraphError::Graph("vector index unavailable".into()))
        }
        async fn node_count(&self) -> Result<u64> {
            self.0.node_count().await
        }
        async fn edge_count(&self) -> Result<u64> {
            self.0.edge_count().await
        }
    }

    /// A concept stored under a key the resolver would not derive, so only a
    /// name lookup can find it.
    async fn legacy_concept(store: &dyn GraphStore, name: &str) -> Node {
        store
            .create_node(&NewNode {
                unique_key: "concept:legacy-1".into(),
                type_category: "concept".into(),
                name: name.into(),
                properties: Properties::new(),
                embedding: Some(vec![1.0, 0.0]),
                confidence: 0.9,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exact_name_fallback_without_vector_index() {
        let store = Arc::new(NoVectorIndex(InMemoryGraphStore::new()));
        let existing = legacy_concept(store.as_ref(), "Energy Trading").await;
        let embedder = Arc::new(FixedEmbedder::new(&[
            ("  energy TRADING ", vec![1.0, 0.0]),
            ("gas trading", vec![1.0, 0.0]),
        ]));
        let resolver = EntityResolver::new(
            store.clone(),
            embedder,
            TypeRegistry::with_defaults(),
            ResolverConfig::default(),
        );

        let same = resolver
            .resolve(EntityCandidate::new("concept", "  energy TRADING "))
            .await
            .unwrap();
        assert!(!same.created);
        assert_eq!(same.node.id, existing.id);

        // Without the index, an identical embedding is not enough.
        let other = resolver
            .resolve(EntityCandidate::new("concept", "gas trading"))
            .await
            .unwrap();
        assert!(other.created);
        assert_eq!(store.node_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_exact_name_fallback_when_embedding_fails() {
        let store = Arc::new(InMemoryGraphStore::new());
        let existing = legacy_concept(store.as_ref(), "Energy Trading").await;
        let embedder = Arc::new(FixedEmbedder::new(&[]));
        let resolver = resolver(store.clone(), embedder.clone());

        let same = resolver
            .resolve(EntityCandidate::new("concept", "ENERGY trading "))
            .await
            .unwrap();

        assert!(!same.created);
        assert_eq!(same.node.id, existing.id);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.node_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_resolution_creates_one_node() {
        let store = Arc::new(InMemoryGraphStore::new());
        let resolver = Arc::new(resolver(store.clone(), Arc::new(FixedEmbedder::new(&[]))));

        let mut handles = Vec::new();
        for i in 0..16 {
            let resolver = resolver.clone();
            let email = if i % 2 == 0 { "Bob@Enron.com" } else { "bob@enron.com " };
            handles.push(tokio::spawn(async move {
                resolver.resolve(person("Bob", email)).await.unwrap()
            }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for handle in handles {
            let resolution = handle.await.unwrap();
            if resolution.created {
                created += 1;
            }
            ids.push(resolution.node.id);
        }

        assert_eq!(created, 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.node_count().await.unwrap(), 1);
    }
}
