use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use mailgraph_core::entity::{Edge, GraphRef, Node, RefKind};
use mailgraph_core::error::Result;
use mailgraph_core::graph::GraphStore;

/// Paths longer than this many hops are reported as unreachable.
pub const MAX_PATH_DEPTH: usize = 10;

/// Read-side queries over the persisted node/edge set. Holds no state between
/// calls; every query keeps its own visited set.
#[derive(Clone)]
pub struct GraphTraversal {
    store: Arc<dyn GraphStore>,
}

/// One BFS arena slot: the node reached, the slot it was reached from and the
/// edge crossed to get here.
struct PathStep {
    node: GraphRef,
    parent: Option<usize>,
    edge: Option<Edge>,
    depth: usize,
}

impl GraphTraversal {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Entities within `max_depth` hops of `source`, in discovery order.
    /// Documents are walked through but never returned.
    pub async fn expand(
        &self,
        source: Uuid,
        edge_types: Option<&[String]>,
        max_depth: usize,
    ) -> Result<Vec<Node>> {
        let root = GraphRef::entity(source);
        let mut visited: HashSet<GraphRef> = HashSet::from([root]);
        let mut frontier = vec![root];
        let mut results = Vec::new();

        for depth in 0..max_depth {
            if frontier.is_empty() {
                break;
            }

            let mut next = Vec::new();
            for current in &frontier {
                for edge in self.store.find_edges_touching(*current, edge_types).await? {
                    let Some(neighbor) = edge.other_end(current) else {
                        continue;
                    };
                    if !visited.insert(neighbor) {
                        continue;
                    }
                    if neighbor.kind == RefKind::Entity {
                        match self.store.find_node_by_id(neighbor.id).await? {
                            Some(node) => results.push(node),
                            None => debug!(node = %neighbor, "Edge points at a missing node"),
                        }
                    }
                    next.push(neighbor);
                }
            }

            debug!(depth = depth + 1, frontier = next.len(), found = results.len(), "Expanded level");
            frontier = next;
        }

        Ok(results)
    }

    /// Fewest-hop edge sequence from `from` to `to`. `Some(vec![])` when the
    /// endpoints coincide, `None` when no path exists within `MAX_PATH_DEPTH`.
    pub async fn shortest_path(&self, from: Uuid, to: Uuid) -> Result<Option<Vec<Edge>>> {
        if from == to {
            return Ok(Some(Vec::new()));
        }

        let root = GraphRef::entity(from);
        let mut arena = vec![PathStep {
            node: root,
            parent: None,
            edge: None,
            depth: 0,
        }];
        let mut queue = VecDeque::from([0usize]);
        let mut visited: HashSet<GraphRef> = HashSet::from([root]);

        while let Some(index) = queue.pop_front() {
            let (current, depth) = (arena[index].node, arena[index].depth);
            if depth >= MAX_PATH_DEPTH {
                continue;
            }

            for edge in self.store.find_edges_touching(current, None).await? {
                let Some(neighbor) = edge.other_end(&current) else {
                    continue;
                };

                if neighbor.id == to {
                    let mut path = vec![edge];
                    let mut cursor = Some(index);
                    while let Some(i) = cursor {
                        if let Some(e) = arena[i].edge.clone() {
                            path.push(e);
                        }
                        cursor = arena[i].parent;
                    }
                    path.reverse();
                    debug!(%from, %to, hops = path.len(), "Found shortest path");
                    return Ok(Some(path));
                }

                if visited.insert(neighbor) {
                    arena.push(PathStep {
                        node: neighbor,
                        parent: Some(index),
                        edge: Some(edge),
                        depth: depth + 1,
                    });
                    queue.push_back(arena.len() - 1);
                }
            }
        }

        debug!(%from, %to, explored = arena.len(), "No path within depth bound");
        Ok(None)
    }

    /// Nearest nodes to `query`, most similar first, at most `top_k`.
    /// `min_similarity` filters in distance space as `distance <= 1 - min`.
    pub async fn similarity_search(
        &self,
        query: &[f32],
        top_k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<Node>> {
        Ok(self
            .scored_similarity_search(query, None, top_k, min_similarity)
            .await?
            .into_iter()
            .map(|(node, _)| node)
            .collect())
    }

    /// Same as [`similarity_search`](Self::similarity_search) but keeps each
    /// node's cosine similarity, optionally restricted to one type category.
    pub async fn scored_similarity_search(
        &self,
        query: &[f32],
        type_category: Option<&str>,
        top_k: usize,
        min_similarity: Option<f64>,
    ) -> Result<Vec<(Node, f64)>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let max_distance = min_similarity.map(|s| 1.0 - s);
        let mut matches = self.store.vector_search(query, type_category, top_k).await?;
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        Ok(matches
            .into_iter()
            .filter(|m| max_distance.map_or(true, |max| m.distance <= max))
            .take(top_k)
            .map(|m| {
                let similarity = m.similarity();
                (m.node, similarity)
            })
            .collect())
    }
}
