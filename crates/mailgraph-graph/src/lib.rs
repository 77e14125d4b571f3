pub mod memory;
pub mod similarity;
pub mod store;
pub mod traversal;

pub use memory::InMemoryGraphStore;
pub use similarity::{cosine_distance, cosine_similarity};
pub use store::Neo4jGraphStore;
pub use traversal::{GraphTraversal, MAX_PATH_DEPTH};
