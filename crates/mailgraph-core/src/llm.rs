use async_trait::async_trait;

use crate::error::Result;

/// Completion and embedding calls. Failures are absorbed by callers: the
/// pipeline degrades to header-only extraction and the resolver substitutes a
/// zero vector.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn embedding_dimension(&self) -> usize;
}
